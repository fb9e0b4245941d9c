use serde::{Deserialize, Serialize};
use std::env;

use crate::error::{AppError, AppResult};

/// Startup configuration for one replica, read from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This replica's own `host:port` identity on the network.
    pub socket_address: String,
    /// Initial peer set, usually including this replica's own address.
    pub view: Vec<String>,
    /// Number of shards to build at startup. Absent means the deployment
    /// runs as a single implicit shard until an explicit reshard.
    pub shard_count: Option<usize>,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        let socket_address = env::var("SOCKET_ADDRESS")
            .map_err(|_| AppError::Config("SOCKET_ADDRESS is not set".to_string()))?;
        let view_raw =
            env::var("VIEW").map_err(|_| AppError::Config("VIEW is not set".to_string()))?;
        let view = view_raw
            .split(',')
            .map(|addr| addr.trim().to_string())
            .filter(|addr| !addr.is_empty())
            .collect();
        let shard_count = match env::var("SHARD_COUNT") {
            Ok(raw) => Some(raw.parse().map_err(|_| {
                AppError::Config(format!("SHARD_COUNT is not a valid count: {}", raw))
            })?),
            Err(_) => None,
        };

        Ok(Self {
            socket_address,
            view,
            shard_count,
        })
    }
}
