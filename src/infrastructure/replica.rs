// Per-replica ownership of all mutable state. Every component the request
// path touches (view, clock, store, key-location index, shard table, ring,
// own shard id) lives in one record behind one lock; handlers take the lock
// across their check-and-mutate section and issue outbound RPCs after
// releasing it.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::infrastructure::hash_ring::{ConsistentHashRing, DEFAULT_VIRTUAL_ANCHORS};
use crate::infrastructure::messages::{KeyLocationMap, ShardTable, StateSnapshot};
use crate::infrastructure::peer_client::PeerClient;
use crate::infrastructure::sharding;
use crate::infrastructure::vector_clock::VectorClock;

#[derive(Debug)]
pub struct ReplicaState {
    pub view: BTreeSet<String>,
    pub clock: VectorClock,
    pub store: BTreeMap<String, Value>,
    pub key_locations: KeyLocationMap,
    pub shard_table: ShardTable,
    pub ring: ConsistentHashRing,
    pub self_shard: String,
}

impl ReplicaState {
    /// Every other member of this replica's own shard.
    pub fn shard_peers(&self, self_address: &str) -> Vec<String> {
        self.shard_table
            .get(&self.self_shard)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| m.as_str() != self_address)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every other replica in the view.
    pub fn view_peers(&self, self_address: &str) -> Vec<String> {
        self.view
            .iter()
            .filter(|m| m.as_str() != self_address)
            .cloned()
            .collect()
    }

    /// Members of an arbitrary shard, excluding this replica.
    pub fn shard_members_except_self(&self, shard: &str, self_address: &str) -> Vec<String> {
        self.shard_table
            .get(shard)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| m.as_str() != self_address)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct Replica {
    pub address: String,
    pub state: RwLock<ReplicaState>,
    pub peers: PeerClient,
}

impl Replica {
    /// Build the initial state from configuration: the view (always
    /// containing this replica), a zeroed clock over it, and the shard
    /// layout. An absent shard count means one implicit shard spanning the
    /// whole view.
    pub fn new(config: &Config) -> AppResult<Self> {
        let mut view: BTreeSet<String> = config.view.iter().cloned().collect();
        view.insert(config.socket_address.clone());

        let (shard_table, ring) = match config.shard_count {
            Some(count) => {
                sharding::build_shard_layout(&view, count, DEFAULT_VIRTUAL_ANCHORS)
                    .map_err(|err| AppError::Config(err.to_string()))?
            }
            None => sharding::single_shard_layout(&view),
        };
        let self_shard = sharding::shard_of(&shard_table, &config.socket_address)
            .ok_or_else(|| {
                AppError::Config(format!(
                    "replica {} is not assigned to any shard",
                    config.socket_address
                ))
            })?;
        let key_locations = shard_table
            .keys()
            .map(|shard| (shard.clone(), BTreeSet::new()))
            .collect();
        let clock = VectorClock::zeroed(&view);

        Ok(Self {
            address: config.socket_address.clone(),
            state: RwLock::new(ReplicaState {
                view,
                clock,
                store: BTreeMap::new(),
                key_locations,
                shard_table,
                ring,
                self_shard,
            }),
            peers: PeerClient::new(config.socket_address.clone()),
        })
    }

    /// Startup sequencing: announce this replica to every configured peer,
    /// then adopt store and clock from the first in-shard peer that answers.
    pub async fn bootstrap(&self) {
        let (view_peers, shard_peers) = {
            let state = self.state.read().await;
            (
                state.view_peers(&self.address),
                state.shard_peers(&self.address),
            )
        };

        self.peers.blast_view_add(&view_peers, &self.address).await;

        if let Some(snapshot) = self.peers.pull_state(&shard_peers).await {
            let mut state = self.state.write().await;
            info!(
                "adopted {} keys from an in-shard peer at startup",
                snapshot.store.len()
            );
            state.store = snapshot.store;
            let mut clock = snapshot.vc;
            for address in &state.view {
                clock.insert_zero(address);
            }
            state.clock = clock;
        }
    }

    // View management ---------------------------------------------------

    /// Insert an address into the view locally. Returns false when it was
    /// already present.
    async fn insert_into_view(&self, address: &str) -> Option<Vec<String>> {
        let mut state = self.state.write().await;
        if state.view.contains(address) {
            return None;
        }
        state.view.insert(address.to_string());
        state.clock.insert_zero(address);
        info!("view-add: {} now has {} replicas", address, state.view.len());
        Some(state.view_peers(&self.address))
    }

    fn remove_from_view_locked(state: &mut ReplicaState, address: &str) -> bool {
        if !state.view.remove(address) {
            return false;
        }
        state.clock.remove(address);
        for members in state.shard_table.values_mut() {
            members.retain(|m| m != address);
        }
        true
    }

    /// Client-facing view add: local insertion plus broadcast fan-out.
    /// Returns true when the address was newly added.
    pub async fn view_add(&self, address: &str) -> bool {
        match self.insert_into_view(address).await {
            Some(peers) => {
                self.peers.blast_view_add(&peers, address).await;
                true
            }
            None => false,
        }
    }

    /// Broadcast recipient: same insertion, no re-broadcast.
    pub async fn apply_view_add(&self, address: &str) -> bool {
        self.insert_into_view(address).await.is_some()
    }

    pub async fn view_remove(&self, address: &str) -> AppResult<()> {
        let peers = {
            let mut state = self.state.write().await;
            if !Self::remove_from_view_locked(&mut state, address) {
                return Err(AppError::NotFound("View has no such replica".to_string()));
            }
            state.view_peers(&self.address)
        };
        self.peers.blast_view_delete(&peers, address).await;
        Ok(())
    }

    pub async fn apply_view_remove(&self, address: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        if !Self::remove_from_view_locked(&mut state, address) {
            return Err(AppError::NotFound("View has no such replica".to_string()));
        }
        Ok(())
    }

    /// Drop peers that stayed unreachable through the replication retry
    /// budget, then tell the rest of the view.
    pub async fn evict_unreachable(&self, dead: Vec<String>) {
        if dead.is_empty() {
            return;
        }
        let peers = {
            let mut state = self.state.write().await;
            for address in &dead {
                if Self::remove_from_view_locked(&mut state, address) {
                    warn!("evicting unreachable replica {} from the view", address);
                }
            }
            state.view_peers(&self.address)
        };
        for address in &dead {
            self.peers.blast_view_delete(&peers, address).await;
        }
    }

    pub async fn view_members(&self) -> Vec<String> {
        let state = self.state.read().await;
        state.view.iter().cloned().collect()
    }

    // Broadcast receipt -------------------------------------------------

    /// Entry-wise max merge of an incoming clock broadcast. Idempotent and
    /// safe under reordering, so replay does no harm.
    pub async fn merge_clock(&self, incoming: &VectorClock) {
        let mut state = self.state.write().await;
        state.clock.merge(incoming);
    }

    /// Record that `key` lives in `shard` (learned via broadcast).
    pub async fn record_key_location(&self, shard: &str, key: &str) {
        let mut state = self.state.write().await;
        state
            .key_locations
            .entry(shard.to_string())
            .or_default()
            .insert(key.to_string());
    }

    /// Store and clock for a joining in-shard peer.
    pub async fn state_snapshot(&self) -> StateSnapshot {
        let state = self.state.read().await;
        StateSnapshot {
            store: state.store.clone(),
            vc: state.clock.clone(),
        }
    }
}
