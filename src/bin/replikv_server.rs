use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use replikv::config::Config;
use replikv::infrastructure::replica::Replica;
use replikv::server;

/// The replica identifies itself to peers by SOCKET_ADDRESS but listens on
/// all interfaces at that port, so container aliases resolve either way.
fn bind_address(socket_address: &str) -> String {
    match socket_address.rsplit_once(':') {
        Some((_, port)) => format!("0.0.0.0:{}", port),
        None => socket_address.to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        "starting replica {} with {} configured peers",
        config.socket_address,
        config.view.len()
    );

    let replica = Arc::new(Replica::new(&config)?);
    let app = server::router(replica.clone());

    let listener = TcpListener::bind(bind_address(&config.socket_address)).await?;
    replica.bootstrap().await;
    info!("replica {} listening", config.socket_address);

    axum::serve(listener, app).await?;
    Ok(())
}
