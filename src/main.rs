use std::sync::Arc;

use orderly::app::Hello;
use orderly::config::{Config, ServerConfig};
use orderly::server;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    let server_config = Arc::new(ServerConfig::from_config(&cfg, Hello));

    tokio::select! {
        res = server::listener::run(&cfg.listen_addr, server_config) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
