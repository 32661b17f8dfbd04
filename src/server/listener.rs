use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::http::connection::Connection;

pub async fn run(listen_addr: &str, server: Arc<ServerConfig>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Listening on {}", listen_addr);

    loop {
        let (socket, peer) = listener.accept().await?;
        tracing::debug!("Accepted connection from {}", peer);

        if let Err(e) = socket.set_nodelay(true) {
            tracing::warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let conn = Connection::new(socket, server).with_peer(peer);
            if let Err(e) = conn.run().await {
                tracing::error!("Connection error from {}: {}", peer, e);
            }
        });
    }
}
