use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::server::GeoChatServer;

/// 启动WS监听 / Start the WS listener
impl GeoChatServer {
    pub async fn run(&self, host: String, port: u16) -> Result<()> {
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr).await?;
        info!("🚀 geochat-sync gateway starting on {}", addr);
        info!("📡 Waiting for connections...");

        self.spawn_presence_forwarder();

        while let Ok((stream, peer_addr)) = listener.accept().await {
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    crate::ws::connection::handle_connection(stream, peer_addr, server).await
                {
                    tracing::error!("Connection error from {}: {}", peer_addr, e);
                }
            });
        }

        Ok(())
    }
}
