use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use geochat_sync::config::Settings;
use geochat_sync::service::auth::{HttpTokenValidator, TokenValidator};
use geochat_sync::service::delivery::MemoryMessageStore;
use geochat_sync::store::MemoryStore;
use geochat_sync::tasks::sweeper::spawn_sweeper;
use geochat_sync::GeoChatServer;

/// 实时聊天同步网关 / Real-time chat sync gateway
#[derive(Parser, Debug)]
#[command(name = "geochat-sync", version, about)]
struct Args {
    /// 配置文件路径 / Configuration file path
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;
    geochat_sync::init_tracing(&settings.logging.level)?;

    let store = Arc::new(MemoryStore::new());
    let messages = Arc::new(MemoryMessageStore::new());
    let mut server = GeoChatServer::new(store.clone(), messages, settings.clone());

    if settings.auth.enabled {
        let validator: Arc<dyn TokenValidator> =
            Arc::new(HttpTokenValidator::new(&settings.auth)?);
        server = server.with_auth(validator);
        info!("🔑 auth center enabled at {}", settings.auth.center_url);
    } else {
        info!("🔑 dev token validator active (auth center disabled)");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_sweeper(
        server.clone(),
        store,
        settings.server.heartbeat_timeout_ms,
        shutdown_rx,
    );

    let host = settings.server.host.clone();
    let port = settings.server.ws_port;
    tokio::select! {
        res = server.run(host, port) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("👋 shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    }
    Ok(())
}
