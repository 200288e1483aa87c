use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};

use crate::server::GeoChatServer;
use crate::store::MemoryStore;

/// 按超时档位选择清扫间隔,下限1ms(`interval` 不接受零周期)
/// Sweep interval tier for a timeout; floored at 1ms because
/// `interval` rejects a zero period.
fn sweep_interval_for(timeout_ms: u64) -> u64 {
    let tier = if timeout_ms <= 1000 {
        timeout_ms / 2
    } else if timeout_ms <= 10000 {
        1000
    } else {
        5000
    };
    tier.max(1)
}

/// 周期清扫任务 / Periodic sweeper task
///
/// 清理静默连接、过期存储键与房间在线集合中的陈旧分值
/// / Closes silent connections, drops expired store keys, and prunes
/// stale scores from room online sets.
pub fn spawn_sweeper(
    server: GeoChatServer,
    store: Arc<MemoryStore>,
    timeout_ms: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let sweep_interval_ms = sweep_interval_for(timeout_ms);
        tracing::info!(
            "⏰ Sweep interval set to {}ms for timeout {}ms",
            sweep_interval_ms,
            timeout_ms
        );
        let mut sweep_interval = interval(Duration::from_millis(sweep_interval_ms));
        loop {
            tokio::select! {
                _ = sweep_interval.tick() => {
                    server.cleanup_timeout_connections(timeout_ms).await;
                    let removed = store.sweep_expired();
                    if removed > 0 {
                        tracing::debug!("🧹 swept {} expired store keys", removed);
                    }
                    if let Err(e) = server.presence.prune_stale().await {
                        tracing::warn!("⚠️  presence prune failed: {}", e);
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_interval_never_zero() {
        assert_eq!(sweep_interval_for(0), 1);
        assert_eq!(sweep_interval_for(1), 1);
        assert_eq!(sweep_interval_for(1000), 500);
        assert_eq!(sweep_interval_for(5000), 1000);
        assert_eq!(sweep_interval_for(60_000), 5000);
    }
}
