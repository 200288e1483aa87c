use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::domain::keys::Key;
use crate::store::{SharedStore, StoreError};

/// 限流判定结果 / Rate limit decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
}

/// 滑动窗口日志限流器 / Sliding-window-log rate limiter
///
/// 清理、追加、计数、续期四步由存储作为单个原子操作执行;两个并发调用
/// 不可能同时读到过期计数而双双放行 / The four sub-steps execute as one
/// atomic store op, so two concurrent callers can never both observe a
/// stale count and both be admitted over-limit.
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// 存储不可用时错误传播(默认拒绝) / Store failure propagates
    /// (fail-closed by default).
    pub async fn check(
        &self,
        bucket: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitDecision, StoreError> {
        let key = Key::rate_limit(bucket);
        let count = self.store.sliding_window_count(&key, window).await? as u32;
        let decision = RateLimitDecision {
            allowed: count <= limit,
            remaining: limit.saturating_sub(count),
        };
        debug!(
            "🚦 rate limit {}: count={} limit={} allowed={}",
            bucket, count, limit, decision.allowed
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn admits_until_limit_then_denies() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let window = Duration::from_secs(60);

        // 前10次放行,remaining 从9递减到0 / Calls 1-10 allowed,
        // remaining strictly decreasing from 9 to 0
        for i in 0..10u32 {
            let d = limiter.check("send:u1", 10, window).await.unwrap();
            assert!(d.allowed, "call {} should be allowed", i + 1);
            assert_eq!(d.remaining, 9 - i);
        }

        // 第11次拒绝 / Call 11 denied
        let d = limiter.check("send:u1", 10, window).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_elapse_resets_budget() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let window = Duration::from_secs(60);

        for _ in 0..11 {
            limiter.check("send:u1", 10, window).await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        // 窗口滑过后等同于首次调用 / Behaves like call 1 again
        let d = limiter.check("send:u1", 10, window).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn buckets_are_independent() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let window = Duration::from_secs(60);

        for _ in 0..10 {
            limiter.check("send:u1", 10, window).await.unwrap();
        }
        let d = limiter.check("send:u2", 10, window).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 9);
    }
}
