use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::domain::keys::Key;

pub mod memory;

pub use memory::MemoryStore;

/// 共享存储错误 / Shared store errors
///
/// 存储不可用时错误向上传播,调用方绝不默认"允许"或"在线"
/// / Unavailability propagates; callers must not assume a default
/// "allowed"/"online" outcome.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("共享存储不可用 / shared store unavailable: {0}")]
    Unavailable(String),

    #[error("键类型不匹配 / wrong value type for key {0}")]
    WrongType(String),
}

/// 共享低延迟存储 / Shared low-latency store
///
/// 每个读-改-写序列都是单个trait调用,在实现内部作为一个原子单元执行
/// / Every read-modify-write sequence is a single trait call executed
/// atomically inside the implementation. 多实例部署下非原子的多步序列是
/// 正确性缺陷 / Unsynchronized multi-step sequences are a correctness
/// bug under multi-instance deployment.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// 当前毫秒时间戳,由存储自己的时钟产生,用作排序分值
    /// Current epoch millis from the store's own clock, used as scores.
    fn now_ms(&self) -> i64;

    async fn set_with_ttl(&self, key: &Key, value: String, ttl: Duration)
        -> Result<(), StoreError>;

    async fn get(&self, key: &Key) -> Result<Option<String>, StoreError>;

    /// 返回键是否存在 / Returns whether the key existed
    async fn delete(&self, key: &Key) -> Result<bool, StoreError>;

    /// 有序集合写入,分值相同则覆盖 / Scored-set upsert
    async fn zadd(&self, key: &Key, member: &str, score: i64) -> Result<(), StoreError>;

    async fn zrem(&self, key: &Key, member: &str) -> Result<bool, StoreError>;

    /// 分值不低于 `min_score` 的成员 / Members scored at or above `min_score`
    async fn zrange_by_min_score(&self, key: &Key, min_score: i64)
        -> Result<Vec<String>, StoreError>;

    async fn zscore(&self, key: &Key, member: &str) -> Result<Option<i64>, StoreError>;

    /// 删除分值低于 `below_score` 的成员,返回删除数
    /// Remove members scored below `below_score`, returning the count.
    async fn zremrange_below(&self, key: &Key, below_score: i64) -> Result<usize, StoreError>;

    /// 滑动窗口日志:清理过期条目、追加当前时刻、计数、刷新键TTL为窗口长度,
    /// 整体为一个原子单元 / Sliding-window log: prune entries older than the
    /// window, append now, count, refresh the key's TTL to the window —
    /// as one atomic unit.
    async fn sliding_window_count(&self, key: &Key, window: Duration)
        -> Result<usize, StoreError>;
}
