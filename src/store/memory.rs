use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use super::{SharedStore, StoreError};
use crate::domain::keys::Key;

/// 存储值 / Stored value
enum Value {
    Str(String),
    Zset(BTreeMap<String, i64>),
    Window(VecDeque<Instant>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |t| t <= now)
    }
}

/// 进程内共享存储实现 / In-process shared store implementation
///
/// 每个操作通过分片锁独占条目,构成单原子单元 / Each op takes the shard
/// lock for its entry, forming a single atomic unit. TTL基于tokio时钟,
/// 测试可在暂停时钟下推进 / TTLs use the tokio clock so tests can run
/// under a paused runtime.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    epoch_ms: i64,
    start: Instant,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            epoch_ms: chrono::Utc::now().timestamp_millis(),
            start: Instant::now(),
        }
    }

    fn purge_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, e| e.expired(now));
    }

    /// 清扫全部过期键,返回清除数 / Sweep all expired keys
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().expired(now))
            .map(|e| e.key().clone())
            .collect();
        let mut removed = 0;
        for k in stale {
            if self.entries.remove_if(&k, |_, e| e.expired(now)).is_some() {
                removed += 1;
            }
        }
        removed
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn now_ms(&self) -> i64 {
        self.epoch_ms + self.start.elapsed().as_millis() as i64
    }

    async fn set_with_ttl(
        &self,
        key: &Key,
        value: String,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &Key) -> Result<Option<String>, StoreError> {
        let k = key.to_string();
        self.purge_if_expired(&k);
        match self.entries.get(&k) {
            None => Ok(None),
            Some(e) => match &e.value {
                Value::Str(s) => Ok(Some(s.clone())),
                _ => Err(StoreError::WrongType(k)),
            },
        }
    }

    async fn delete(&self, key: &Key) -> Result<bool, StoreError> {
        let k = key.to_string();
        self.purge_if_expired(&k);
        Ok(self.entries.remove(&k).is_some())
    }

    async fn zadd(&self, key: &Key, member: &str, score: i64) -> Result<(), StoreError> {
        let k = key.to_string();
        self.purge_if_expired(&k);
        let mut entry = self.entries.entry(k.clone()).or_insert_with(|| Entry {
            value: Value::Zset(BTreeMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Zset(m) => {
                m.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(StoreError::WrongType(k)),
        }
    }

    async fn zrem(&self, key: &Key, member: &str) -> Result<bool, StoreError> {
        let k = key.to_string();
        self.purge_if_expired(&k);
        match self.entries.get_mut(&k) {
            None => Ok(false),
            Some(mut e) => match &mut e.value {
                Value::Zset(m) => Ok(m.remove(member).is_some()),
                _ => Err(StoreError::WrongType(k)),
            },
        }
    }

    async fn zrange_by_min_score(
        &self,
        key: &Key,
        min_score: i64,
    ) -> Result<Vec<String>, StoreError> {
        let k = key.to_string();
        self.purge_if_expired(&k);
        match self.entries.get(&k) {
            None => Ok(Vec::new()),
            Some(e) => match &e.value {
                Value::Zset(m) => {
                    let mut members: Vec<(&String, &i64)> =
                        m.iter().filter(|(_, s)| **s >= min_score).collect();
                    members.sort_by_key(|(_, s)| **s);
                    Ok(members.into_iter().map(|(name, _)| name.clone()).collect())
                }
                _ => Err(StoreError::WrongType(k)),
            },
        }
    }

    async fn zscore(&self, key: &Key, member: &str) -> Result<Option<i64>, StoreError> {
        let k = key.to_string();
        self.purge_if_expired(&k);
        match self.entries.get(&k) {
            None => Ok(None),
            Some(e) => match &e.value {
                Value::Zset(m) => Ok(m.get(member).copied()),
                _ => Err(StoreError::WrongType(k)),
            },
        }
    }

    async fn zremrange_below(&self, key: &Key, below_score: i64) -> Result<usize, StoreError> {
        let k = key.to_string();
        self.purge_if_expired(&k);
        match self.entries.get_mut(&k) {
            None => Ok(0),
            Some(mut e) => match &mut e.value {
                Value::Zset(m) => {
                    let before = m.len();
                    m.retain(|_, s| *s >= below_score);
                    Ok(before - m.len())
                }
                _ => Err(StoreError::WrongType(k)),
            },
        }
    }

    async fn sliding_window_count(
        &self,
        key: &Key,
        window: Duration,
    ) -> Result<usize, StoreError> {
        let k = key.to_string();
        self.purge_if_expired(&k);
        let now = Instant::now();
        let mut entry = self.entries.entry(k.clone()).or_insert_with(|| Entry {
            value: Value::Window(VecDeque::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Window(log) => {
                // 清理、追加、计数、续期,持锁期间一次完成 / Prune, append,
                // count, refresh expiry in one pass under the entry lock
                if let Some(cutoff) = now.checked_sub(window) {
                    while log.front().map_or(false, |t| *t <= cutoff) {
                        log.pop_front();
                    }
                }
                log.push_back(now);
                let count = log.len();
                entry.expires_at = Some(now + window);
                Ok(count)
            }
            _ => Err(StoreError::WrongType(k)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn kv_expires_after_ttl() {
        let store = MemoryStore::new();
        let key = Key::presence("u1");
        store
            .set_with_ttl(&key, "online".into(), Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("online"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_window_prunes_and_counts() {
        let store = MemoryStore::new();
        let key = Key::rate_limit("send:u1");
        let window = Duration::from_secs(60);

        for expected in 1..=5 {
            let count = store.sliding_window_count(&key, window).await.unwrap();
            assert_eq!(count, expected);
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        let count = store.sliding_window_count(&key, window).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zset_score_range_and_prune() {
        let store = MemoryStore::new();
        let key = Key::room_presence("r1");
        store.zadd(&key, "u1", 100).await.unwrap();
        store.zadd(&key, "u2", 200).await.unwrap();
        store.zadd(&key, "u3", 300).await.unwrap();

        let fresh = store.zrange_by_min_score(&key, 150).await.unwrap();
        assert_eq!(fresh, vec!["u2".to_string(), "u3".to_string()]);

        let removed = store.zremrange_below(&key, 250).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.zscore(&key, "u3").await.unwrap(), Some(300));
        assert_eq!(store.zscore(&key, "u1").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn now_ms_advances_with_clock() {
        let store = MemoryStore::new();
        let before = store.now_ms();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.now_ms() - before, 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_keys() {
        let store = MemoryStore::new();
        store
            .set_with_ttl(&Key::typing("r1", "u1"), "1".into(), Duration::from_secs(5))
            .await
            .unwrap();
        store
            .set_with_ttl(&Key::presence("u1"), "1".into(), Duration::from_secs(300))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.sweep_expired(), 1);
    }
}
