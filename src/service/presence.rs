use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::keys::Key;
use crate::domain::presence::{PresenceRecord, PresenceStatus};
use crate::store::{SharedStore, StoreError};

/// 上线附带信息 / Connection info supplied on set_online
#[derive(Debug, Clone, Default)]
pub struct PresenceInfo {
    pub device_id: Option<String>,
}

/// 在线状态跟踪器 / Presence tracker
///
/// 记录带心跳TTL,房间在线集合以更新时间为分值;断线先进入宽限期,
/// 宽限期内重连则对其他成员完全不可见
/// / Records carry a heartbeat TTL; room online sets are scored by
/// update timestamp. Disconnects enter a grace window first; a
/// reconnect inside the window is invisible to other members.
pub struct PresenceTracker {
    store: Arc<dyn SharedStore>,
    /// 用户到房间的二级索引 / User -> rooms secondary index
    user_rooms: DashMap<String, DashSet<String>>,
    /// 已知房间,供清扫任务遍历 / Known rooms for the sweeper
    rooms: DashSet<String>,
    grace_gen: AtomicU64,
    events: broadcast::Sender<PresenceRecord>,
    ttl: Duration,
    grace: Duration,
    freshness: Duration,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self::with_windows(
            store,
            Duration::from_secs(300),
            Duration::from_secs(30),
            Duration::from_secs(300),
        )
    }

    pub fn with_windows(
        store: Arc<dyn SharedStore>,
        ttl: Duration,
        grace: Duration,
        freshness: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            user_rooms: DashMap::new(),
            rooms: DashSet::new(),
            grace_gen: AtomicU64::new(0),
            events,
            ttl,
            grace,
            freshness,
        }
    }

    /// 订阅状态变更事件 / Subscribe to presence-changed events
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceRecord> {
        self.events.subscribe()
    }

    /// 用户所在房间快照 / Snapshot of the rooms a user is registered in
    pub fn rooms_of(&self, user_id: &str) -> Vec<String> {
        self.user_rooms
            .get(user_id)
            .map(|set| set.iter().map(|r| r.clone()).collect())
            .unwrap_or_default()
    }

    /// 上线或心跳刷新 / Set online, also used as heartbeat refresh
    pub async fn set_online(
        &self,
        user_id: &str,
        info: PresenceInfo,
    ) -> Result<PresenceRecord, StoreError> {
        let now = self.store.now_ms();
        let record = PresenceRecord {
            user_id: user_id.to_string(),
            status: PresenceStatus::Online,
            last_seen_at: now,
            device_id: info.device_id,
        };
        let payload = serde_json::to_string(&record)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.store
            .set_with_ttl(&Key::presence(user_id), payload, self.ttl)
            .await?;

        // 宽限期内重连,取消下线 / Reconnect inside grace cancels offline
        if self.store.delete(&Key::disconnect_grace(user_id)).await? {
            debug!("🔁 grace cancelled for {}", user_id);
        }

        for room_id in self.rooms_of(user_id) {
            self.store
                .zadd(&Key::room_presence(&room_id), user_id, now)
                .await?;
        }
        let _ = self.events.send(record.clone());
        Ok(record)
    }

    /// 下线 / Set offline
    pub async fn set_offline(&self, user_id: &str) -> Result<(), StoreError> {
        self.store.delete(&Key::presence(user_id)).await?;
        for room_id in self.rooms_of(user_id) {
            self.store
                .zrem(&Key::room_presence(&room_id), user_id)
                .await?;
        }
        let record = PresenceRecord {
            user_id: user_id.to_string(),
            status: PresenceStatus::Offline,
            last_seen_at: self.store.now_ms(),
            device_id: None,
        };
        let _ = self.events.send(record);
        info!("📴 {} offline", user_id);
        Ok(())
    }

    pub async fn get_presence(
        &self,
        user_id: &str,
    ) -> Result<Option<PresenceRecord>, StoreError> {
        match self.store.get(&Key::presence(user_id)).await? {
            None => Ok(None),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(rec) => Ok(Some(rec)),
                Err(e) => {
                    warn!("⚠️  corrupt presence record for {}: {}", user_id, e);
                    Ok(None)
                }
            },
        }
    }

    /// 房间在线用户:成员资格与新鲜度窗口的交集;未到硬TTL但已过新鲜度的
    /// 条目也被排除 / Online users: room membership intersected with the
    /// freshness window; stale-but-not-yet-expired entries are excluded.
    pub async fn get_online_users_in_room(
        &self,
        room_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let min_score = self.store.now_ms() - self.freshness.as_millis() as i64;
        self.store
            .zrange_by_min_score(&Key::room_presence(room_id), min_score)
            .await
    }

    pub async fn add_user_to_room(&self, user_id: &str, room_id: &str) -> Result<(), StoreError> {
        self.rooms.insert(room_id.to_string());
        self.user_rooms
            .entry(user_id.to_string())
            .or_default()
            .insert(room_id.to_string());
        if self.get_presence(user_id).await?.is_some() {
            let now = self.store.now_ms();
            self.store
                .zadd(&Key::room_presence(room_id), user_id, now)
                .await?;
        }
        Ok(())
    }

    pub async fn remove_user_from_room(
        &self,
        user_id: &str,
        room_id: &str,
    ) -> Result<(), StoreError> {
        if let Some(set) = self.user_rooms.get(user_id) {
            set.remove(room_id);
        }
        self.store
            .zrem(&Key::room_presence(room_id), user_id)
            .await?;
        Ok(())
    }

    /// 传输层断开:启动宽限期而不是立即下线 / Transport loss: start the
    /// grace window instead of an immediate offline transition.
    pub fn start_disconnect_grace(self: &Arc<Self>, user_id: &str) {
        let generation = self.grace_gen.fetch_add(1, Ordering::Relaxed) + 1;
        let tracker = self.clone();
        let user = user_id.to_string();
        tokio::spawn(async move {
            let key = Key::disconnect_grace(&user);
            // 键TTL必须长于定时器,否则唤醒时代次已随键过期而不可读;
            // 触发后由下方的显式删除回收
            // The key TTL must outlive the timer or the generation is
            // already gone at wake time; the explicit delete below
            // reclaims the key once the timer fires.
            if let Err(e) = tracker
                .store
                .set_with_ttl(&key, generation.to_string(), tracker.grace * 2)
                .await
            {
                warn!("⚠️  failed to record grace for {}: {}", user, e);
                return;
            }
            debug!("⏳ grace started for {} (gen {})", user, generation);
            tokio::time::sleep(tracker.grace).await;

            // 仅当代次未被后续断开覆盖且未被重连取消时才下线 / Only fire
            // when the generation was neither superseded nor cancelled
            match tracker.store.get(&key).await {
                Ok(Some(current)) if current == generation.to_string() => {
                    let _ = tracker.store.delete(&key).await;
                    if let Err(e) = tracker.set_offline(&user).await {
                        warn!("⚠️  offline transition failed for {}: {}", user, e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("⚠️  grace check failed for {}: {}", user, e),
            }
        });
    }

    /// 清理各房间过期分值 / Prune stale scores from room online sets
    pub async fn prune_stale(&self) -> Result<usize, StoreError> {
        let min_score = self.store.now_ms() - self.freshness.as_millis() as i64;
        let mut pruned = 0;
        for room_id in self.rooms.iter() {
            pruned += self
                .store
                .zremrange_below(&Key::room_presence(&room_id), min_score)
                .await?;
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> Arc<PresenceTracker> {
        Arc::new(PresenceTracker::new(Arc::new(
            crate::store::MemoryStore::new(),
        )))
    }

    fn drain(rx: &mut broadcast::Receiver<PresenceRecord>) -> Vec<PresenceRecord> {
        let mut out = Vec::new();
        while let Ok(rec) = rx.try_recv() {
            out.push(rec);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn unrefreshed_record_expires_from_room_set() {
        let t = tracker();
        t.add_user_to_room("u1", "r1").await.unwrap();
        t.set_online("u1", PresenceInfo::default()).await.unwrap();
        assert_eq!(
            t.get_online_users_in_room("r1").await.unwrap(),
            vec!["u1".to_string()]
        );

        // 5分钟无心跳 / 5 minutes without a heartbeat refresh
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(t.get_online_users_in_room("r1").await.unwrap().is_empty());
        assert!(t.get_presence("u1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_refresh_keeps_user_online() {
        let t = tracker();
        t.add_user_to_room("u1", "r1").await.unwrap();
        t.set_online("u1", PresenceInfo::default()).await.unwrap();

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(200)).await;
            t.set_online("u1", PresenceInfo::default()).await.unwrap();
        }
        assert_eq!(
            t.get_online_users_in_room("r1").await.unwrap(),
            vec!["u1".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_produces_no_flap() {
        let t = tracker();
        t.add_user_to_room("u1", "r1").await.unwrap();
        t.set_online("u1", PresenceInfo::default()).await.unwrap();
        let mut rx = t.subscribe();

        t.start_disconnect_grace("u1");
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        t.set_online("u1", PresenceInfo::default()).await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;

        let events = drain(&mut rx);
        assert!(
            events.iter().all(|e| e.status != PresenceStatus::Offline),
            "no offline transition may be visible: {:?}",
            events
        );
        assert_eq!(
            t.get_online_users_in_room("r1").await.unwrap(),
            vec!["u1".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missed_grace_produces_exactly_one_offline() {
        let t = tracker();
        t.add_user_to_room("u1", "r1").await.unwrap();
        t.set_online("u1", PresenceInfo::default()).await.unwrap();
        let mut rx = t.subscribe();

        t.start_disconnect_grace("u1");
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(31)).await;
        // 让宽限任务运行完 / Let the grace task complete
        tokio::task::yield_now().await;

        let offline: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.status == PresenceStatus::Offline)
            .collect();
        assert_eq!(offline.len(), 1);
        assert!(t.get_online_users_in_room("r1").await.unwrap().is_empty());
        // 宽限键在触发后被回收 / The grace key is reclaimed after firing
        assert!(t
            .store
            .get(&Key::disconnect_grace("u1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_grace_timer_is_superseded() {
        let t = tracker();
        t.set_online("u1", PresenceInfo::default()).await.unwrap();

        // 两次断开,旧定时器不得提前下线 / Two disconnects; the stale
        // timer must not fire the offline transition early
        t.start_disconnect_grace("u1");
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(20)).await;
        t.set_online("u1", PresenceInfo::default()).await.unwrap();
        t.start_disconnect_grace("u1");
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(t.get_presence("u1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(16)).await;
        tokio::task::yield_now().await;
        assert!(t.get_presence("u1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_room_removes_from_online_set() {
        let t = tracker();
        t.add_user_to_room("u1", "r1").await.unwrap();
        t.set_online("u1", PresenceInfo::default()).await.unwrap();
        t.remove_user_from_room("u1", "r1").await.unwrap();
        assert!(t.get_online_users_in_room("r1").await.unwrap().is_empty());
    }
}
