use dashmap::{DashMap, DashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info};

use crate::config::Settings;
use crate::domain::event::ServerEvent;
use crate::service::auth::{DevTokenValidator, TokenValidator};
use crate::service::delivery::MessageStore;
use crate::service::presence::PresenceTracker;
use crate::service::rate_limit::RateLimiter;
use crate::service::typing::TypingService;
use crate::store::SharedStore;

/// 会话连接信息 / Session connection information
///
/// 订阅集合由本会话独占,其他会话不受影响 / The subscription set is
/// owned exclusively by this session.
#[derive(Clone)]
pub struct SessionConn {
    pub session_id: String,
    /// 鉴权完成前为 None / None until auth completes
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub addr: SocketAddr,
    pub sender: mpsc::UnboundedSender<Message>,
    pub subscriptions: Arc<DashSet<String>>,
    pub last_heartbeat: Arc<parking_lot::Mutex<Instant>>,
}

/// 网关全局状态 / Gateway global state
#[derive(Clone)]
pub struct GeoChatServer {
    pub connections: Arc<DashMap<String, SessionConn>>, // 会话连接 / Session connections
    pub room_sessions: Arc<DashMap<String, DashSet<String>>>, // 房间到会话集合 / Room -> session ids
    pub user_sessions: Arc<DashMap<String, DashSet<String>>>, // 用户到会话集合 / User -> session ids
    pub store: Arc<dyn SharedStore>,                    // 共享低延迟存储 / Shared store
    pub presence: Arc<PresenceTracker>,                 // 在线状态 / Presence
    pub typing: Arc<TypingService>,                     // 输入状态 / Typing
    pub rate_limiter: Arc<RateLimiter>,                 // 限流 / Rate limiter
    pub messages: Arc<dyn MessageStore>,                // 外部消息存储 / External message store
    pub auth: Arc<dyn TokenValidator>,                  // 令牌校验 / Token validator
    pub settings: Settings,
}

impl GeoChatServer {
    pub fn new(
        store: Arc<dyn SharedStore>,
        messages: Arc<dyn MessageStore>,
        settings: Settings,
    ) -> Self {
        let presence = Arc::new(PresenceTracker::with_windows(
            store.clone(),
            Duration::from_secs(settings.presence.ttl_secs),
            Duration::from_secs(settings.presence.grace_secs),
            Duration::from_secs(settings.presence.freshness_secs),
        ));
        let typing = Arc::new(TypingService::new(store.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(store.clone()));
        Self {
            connections: Arc::new(DashMap::new()),
            room_sessions: Arc::new(DashMap::new()),
            user_sessions: Arc::new(DashMap::new()),
            store,
            presence,
            typing,
            rate_limiter,
            messages,
            auth: Arc::new(DevTokenValidator),
            settings,
        }
    }

    /// 配置令牌校验器 / Configure token validator
    pub fn with_auth(mut self, auth: Arc<dyn TokenValidator>) -> Self {
        self.auth = auth;
        self
    }

    /// 会话的已鉴权用户 / Authenticated user of a session
    pub fn session_user(&self, session_id: &str) -> Option<String> {
        self.connections
            .get(session_id)
            .and_then(|c| c.user_id.clone())
    }

    /// 更新会话心跳 / Update session heartbeat
    pub fn update_heartbeat(&self, session_id: &str) {
        if let Some(conn) = self.connections.get(session_id) {
            *conn.last_heartbeat.lock() = Instant::now();
        }
    }

    /// 清理静默超时连接 / Clean up silent timed-out connections
    pub async fn cleanup_timeout_connections(&self, timeout_ms: u64) {
        let mut stale = Vec::new();
        for entry in self.connections.iter() {
            if entry.last_heartbeat.lock().elapsed().as_millis() > timeout_ms as u128 {
                stale.push(entry.key().clone());
            }
        }
        for session_id in stale {
            if let Err(e) = self.send_close(&session_id).await {
                error!("Failed to send close to {}: {}", session_id, e);
            }
            self.drop_session(&session_id);
            info!("🧹 Cleaned up timeout session: {}", session_id);
        }
    }

    /// 移除会话并解除全部索引;用户最后一个会话断开时启动宽限期
    /// Remove a session and unwind its indexes; the user's last session
    /// starts the disconnect grace window.
    pub fn drop_session(&self, session_id: &str) {
        let Some((_, conn)) = self.connections.remove(session_id) else {
            return;
        };
        for room_id in conn.subscriptions.iter() {
            if let Some(set) = self.room_sessions.get(room_id.key()) {
                set.remove(session_id);
            }
        }
        if let Some(user_id) = &conn.user_id {
            let last_session = match self.user_sessions.get_mut(user_id) {
                Some(set) => {
                    set.remove(session_id);
                    set.is_empty()
                }
                None => true,
            };
            if last_session {
                self.user_sessions.remove(user_id);
                self.presence.start_disconnect_grace(user_id);
            }
        }
    }

    /// 转发在线状态事件到相关房间 / Forward presence events to the rooms
    /// the user belongs to
    pub fn spawn_presence_forwarder(&self) {
        let server = self.clone();
        let mut rx = self.presence.subscribe();
        tokio::spawn(async move {
            while let Ok(record) = rx.recv().await {
                let rooms = server.presence.rooms_of(&record.user_id);
                let event = ServerEvent::Presence {
                    record: record.clone(),
                };
                for room_id in rooms {
                    server
                        .broadcast_to_room(&room_id, &event, None, Some(&record.user_id))
                        .await;
                }
            }
        });
    }
}
