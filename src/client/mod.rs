//! 客户端同步引擎 / Client-side sync engine
//!
//! 协调存储、单写者房间任务、重连监督与输入协调
//! / Reconciliation store, single-writer room workers, reconnect
//! supervision and typing coordination.

pub mod reconnect;
pub mod room;
pub mod typing;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::event::{ClientEvent, RefreshOutcome, ServerEvent};
use crate::error::RefreshError;

pub use reconnect::{ConnectionState, Connector, ReconnectPolicy, ReconnectSupervisor};
pub use room::{RoomEntry, RoomSnapshot, RoomState};
pub use typing::TypingCoordinator;
pub use worker::{spawn_room_worker, RoomCommand, RoomHandle};

/// 刷新成功返回的令牌对 / Token pair returned by a successful refresh
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// 客户端会话句柄 / Client session handle
///
/// 令牌刷新与聊天流量复用同一连接;关联ID把带内响应配回等待者,刷新
/// 期间套接字保持可用
/// / Token refresh shares the chat connection; correlation ids match
/// in-band responses back to their waiters while the socket stays
/// usable for traffic.
pub struct ClientHandle {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    pending_refresh: Arc<DashMap<String, oneshot::Sender<RefreshOutcome>>>,
}

impl ClientHandle {
    pub fn new(outbound: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self {
            outbound,
            pending_refresh: Arc::new(DashMap::new()),
        }
    }

    pub fn outbound(&self) -> mpsc::UnboundedSender<ClientEvent> {
        self.outbound.clone()
    }

    /// 带内令牌刷新 / In-band token refresh
    ///
    /// 超时后清理等待者;迟到的响应按未知关联ID丢弃
    /// Cleans up the waiter on timeout; a late response is dropped as
    /// an unknown correlation id.
    pub async fn refresh_token(
        &self,
        refresh_token: &str,
        timeout: Duration,
    ) -> Result<TokenPair, RefreshError> {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_refresh.insert(correlation_id.clone(), tx);

        if self
            .outbound
            .send(ClientEvent::AuthRefresh {
                correlation_id: correlation_id.clone(),
                refresh_token: refresh_token.to_string(),
            })
            .is_err()
        {
            self.pending_refresh.remove(&correlation_id);
            return Err(RefreshError::ChannelClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.pending_refresh.remove(&correlation_id);
                warn!("⏳ token refresh {} timed out", correlation_id);
                Err(RefreshError::Timeout)
            }
            Ok(Err(_)) => Err(RefreshError::ChannelClosed),
            Ok(Ok(RefreshOutcome::Tokens {
                access_token,
                refresh_token,
                expires_in,
            })) => Ok(TokenPair {
                access_token,
                refresh_token,
                expires_in,
            }),
            Ok(Ok(RefreshOutcome::Error { code, message })) => {
                Err(RefreshError::Rejected { code, message })
            }
        }
    }

    /// 分发服务端事件;刷新响应在此配对,其余交给调用方路由到房间
    /// Dispatches a server event; refresh responses are matched here,
    /// everything else is the caller's to route to rooms.
    pub fn handle_server_event(&self, event: &ServerEvent) -> bool {
        if let ServerEvent::AuthRefresh {
            correlation_id,
            outcome,
        } = event
        {
            match self.pending_refresh.remove(correlation_id) {
                Some((_, tx)) => {
                    let _ = tx.send(outcome.clone());
                }
                None => {
                    debug!("late refresh response for {} dropped", correlation_id);
                }
            }
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refresh_resolves_through_correlation_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ClientHandle::new(tx));

        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                handle.refresh_token("rt-1", Duration::from_secs(10)).await
            })
        };

        let sent = rx.recv().await.unwrap();
        let correlation_id = match sent {
            ClientEvent::AuthRefresh { correlation_id, .. } => correlation_id,
            other => panic!("unexpected: {:?}", other),
        };

        handle.handle_server_event(&ServerEvent::AuthRefresh {
            correlation_id,
            outcome: RefreshOutcome::Tokens {
                access_token: "at-2".into(),
                refresh_token: "rt-2".into(),
                expires_in: 3600,
            },
        });

        let pair = waiter.await.unwrap().unwrap();
        assert_eq!(pair.access_token, "at-2");
        assert_eq!(pair.refresh_token, "rt-2");
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_times_out_and_drops_waiter() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ClientHandle::new(tx));

        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                handle.refresh_token("rt-1", Duration::from_secs(10)).await
            })
        };

        let correlation_id = match rx.recv().await.unwrap() {
            ClientEvent::AuthRefresh { correlation_id, .. } => correlation_id,
            other => panic!("unexpected: {:?}", other),
        };

        tokio::time::advance(Duration::from_secs(10)).await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, RefreshError::Timeout));

        // 迟到的响应被当作未知关联ID丢弃 / Late response is dropped
        let routed = handle.handle_server_event(&ServerEvent::AuthRefresh {
            correlation_id,
            outcome: RefreshOutcome::Tokens {
                access_token: "at".into(),
                refresh_token: "rt".into(),
                expires_in: 3600,
            },
        });
        assert!(routed);
        assert!(handle.pending_refresh.is_empty());
    }

    #[tokio::test]
    async fn refresh_rejection_surfaces_code_and_message() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ClientHandle::new(tx));

        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                handle.refresh_token("rt-bad", Duration::from_secs(10)).await
            })
        };

        let correlation_id = match rx.recv().await.unwrap() {
            ClientEvent::AuthRefresh { correlation_id, .. } => correlation_id,
            other => panic!("unexpected: {:?}", other),
        };

        handle.handle_server_event(&ServerEvent::AuthRefresh {
            correlation_id,
            outcome: RefreshOutcome::Error {
                code: "invalid_refresh_token".into(),
                message: "expired".into(),
            },
        });

        match waiter.await.unwrap().unwrap_err() {
            RefreshError::Rejected { code, .. } => assert_eq!(code, "invalid_refresh_token"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
