use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::ReconnectError;

use super::worker::RoomHandle;

/// 连接状态机 / Connection state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// 重试耗尽,需要重新认证并全量重同步 / Retries exhausted; the
    /// application must re-authenticate and fully resync
    Terminal,
}

/// 拨号器 / Dialer seam
///
/// 监督器只关心「能否建立连接」,传输细节留给实现方,测试用假拨号器
/// / The supervisor only cares whether a connection can be established;
/// transports plug in here and tests use fakes.
#[async_trait]
pub trait Connector: Send + Sync {
    type Conn: Send;

    async fn connect(&self) -> anyhow::Result<Self::Conn>;
}

/// 重连策略 / Reconnect policy
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// 固定重试间隔,无指数退避 / Fixed retry delay, no backoff
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

/// 重连监督器 / Reconnect supervisor
pub struct ReconnectSupervisor<C: Connector> {
    connector: C,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl<C: Connector> ReconnectSupervisor<C> {
    pub fn new(connector: C, policy: ReconnectPolicy) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            policy,
            state_tx,
            state_rx,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        tracing::debug!("connection state -> {:?}", state);
        let _ = self.state_tx.send(state);
    }

    /// 首次连接,不重试 / Initial connect, no retries
    pub async fn connect(&self) -> anyhow::Result<C::Conn> {
        self.set_state(ConnectionState::Connecting);
        match self.connector.connect().await {
            Ok(conn) => {
                self.set_state(ConnectionState::Connected);
                Ok(conn)
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// 断线后重连:固定间隔重试,耗尽后进入终态
    /// Reconnect after a drop: fixed-delay retries, terminal when
    /// exhausted. Success is the caller's cue to resync room state.
    pub async fn reconnect(&self) -> Result<C::Conn, ReconnectError> {
        for attempt in 1..=self.policy.max_attempts {
            self.set_state(ConnectionState::Reconnecting { attempt });
            tokio::time::sleep(self.policy.delay).await;
            match self.connector.connect().await {
                Ok(conn) => {
                    info!("🔁 reconnected on attempt {}", attempt);
                    self.set_state(ConnectionState::Connected);
                    return Ok(conn);
                }
                Err(e) => {
                    warn!("⚠️ reconnect attempt {} failed: {}", attempt, e);
                }
            }
        }
        self.set_state(ConnectionState::Terminal);
        Err(ReconnectError::AttemptsExhausted {
            attempts: self.policy.max_attempts,
        })
    }

    /// 重连成功后立刻使各房间缓存失效并从头重拉,堵住断线期间的静默缺口
    /// On reconnect success, invalidate every room's cached pages and
    /// refetch from cursor-none, closing the silent gap that opened
    /// while the transport was down.
    pub async fn reconnect_and_resync(
        &self,
        rooms: &[RoomHandle],
    ) -> Result<C::Conn, ReconnectError> {
        let conn = self.reconnect().await?;
        for room in rooms {
            room.resync();
        }
        Ok(conn)
    }
}
