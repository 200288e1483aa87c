use anyhow::Result;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::domain::event::ServerEvent;
use crate::server::GeoChatServer;

/// 面向会话的出站投递 / Session-scoped outbound delivery
impl GeoChatServer {
    pub async fn send_raw_to_session(&self, session_id: &str, message: Message) -> Result<()> {
        if let Some(conn) = self.connections.get(session_id) {
            conn.sender
                .send(message)
                .map_err(|e| anyhow::anyhow!("Failed to send message: {}", e))?;
            debug!("📤 Sent frame to session {}", session_id);
            Ok(())
        } else {
            warn!("⚠️  Session {} not found for delivery", session_id);
            Err(anyhow::anyhow!("Session {} not found", session_id))
        }
    }

    pub async fn send_event_to_session(
        &self,
        session_id: &str,
        event: &ServerEvent,
    ) -> Result<()> {
        let json = serde_json::to_string(event)?;
        self.send_raw_to_session(session_id, Message::Text(json))
            .await
    }

    /// 向房间订阅者广播,可按会话或用户排除;服务端视角至多一次投递
    /// Broadcast to room subscribers with optional session/user
    /// exclusion; at-most-once per subscriber from the server side.
    pub async fn broadcast_to_room(
        &self,
        room_id: &str,
        event: &ServerEvent,
        exclude_session: Option<&str>,
        exclude_user: Option<&str>,
    ) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                warn!("⚠️  failed to serialize event for room {}: {}", room_id, e);
                return 0;
            }
        };
        let Some(sessions) = self.room_sessions.get(room_id) else {
            return 0;
        };
        let targets: Vec<String> = sessions.iter().map(|s| s.clone()).collect();
        drop(sessions);

        let mut delivered = 0;
        for session_id in targets {
            if exclude_session == Some(session_id.as_str()) {
                continue;
            }
            if let Some(user) = exclude_user {
                if self.session_user(&session_id).as_deref() == Some(user) {
                    continue;
                }
            }
            if self
                .send_raw_to_session(&session_id, Message::Text(json.clone()))
                .await
                .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// 发送关闭帧 / Send close frame
    pub async fn send_close(&self, session_id: &str) -> Result<()> {
        if let Some(conn) = self.connections.get(session_id) {
            conn.sender
                .send(Message::Close(Some(
                    tokio_tungstenite::tungstenite::protocol::CloseFrame {
                        code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
                        reason: std::borrow::Cow::Borrowed("Connection closed"),
                    },
                )))
                .map_err(|e| anyhow::anyhow!("Failed to send close message: {}", e))?;
            debug!("🔒 Sent close frame to session {}", session_id);
            Ok(())
        } else {
            Err(anyhow::anyhow!("Session {} not found for close", session_id))
        }
    }
}
