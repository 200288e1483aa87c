use anyhow::Result;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::domain::event::{ClientEvent, ServerEvent};
use crate::error::AuthError;
use crate::server::GeoChatServer;
use crate::service::presence::PresenceInfo;

/// 入站事件分发 / Inbound event dispatch
impl GeoChatServer {
    pub async fn handle_incoming_frame(&self, message: Message, session_id: &str) -> Result<()> {
        let text = match message {
            Message::Text(text) => text,
            // 二进制与控制帧忽略 / Binary and control frames are ignored
            _ => return Ok(()),
        };
        debug!("📨 Received frame from {}: {}", session_id, text);

        let event = match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => event,
            Err(e) => {
                // 校验失败:记录并丢弃该帧,会话不受影响 / Validation
                // failure: log and drop the frame; the session lives on
                warn!("⚠️  malformed frame from {}: {}", session_id, e);
                let _ = self
                    .send_event_to_session(
                        session_id,
                        &ServerEvent::Error {
                            code: "malformed_event".to_string(),
                            message: "invalid event payload".to_string(),
                            temp_id: None,
                        },
                    )
                    .await;
                return Ok(());
            }
        };

        match event {
            ClientEvent::Connect { token, device_id } => {
                self.handle_connect(session_id, &token, device_id).await
            }
            ClientEvent::Ping => self.handle_ping(session_id).await,
            ClientEvent::JoinRoom { room_id } => self.handle_join(session_id, &room_id).await,
            ClientEvent::LeaveRoom { room_id } => self.handle_leave(session_id, &room_id).await,
            ClientEvent::SendMessage {
                room_id,
                content,
                content_type,
                reply_to_id,
                temp_id,
            } => {
                match self
                    .send_room_message(session_id, &room_id, &content, content_type, reply_to_id)
                    .await
                {
                    Ok(message) => {
                        // 发起端套接字收到的不是重复推送而是回执 / The
                        // originating socket receives the ack, not a push
                        self.send_event_to_session(
                            session_id,
                            &ServerEvent::Ack { temp_id, message },
                        )
                        .await?;
                    }
                    Err(e) => {
                        warn!("🚫 send rejected for {}: {}", session_id, e);
                        self.send_event_to_session(
                            session_id,
                            &ServerEvent::Error {
                                code: e.code().to_string(),
                                message: e.to_string(),
                                temp_id: Some(temp_id),
                            },
                        )
                        .await?;
                    }
                }
                Ok(())
            }
            ClientEvent::EditMessage {
                room_id,
                message_id,
                content,
            } => {
                if let Err(e) = self
                    .edit_room_message(session_id, &room_id, &message_id, &content)
                    .await
                {
                    self.send_event_to_session(
                        session_id,
                        &ServerEvent::Error {
                            code: e.code().to_string(),
                            message: e.to_string(),
                            temp_id: None,
                        },
                    )
                    .await?;
                }
                Ok(())
            }
            ClientEvent::DeleteMessage {
                room_id,
                message_id,
            } => {
                if let Err(e) = self
                    .delete_room_message(session_id, &room_id, &message_id)
                    .await
                {
                    self.send_event_to_session(
                        session_id,
                        &ServerEvent::Error {
                            code: e.code().to_string(),
                            message: e.to_string(),
                            temp_id: None,
                        },
                    )
                    .await?;
                }
                Ok(())
            }
            ClientEvent::Typing { room_id, is_typing } => {
                self.handle_typing(session_id, &room_id, is_typing).await
            }
            ClientEvent::AuthRefresh {
                correlation_id,
                refresh_token,
            } => {
                let outcome = self.auth.refresh(&refresh_token).await;
                self.send_event_to_session(
                    session_id,
                    &ServerEvent::AuthRefresh {
                        correlation_id,
                        outcome,
                    },
                )
                .await
            }
        }
    }

    async fn handle_connect(
        &self,
        session_id: &str,
        token: &str,
        device_id: Option<String>,
    ) -> Result<()> {
        let identity = match self.auth.validate(token).await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                self.send_event_to_session(
                    session_id,
                    &ServerEvent::Error {
                        code: "invalid_token".to_string(),
                        message: AuthError::InvalidToken.to_string(),
                        temp_id: None,
                    },
                )
                .await?;
                let _ = self.send_close(session_id).await;
                return Ok(());
            }
            Err(e) => {
                self.send_event_to_session(
                    session_id,
                    &ServerEvent::Error {
                        code: "auth_unreachable".to_string(),
                        message: e.to_string(),
                        temp_id: None,
                    },
                )
                .await?;
                return Ok(());
            }
        };

        let device = device_id.or(identity.device_id);
        if let Some(mut conn) = self.connections.get_mut(session_id) {
            conn.user_id = Some(identity.user_id.clone());
            conn.device_id = device.clone();
        }
        self.user_sessions
            .entry(identity.user_id.clone())
            .or_default()
            .insert(session_id.to_string());

        // 连接成功驱动在线状态转换,宽限期内重连在此被取消
        // Successful connect drives the presence transition; a reconnect
        // inside the grace window is cancelled here
        self.presence
            .set_online(&identity.user_id, PresenceInfo { device_id: device })
            .await?;

        info!("🔑 session {} authenticated as {}", session_id, identity.user_id);
        self.send_event_to_session(
            session_id,
            &ServerEvent::Connected {
                session_id: session_id.to_string(),
                user_id: identity.user_id,
            },
        )
        .await
    }

    async fn handle_ping(&self, session_id: &str) -> Result<()> {
        debug!("🏓 Ping from {}", session_id);
        self.update_heartbeat(session_id);
        // 心跳同时刷新在线状态TTL / Heartbeat also refreshes presence TTL
        if let Some(user_id) = self.session_user(session_id) {
            let device_id = self
                .connections
                .get(session_id)
                .and_then(|c| c.device_id.clone());
            self.presence
                .set_online(&user_id, PresenceInfo { device_id })
                .await?;
        }
        self.send_event_to_session(
            session_id,
            &ServerEvent::Pong {
                timestamp: self.store.now_ms(),
            },
        )
        .await
    }

    async fn handle_join(&self, session_id: &str, room_id: &str) -> Result<()> {
        let Some(user_id) = self.session_user(session_id) else {
            return self.reject(session_id, "unauthenticated").await;
        };
        let member = self.messages.is_member(&user_id, room_id).await?;
        if !member {
            return self.reject(session_id, "not_member").await;
        }

        if let Some(conn) = self.connections.get(session_id) {
            conn.subscriptions.insert(room_id.to_string());
        }
        self.room_sessions
            .entry(room_id.to_string())
            .or_default()
            .insert(session_id.to_string());
        self.presence.add_user_to_room(&user_id, room_id).await?;

        info!("🚪 {} joined room {} (session {})", user_id, room_id, session_id);
        self.broadcast_to_room(
            room_id,
            &ServerEvent::MemberJoined {
                room_id: room_id.to_string(),
                user_id,
            },
            None,
            None,
        )
        .await;
        Ok(())
    }

    async fn handle_leave(&self, session_id: &str, room_id: &str) -> Result<()> {
        let Some(user_id) = self.session_user(session_id) else {
            return self.reject(session_id, "unauthenticated").await;
        };
        if let Some(conn) = self.connections.get(session_id) {
            conn.subscriptions.remove(room_id);
        }
        if let Some(set) = self.room_sessions.get(room_id) {
            set.remove(session_id);
        }
        self.presence.remove_user_from_room(&user_id, room_id).await?;

        self.broadcast_to_room(
            room_id,
            &ServerEvent::MemberLeft {
                room_id: room_id.to_string(),
                user_id,
            },
            None,
            None,
        )
        .await;
        Ok(())
    }

    async fn handle_typing(
        &self,
        session_id: &str,
        room_id: &str,
        is_typing: bool,
    ) -> Result<()> {
        let Some(user_id) = self.session_user(session_id) else {
            return self.reject(session_id, "unauthenticated").await;
        };
        self.typing.record(room_id, &user_id, is_typing).await?;

        // 重广播排除发起用户的全部会话 / Rebroadcast excludes every
        // session of the originating user
        self.broadcast_to_room(
            room_id,
            &ServerEvent::Typing {
                room_id: room_id.to_string(),
                user_id: user_id.clone(),
                is_typing,
            },
            None,
            Some(&user_id),
        )
        .await;
        Ok(())
    }

    async fn reject(&self, session_id: &str, code: &str) -> Result<()> {
        self.send_event_to_session(
            session_id,
            &ServerEvent::Error {
                code: code.to_string(),
                message: format!("request rejected: {}", code),
                temp_id: None,
            },
        )
        .await
    }
}
