use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::event::ServerEvent;
use crate::domain::message::{ChatMessage, ContentType};
use crate::error::SendError;
use crate::server::GeoChatServer;

/// 待持久化的消息草稿 / Message draft handed to the store
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    pub content_type: ContentType,
    pub reply_to_id: Option<String>,
    pub at: i64,
}

/// 外部消息存储协作方 / External message store collaborator
///
/// 消息与成员数据归其所有,核心只经由此trait访问 / Owns message and
/// membership data; the core reaches it only through this trait.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 分配规范 `id` 并持久化 / Assigns the canonical `id` and persists
    async fn persist(&self, draft: MessageDraft) -> anyhow::Result<ChatMessage>;

    async fn is_member(&self, user_id: &str, room_id: &str) -> anyhow::Result<bool>;

    async fn get_message(
        &self,
        room_id: &str,
        message_id: &str,
    ) -> anyhow::Result<Option<ChatMessage>>;

    /// 原位编辑:内容更新、`is_edited` 置位、`updated_at` 前移,排序位置不变
    /// In-place edit; ordering position is unchanged.
    async fn apply_edit(
        &self,
        room_id: &str,
        message_id: &str,
        content: &str,
        at: i64,
    ) -> anyhow::Result<Option<ChatMessage>>;

    /// 墓碑删除:条目保留,内容清空 / Tombstone delete; entry retained
    async fn apply_delete(
        &self,
        room_id: &str,
        message_id: &str,
        at: i64,
    ) -> anyhow::Result<Option<ChatMessage>>;

    /// 游标分页历史,最新在前 / Cursor-paginated history, newest-first;
    /// `before` 为消息id游标,None表示从最新开始 / `before` is a message-id
    /// cursor; None starts from the newest.
    async fn history_before(
        &self,
        room_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<ChatMessage>>;

    async fn touch_room_activity(&self, room_id: &str, at: i64) -> anyhow::Result<()>;
}

/// 内存消息存储 / In-memory message store
///
/// 驱动二进制与测试;生产部署替换为真实存储实现 / Backs the binary and
/// tests; production wires a real store behind the same trait.
#[derive(Default)]
pub struct MemoryMessageStore {
    rooms: DashMap<String, Vec<ChatMessage>>, // 追加序即时间序 / Append order is chronological
    members: DashMap<String, DashSet<String>>,
    activity: DashMap<String, i64>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, room_id: &str, user_id: &str) {
        self.members
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub fn remove_member(&self, room_id: &str, user_id: &str) {
        if let Some(set) = self.members.get(room_id) {
            set.remove(user_id);
        }
    }

    pub fn last_activity(&self, room_id: &str) -> Option<i64> {
        self.activity.get(room_id).map(|v| *v)
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn persist(&self, draft: MessageDraft) -> anyhow::Result<ChatMessage> {
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            room_id: draft.room_id.clone(),
            sender_id: draft.sender_id,
            content: draft.content,
            content_type: draft.content_type,
            reply_to_id: draft.reply_to_id,
            is_edited: false,
            is_deleted: false,
            created_at: draft.at,
            updated_at: draft.at,
        };
        self.rooms
            .entry(draft.room_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn is_member(&self, user_id: &str, room_id: &str) -> anyhow::Result<bool> {
        Ok(self
            .members
            .get(room_id)
            .map_or(false, |set| set.contains(user_id)))
    }

    async fn get_message(
        &self,
        room_id: &str,
        message_id: &str,
    ) -> anyhow::Result<Option<ChatMessage>> {
        Ok(self
            .rooms
            .get(room_id)
            .and_then(|msgs| msgs.iter().find(|m| m.id == message_id).cloned()))
    }

    async fn apply_edit(
        &self,
        room_id: &str,
        message_id: &str,
        content: &str,
        at: i64,
    ) -> anyhow::Result<Option<ChatMessage>> {
        if let Some(mut msgs) = self.rooms.get_mut(room_id) {
            if let Some(m) = msgs.iter_mut().find(|m| m.id == message_id) {
                m.content = content.to_string();
                m.is_edited = true;
                m.updated_at = at;
                return Ok(Some(m.clone()));
            }
        }
        Ok(None)
    }

    async fn apply_delete(
        &self,
        room_id: &str,
        message_id: &str,
        at: i64,
    ) -> anyhow::Result<Option<ChatMessage>> {
        if let Some(mut msgs) = self.rooms.get_mut(room_id) {
            if let Some(m) = msgs.iter_mut().find(|m| m.id == message_id) {
                m.is_deleted = true;
                m.content.clear();
                m.updated_at = at;
                return Ok(Some(m.clone()));
            }
        }
        Ok(None)
    }

    async fn history_before(
        &self,
        room_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        let Some(msgs) = self.rooms.get(room_id) else {
            return Ok(Vec::new());
        };
        let mut newest_first: Vec<ChatMessage> = msgs.iter().cloned().collect();
        newest_first.sort_by(|a, b| a.cmp_newest_first(b));
        let start = match before {
            None => 0,
            Some(cursor) => match newest_first.iter().position(|m| m.id == cursor) {
                Some(pos) => pos + 1,
                None => return Ok(Vec::new()),
            },
        };
        Ok(newest_first.into_iter().skip(start).take(limit).collect())
    }

    async fn touch_room_activity(&self, room_id: &str, at: i64) -> anyhow::Result<()> {
        self.activity.insert(room_id.to_string(), at);
        Ok(())
    }
}

/// 消息投递管道 / Message delivery pipeline
impl GeoChatServer {
    /// 校验、持久化、更新房间活跃时间并向订阅者扇出;发起端套接字不在
    /// 扇出集合内,由调用方单独回执
    /// Validate, persist, bump room activity, fan out to subscribers;
    /// the originating socket is excluded here and acked by the caller.
    pub async fn send_room_message(
        &self,
        session_id: &str,
        room_id: &str,
        content: &str,
        content_type: ContentType,
        reply_to_id: Option<String>,
    ) -> Result<ChatMessage, SendError> {
        let user_id = self.subscribed_member(session_id, room_id).await?;

        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(SendError::EmptyContent);
        }
        let max = self.settings.limits.max_content_len;
        if trimmed.chars().count() > max {
            return Err(SendError::ContentTooLong { max });
        }

        let decision = self
            .rate_limiter
            .check(
                &format!("send:{}", user_id),
                self.settings.limits.send_limit,
                Duration::from_secs(self.settings.limits.send_window_secs),
            )
            .await?;
        if !decision.allowed {
            return Err(SendError::RateLimited);
        }

        let at = self.store.now_ms();
        let message = self
            .messages
            .persist(MessageDraft {
                room_id: room_id.to_string(),
                sender_id: user_id,
                content: trimmed.to_string(),
                content_type,
                reply_to_id,
                at,
            })
            .await
            .map_err(SendError::Persist)?;
        self.messages
            .touch_room_activity(room_id, at)
            .await
            .map_err(SendError::Persist)?;

        self.broadcast_to_room(
            room_id,
            &ServerEvent::Message {
                message: message.clone(),
            },
            Some(session_id),
            None,
        )
        .await;
        info!("📬 message {} delivered to room {}", message.id, room_id);
        Ok(message)
    }

    /// 编辑消息并扇出 / Edit a message and fan out
    pub async fn edit_room_message(
        &self,
        session_id: &str,
        room_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<ChatMessage, SendError> {
        let user_id = self.subscribed_member(session_id, room_id).await?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(SendError::EmptyContent);
        }

        self.require_owner(&user_id, room_id, message_id).await?;
        let at = self.store.now_ms();
        let updated = self
            .messages
            .apply_edit(room_id, message_id, trimmed, at)
            .await
            .map_err(SendError::Persist)?
            .ok_or_else(|| SendError::MessageNotFound {
                message_id: message_id.to_string(),
            })?;

        self.broadcast_to_room(
            room_id,
            &ServerEvent::MessageEdited {
                room_id: room_id.to_string(),
                message_id: message_id.to_string(),
                content: updated.content.clone(),
                updated_at: updated.updated_at,
            },
            None,
            None,
        )
        .await;
        Ok(updated)
    }

    /// 墓碑删除并扇出 / Tombstone-delete a message and fan out
    pub async fn delete_room_message(
        &self,
        session_id: &str,
        room_id: &str,
        message_id: &str,
    ) -> Result<(), SendError> {
        let user_id = self.subscribed_member(session_id, room_id).await?;

        self.require_owner(&user_id, room_id, message_id).await?;
        let at = self.store.now_ms();
        self.messages
            .apply_delete(room_id, message_id, at)
            .await
            .map_err(SendError::Persist)?
            .ok_or_else(|| SendError::MessageNotFound {
                message_id: message_id.to_string(),
            })?;

        self.broadcast_to_room(
            room_id,
            &ServerEvent::MessageDeleted {
                room_id: room_id.to_string(),
                message_id: message_id.to_string(),
            },
            None,
            None,
        )
        .await;
        debug!("🪦 message {} tombstoned in {}", message_id, room_id);
        Ok(())
    }

    /// 仅消息发送者可编辑或删除 / Only the original sender may edit or
    /// delete a message.
    async fn require_owner(
        &self,
        user_id: &str,
        room_id: &str,
        message_id: &str,
    ) -> Result<(), SendError> {
        let existing = self
            .messages
            .get_message(room_id, message_id)
            .await
            .map_err(SendError::Persist)?
            .ok_or_else(|| SendError::MessageNotFound {
                message_id: message_id.to_string(),
            })?;
        if existing.sender_id != user_id {
            return Err(SendError::Forbidden {
                message_id: message_id.to_string(),
            });
        }
        Ok(())
    }

    /// 前置条件:会话已订阅该房间且为成员 / Precondition: the session
    /// subscribes to the room and the user is a member.
    async fn subscribed_member(
        &self,
        session_id: &str,
        room_id: &str,
    ) -> Result<String, SendError> {
        let conn = self
            .connections
            .get(session_id)
            .ok_or_else(|| SendError::NotMember {
                room_id: room_id.to_string(),
            })?;
        let user_id = conn.user_id.clone().ok_or_else(|| SendError::NotMember {
            room_id: room_id.to_string(),
        })?;
        if !conn.subscriptions.contains(room_id) {
            return Err(SendError::NotMember {
                room_id: room_id.to_string(),
            });
        }
        drop(conn);
        let member = self
            .messages
            .is_member(&user_id, room_id)
            .await
            .map_err(SendError::Persist)?;
        if !member {
            return Err(SendError::NotMember {
                room_id: room_id.to_string(),
            });
        }
        Ok(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(n: usize) -> MemoryMessageStore {
        let store = MemoryMessageStore::new();
        store.add_member("r1", "u1");
        for i in 0..n {
            let m = ChatMessage {
                id: format!("m{}", i),
                room_id: "r1".to_string(),
                sender_id: "u1".to_string(),
                content: format!("msg {}", i),
                content_type: ContentType::Text,
                reply_to_id: None,
                is_edited: false,
                is_deleted: false,
                created_at: 1000 + i as i64,
                updated_at: 1000 + i as i64,
            };
            store.rooms.entry("r1".to_string()).or_default().push(m);
        }
        store
    }

    #[tokio::test]
    async fn history_pages_newest_first_by_cursor() {
        let store = msgs(5);
        let first = store.history_before("r1", None, 2).await.unwrap();
        assert_eq!(
            first.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m4", "m3"]
        );
        let second = store.history_before("r1", Some("m3"), 2).await.unwrap();
        assert_eq!(
            second.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m2", "m1"]
        );
    }

    #[tokio::test]
    async fn edit_keeps_created_at_and_sets_flags() {
        let store = msgs(1);
        let edited = store
            .apply_edit("r1", "m0", "updated", 9999)
            .await
            .unwrap()
            .unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.created_at, 1000);
        assert_eq!(edited.updated_at, 9999);
        assert_eq!(edited.content, "updated");
    }

    #[tokio::test]
    async fn delete_tombstones_without_removal() {
        let store = msgs(2);
        let deleted = store
            .apply_delete("r1", "m0", 9999)
            .await
            .unwrap()
            .unwrap();
        assert!(deleted.is_deleted);
        assert!(deleted.content.is_empty());

        // 条目仍在历史中,滚动位置稳定 / Entry still present in history
        let page = store.history_before("r1", None, 10).await.unwrap();
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn membership_is_per_room() {
        let store = msgs(0);
        assert!(store.is_member("u1", "r1").await.unwrap());
        assert!(!store.is_member("u1", "r2").await.unwrap());
        store.remove_member("r1", "u1");
        assert!(!store.is_member("u1", "r1").await.unwrap());
    }
}
