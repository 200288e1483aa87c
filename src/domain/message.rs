use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// 消息内容类型 / Message content type
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Image,
    Location,
}

/// 规范消息 / Canonical message
///
/// `id` 由服务端分配,全局唯一且不可变 / `id` is server-assigned,
/// globally unique and immutable. 删除消息保留位置,仅清空内容
/// / Deletes tombstone the entry: position kept, content cleared.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    pub content_type: ContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    pub is_edited: bool,
    pub is_deleted: bool,
    /// 毫秒时间戳 / Epoch millis
    pub created_at: i64,
    pub updated_at: i64,
}

impl ChatMessage {
    /// 最新在前的排序比较,时间相同时按 id 决胜
    /// Newest-first ordering; `id` breaks timestamp ties.
    pub fn cmp_newest_first(&self, other: &ChatMessage) -> Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// 乐观消息三态机 / Optimistic delivery three-state machine
///
/// `pending → sent | failed`,条目绝不被静默丢弃 / an entry is never
/// silently dropped.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, created_at: i64) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            room_id: "r1".to_string(),
            sender_id: "u1".to_string(),
            content: "hi".to_string(),
            content_type: ContentType::Text,
            reply_to_id: None,
            is_edited: false,
            is_deleted: false,
            created_at,
            updated_at: created_at,
        }
    }

    #[test]
    fn newest_first_with_id_tiebreak() {
        let older = msg("a", 100);
        let newer = msg("b", 200);
        assert_eq!(newer.cmp_newest_first(&older), Ordering::Less);

        // 时间戳相同,id 较大者在前 / Same timestamp, larger id first
        let x = msg("x", 100);
        let y = msg("y", 100);
        assert_eq!(y.cmp_newest_first(&x), Ordering::Less);
    }
}
