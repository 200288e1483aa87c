use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::message::{ChatMessage, ContentType};
use super::presence::PresenceRecord;

/// 客户端到服务端事件 / Client-to-server events
///
/// 带类型标签的联合体,处理端穷尽匹配 / Tagged union so handlers match
/// exhaustively instead of switching on strings.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// 连接后第一帧,携带访问令牌 / First frame after connect
    Connect {
        token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
    },
    Ping,
    JoinRoom {
        room_id: String,
    },
    LeaveRoom {
        room_id: String,
    },
    SendMessage {
        room_id: String,
        content: String,
        content_type: ContentType,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to_id: Option<String>,
        /// 客户端生成的关联ID / Client-generated correlation id
        temp_id: String,
    },
    EditMessage {
        room_id: String,
        message_id: String,
        content: String,
    },
    DeleteMessage {
        room_id: String,
        message_id: String,
    },
    Typing {
        room_id: String,
        is_typing: bool,
    },
    #[serde(rename = "auth:refresh")]
    AuthRefresh {
        correlation_id: String,
        refresh_token: String,
    },
}

/// 令牌刷新结果 / Token refresh outcome
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
#[serde(untagged)]
pub enum RefreshOutcome {
    Tokens {
        access_token: String,
        refresh_token: String,
        expires_in: i64,
    },
    Error {
        code: String,
        message: String,
    },
}

/// 服务端到客户端事件 / Server-to-client events
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        session_id: String,
        user_id: String,
    },
    Pong {
        timestamp: i64,
    },
    /// 规范消息推送 / Canonical message push
    Message {
        message: ChatMessage,
    },
    #[serde(rename = "message:edited")]
    MessageEdited {
        room_id: String,
        message_id: String,
        content: String,
        updated_at: i64,
    },
    #[serde(rename = "message:deleted")]
    MessageDeleted {
        room_id: String,
        message_id: String,
    },
    Typing {
        room_id: String,
        user_id: String,
        is_typing: bool,
    },
    Presence {
        record: PresenceRecord,
    },
    #[serde(rename = "auth:refresh")]
    AuthRefresh {
        correlation_id: String,
        #[serde(flatten)]
        outcome: RefreshOutcome,
    },
    /// 发起端套接字收到的直接回执 / Direct acknowledgment to the
    /// originating socket, carrying the same canonical record
    Ack {
        temp_id: String,
        message: ChatMessage,
    },
    #[serde(rename = "member:joined")]
    MemberJoined {
        room_id: String,
        user_id: String,
    },
    #[serde(rename = "member:left")]
    MemberLeft {
        room_id: String,
        user_id: String,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },
}
