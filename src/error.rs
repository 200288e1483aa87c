use thiserror::Error;

use crate::store::StoreError;

/// 鉴权错误 / Authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("无效令牌 / invalid token")]
    InvalidToken,

    #[error("鉴权中心不可达 / auth center unreachable: {0}")]
    Unreachable(String),
}

/// 发送被拒绝 / Message send rejection
///
/// 这些错误直接返回给调用方,绝不自动重试 / These are surfaced to the
/// caller as typed errors and are never retried automatically.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("非房间成员 / not a member of room {room_id}")]
    NotMember { room_id: String },

    #[error("消息内容为空 / message content is empty")]
    EmptyContent,

    #[error("消息内容过长 / content exceeds {max} chars")]
    ContentTooLong { max: usize },

    #[error("发送过于频繁 / rate limited, remaining quota 0")]
    RateLimited,

    #[error("无操作权限 / sender does not own message {message_id}")]
    Forbidden { message_id: String },

    #[error("消息不存在 / message {message_id} not found")]
    MessageNotFound { message_id: String },

    #[error("共享存储错误 / shared store error: {0}")]
    Store(#[from] StoreError),

    #[error("消息持久化失败 / message persistence failed: {0}")]
    Persist(#[source] anyhow::Error),
}

impl SendError {
    /// 线上错误码 / Wire-level error code
    pub fn code(&self) -> &'static str {
        match self {
            SendError::NotMember { .. } => "not_member",
            SendError::EmptyContent => "empty_content",
            SendError::ContentTooLong { .. } => "content_too_long",
            SendError::RateLimited => "rate_limited",
            SendError::Forbidden { .. } => "forbidden",
            SendError::MessageNotFound { .. } => "message_not_found",
            SendError::Store(_) => "store_unavailable",
            SendError::Persist(_) => "persist_failed",
        }
    }
}

/// 令牌刷新错误 / Token refresh errors
#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("刷新超时 / refresh timed out")]
    Timeout,

    #[error("刷新被拒绝 / refresh rejected: {code}: {message}")]
    Rejected { code: String, message: String },

    #[error("连接已关闭 / connection closed before response")]
    ChannelClosed,
}

/// 重连错误 / Reconnection errors
#[derive(Error, Debug)]
pub enum ReconnectError {
    #[error("重连次数耗尽 / reconnect attempts exhausted after {attempts} tries")]
    AttemptsExhausted { attempts: u32 },
}
