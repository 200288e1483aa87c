use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// 在线状态 / Presence status
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// 在线状态记录 / Presence record
///
/// 连接时创建,心跳刷新,TTL到期即下线 / Created on connect, refreshed
/// by heartbeat, TTL expiry is the sole authority for "offline".
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: PresenceStatus,
    /// 毫秒时间戳 / Epoch millis
    pub last_seen_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}
