use anyhow::Result;
use serde::Deserialize;

/// 服务端配置 / Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub ws_port: u16,
    /// 静默连接超时,毫秒 / Silent connection timeout in ms
    pub heartbeat_timeout_ms: u64,
    /// 连接后必须在此期限内完成鉴权 / Auth must complete within this deadline
    pub auth_deadline_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ws_port: 5300,
            heartbeat_timeout_ms: 60_000,
            auth_deadline_ms: 1_000,
        }
    }
}

/// 鉴权配置 / Auth configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub enabled: bool,
    pub center_url: String,
    pub timeout_ms: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            center_url: "http://127.0.0.1:8090".to_string(),
            timeout_ms: 1_000,
        }
    }
}

/// 发送限流与内容边界 / Send rate limits and content bounds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub send_limit: u32,
    pub send_window_secs: u64,
    pub max_content_len: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            send_limit: 30,
            send_window_secs: 60,
            max_content_len: 4096,
        }
    }
}

/// 在线状态配置 / Presence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    /// 心跳TTL,秒 / Heartbeat TTL in seconds
    pub ttl_secs: u64,
    /// 断线宽限期,秒 / Disconnect grace period in seconds
    pub grace_secs: u64,
    /// 在线集合新鲜度窗口,秒 / Online-set freshness window in seconds
    pub freshness_secs: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            grace_secs: 30,
            freshness_secs: 300,
        }
    }
}

/// 输入状态配置 / Typing configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TypingSettings {
    pub ttl_secs: u64,
    pub throttle_ms: u64,
    pub debounce_ms: u64,
}

impl Default for TypingSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 5,
            throttle_ms: 2_000,
            debounce_ms: 1_500,
        }
    }
}

/// 客户端重连配置 / Client reconnection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub delay_ms: u64,
    pub max_attempts: u32,
    pub refresh_timeout_secs: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            delay_ms: 1_000,
            max_attempts: 5,
            refresh_timeout_secs: 10,
        }
    }
}

/// 全量配置 / Full settings tree
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub limits: LimitSettings,
    pub presence: PresenceSettings,
    pub typing: TypingSettings,
    pub reconnect: ReconnectSettings,
    pub logging: LoggingSettings,
}

/// 日志配置 / Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// 加载配置:TOML文件 + GEOCHAT_* 环境变量覆盖
    /// Load settings: TOML file + GEOCHAT_* environment overlay
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(p) = path {
            builder = builder.add_source(config::File::with_name(p).required(false));
        }
        let cfg = builder
            .add_source(config::Environment::with_prefix("GEOCHAT").separator("__"))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let s = Settings::default();
        assert_eq!(s.presence.ttl_secs, 300);
        assert_eq!(s.presence.grace_secs, 30);
        assert_eq!(s.typing.ttl_secs, 5);
        assert_eq!(s.typing.throttle_ms, 2_000);
        assert_eq!(s.typing.debounce_ms, 1_500);
        assert_eq!(s.reconnect.delay_ms, 1_000);
        assert_eq!(s.reconnect.max_attempts, 5);
        assert_eq!(s.reconnect.refresh_timeout_secs, 10);
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let s = Settings::load(None).expect("load");
        assert_eq!(s.server.ws_port, 5300);
        assert_eq!(s.limits.max_content_len, 4096);
    }
}
