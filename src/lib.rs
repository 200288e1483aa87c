//! geochat-sync
//!
//! 位置群聊的实时同步引擎 / Real-time synchronization engine for
//! location-scoped group chat.
//!
//! 服务端:连接网关、投递管道、在线状态、输入状态、限流
//! 客户端:乐观写入协调、分页合并、断线重连
//! Server side: connection gateway, delivery pipeline, presence, typing,
//! rate limiting. Client side: optimistic reconciliation, page merging,
//! reconnection.

use anyhow::Result;
use chrono::{Datelike, Timelike};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod server;
pub mod service;
pub mod store;
pub mod tasks;
pub mod ws;

pub use domain::event::{ClientEvent, RefreshOutcome, ServerEvent};
pub use domain::message::{ChatMessage, ContentType, DeliveryStatus};
pub use domain::presence::{PresenceRecord, PresenceStatus};
pub use error::{AuthError, ReconnectError, RefreshError, SendError};
pub use server::{GeoChatServer, SessionConn};

struct LogTimer;

impl fmt::time::FormatTime for LogTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        let cs = now.timestamp_subsec_millis() / 10;
        let s = format!(
            "{:04}-{:02}-{:02}:{:02}:{:02}:{:02}:{:02}",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            cs
        );
        w.write_str(&s)
    }
}

/// 初始化日志订阅器 / Initialize tracing subscriber
pub fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    LogTracer::init().ok();
    fmt::SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_timer(LogTimer)
        .compact()
        .with_target(false)
        .try_init()
        .ok();
    Ok(())
}
