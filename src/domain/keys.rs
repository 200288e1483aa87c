use std::fmt;
use std::time::Duration;

/// 共享存储键命名空间 / Shared-store key namespaces
///
/// TTL策略挂在命名空间上,便于审计 / The TTL policy is attached to the
/// namespace so it can be audited in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Presence,
    RoomPresence,
    RateLimit,
    Typing,
    DisconnectGrace,
}

impl Namespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Presence => "presence",
            Namespace::RoomPresence => "room_presence",
            Namespace::RateLimit => "rate_limit",
            Namespace::Typing => "typing",
            Namespace::DisconnectGrace => "disconnect_grace",
        }
    }

    /// 命名空间级TTL;限流键的TTL等于窗口长度,由调用方提供
    /// Namespace-level TTL; rate-limit key TTL equals the window and is
    /// supplied per call.
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Namespace::Presence => Some(Duration::from_secs(300)),
            Namespace::RoomPresence => None,
            Namespace::RateLimit => None,
            Namespace::Typing => Some(Duration::from_secs(5)),
            Namespace::DisconnectGrace => Some(Duration::from_secs(30)),
        }
    }
}

/// 类型化存储键 / Typed store key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    ns: Namespace,
    id: String,
}

impl Key {
    pub fn presence(user_id: &str) -> Self {
        Self {
            ns: Namespace::Presence,
            id: user_id.to_string(),
        }
    }

    pub fn room_presence(room_id: &str) -> Self {
        Self {
            ns: Namespace::RoomPresence,
            id: room_id.to_string(),
        }
    }

    pub fn rate_limit(bucket: &str) -> Self {
        Self {
            ns: Namespace::RateLimit,
            id: bucket.to_string(),
        }
    }

    pub fn typing(room_id: &str, user_id: &str) -> Self {
        Self {
            ns: Namespace::Typing,
            id: format!("{}:{}", room_id, user_id),
        }
    }

    pub fn disconnect_grace(user_id: &str) -> Self {
        Self {
            ns: Namespace::DisconnectGrace,
            id: user_id.to_string(),
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.ns
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ns.prefix(), self.id)
    }
}
