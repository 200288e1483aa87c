use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::domain::keys::{Key, Namespace};
use crate::store::{SharedStore, StoreError};

/// 服务端输入状态 / Server-side typing state
///
/// 指示写入共享存储并按TTL自动过期,发送端不正常断开也不会卡住
/// / Indicators live in the shared store under a TTL, so an ungraceful
/// sender disconnect can never leave one stuck.
pub struct TypingService {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
}

impl TypingService {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        let ttl = Namespace::Typing.ttl().unwrap_or(Duration::from_secs(5));
        Self { store, ttl }
    }

    /// 记录开始/停止输入 / Record a start/stop typing signal
    pub async fn record(
        &self,
        room_id: &str,
        user_id: &str,
        is_typing: bool,
    ) -> Result<(), StoreError> {
        let key = Key::typing(room_id, user_id);
        if is_typing {
            let now = self.store.now_ms();
            self.store
                .set_with_ttl(&key, now.to_string(), self.ttl)
                .await?;
            debug!("⌨️  {} typing in {}", user_id, room_id);
        } else {
            self.store.delete(&key).await?;
        }
        Ok(())
    }

    pub async fn is_typing(&self, room_id: &str, user_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(&Key::typing(room_id, user_id))
            .await?
            .is_some())
    }
}
