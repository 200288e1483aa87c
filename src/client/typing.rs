use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::event::ClientEvent;

/// 发送端输入协调器 / Sender-side typing coordinator
///
/// 节流开始事件、防抖停止事件,把连续击键压缩为成对的开始/停止
/// / Throttles start events and debounces stop events, collapsing a
/// keystroke burst into a single start/stop pair on the wire.
pub struct TypingCoordinator {
    room_id: String,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    /// 两次开始事件的最小间隔 / Minimum gap between start emissions
    throttle: Duration,
    /// 静默多久后自动停止 / Idle window before the automatic stop
    debounce: Duration,
    last_start: Mutex<Option<Instant>>,
    /// 防抖代数,新输入使旧定时器作废 / Debounce generation; new input
    /// invalidates older timers
    stop_gen: AtomicU64,
}

impl TypingCoordinator {
    pub fn new(room_id: &str, outbound: mpsc::UnboundedSender<ClientEvent>) -> Arc<Self> {
        Self::with_windows(
            room_id,
            outbound,
            Duration::from_millis(2000),
            Duration::from_millis(1500),
        )
    }

    pub fn with_windows(
        room_id: &str,
        outbound: mpsc::UnboundedSender<ClientEvent>,
        throttle: Duration,
        debounce: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            room_id: room_id.to_string(),
            outbound,
            throttle,
            debounce,
            last_start: Mutex::new(None),
            stop_gen: AtomicU64::new(0),
        })
    }

    /// 每次击键调用 / Called on every keystroke
    pub fn on_user_input(self: &Arc<Self>) {
        let now = Instant::now();
        {
            let mut last = self.last_start.lock();
            let due = last.map_or(true, |at| now.duration_since(at) >= self.throttle);
            if due {
                self.emit(true);
                *last = Some(now);
            }
        }

        // 重置防抖定时器 / Reschedule the idle stop
        let gen = self.stop_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            if this.stop_gen.load(Ordering::SeqCst) == gen {
                debug!("⌨️ idle stop for room {}", this.room_id);
                this.stop();
            }
        });
    }

    /// 消息实际发出或会话失焦时调用:立即无条件停止,并作废挂起的防抖
    /// Called when a message is actually sent or the session blurs:
    /// emits an immediate unconditional stop and cancels any pending
    /// debounce timer.
    pub fn on_idle_or_send(&self) {
        self.stop_gen.fetch_add(1, Ordering::SeqCst);
        self.stop();
    }

    /// 停止后清空节流窗口,下一次击键立即重新宣告
    /// Clearing the throttle window on stop lets the very next
    /// keystroke announce typing again.
    fn stop(&self) {
        *self.last_start.lock() = None;
        self.emit(false);
    }

    fn emit(&self, is_typing: bool) {
        let _ = self.outbound.send(ClientEvent::Typing {
            room_id: self.room_id.clone(),
            is_typing,
        });
    }
}
