use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::domain::event::ServerEvent;
use crate::domain::message::{ChatMessage, ContentType};

use super::room::{RoomSnapshot, RoomState};

/// 房间写者命令 / Commands consumed by the room writer
#[derive(Debug)]
pub enum RoomCommand {
    SendOptimistic {
        content: String,
        content_type: ContentType,
        reply: oneshot::Sender<String>,
    },
    Ack {
        temp_id: String,
        canonical: ChatMessage,
    },
    Fail {
        temp_id: String,
    },
    Retry {
        temp_id: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Discard {
        temp_id: String,
    },
    Push(ServerEvent),
    OlderPage(Vec<ChatMessage>),
    Resync,
}

/// 房间句柄:命令入口 + 快照出口 / Room handle: command inlet plus
/// snapshot outlet
#[derive(Clone)]
pub struct RoomHandle {
    commands: mpsc::UnboundedSender<RoomCommand>,
    snapshots: watch::Receiver<RoomSnapshot>,
}

impl RoomHandle {
    pub async fn send_optimistic(&self, content: &str, content_type: ContentType) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(RoomCommand::SendOptimistic {
                content: content.to_string(),
                content_type,
                reply: tx,
            })
            .ok()?;
        rx.await.ok()
    }

    pub fn ack(&self, temp_id: &str, canonical: ChatMessage) {
        let _ = self.commands.send(RoomCommand::Ack {
            temp_id: temp_id.to_string(),
            canonical,
        });
    }

    pub fn fail(&self, temp_id: &str) {
        let _ = self.commands.send(RoomCommand::Fail {
            temp_id: temp_id.to_string(),
        });
    }

    pub async fn retry(&self, temp_id: &str) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(RoomCommand::Retry {
                temp_id: temp_id.to_string(),
                reply: tx,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    pub fn discard(&self, temp_id: &str) {
        let _ = self.commands.send(RoomCommand::Discard {
            temp_id: temp_id.to_string(),
        });
    }

    pub fn push(&self, event: ServerEvent) {
        let _ = self.commands.send(RoomCommand::Push(event));
    }

    pub fn older_page(&self, items: Vec<ChatMessage>) {
        let _ = self.commands.send(RoomCommand::OlderPage(items));
    }

    pub fn resync(&self) {
        let _ = self.commands.send(RoomCommand::Resync);
    }

    /// 最新渲染快照 / Latest render snapshot
    pub fn snapshot(&self) -> RoomSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<RoomSnapshot> {
        self.snapshots.clone()
    }
}

/// 启动房间写者任务 / Spawn the room writer task
///
/// 单写者串行消费命令,消除并发变更下的锁与撕裂读;订阅方只读渲染快照
/// / A single writer consumes commands serially, so the state needs no
/// locking and readers never observe a torn update; subscribers only
/// see rendered snapshots.
pub fn spawn_room_worker(mut state: RoomState) -> RoomHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<RoomCommand>();
    let (snap_tx, snap_rx) = watch::channel(state.snapshot());

    tokio::spawn(async move {
        // 定时重渲染,让无停止事件的输入指示也会过期消失
        // Periodic re-render so typing indicators without a stop event
        // still visibly expire.
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            let cmd = tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
                _ = tick.tick() => {
                    if snap_tx.send(state.snapshot()).is_err() {
                        break;
                    }
                    continue;
                }
            };
            match cmd {
                RoomCommand::SendOptimistic {
                    content,
                    content_type,
                    reply,
                } => {
                    let temp_id = state.send_optimistic(&content, content_type);
                    let _ = reply.send(temp_id);
                }
                RoomCommand::Ack { temp_id, canonical } => {
                    state.on_ack(&temp_id, canonical);
                }
                RoomCommand::Fail { temp_id } => {
                    state.on_failure(&temp_id);
                }
                RoomCommand::Retry { temp_id, reply } => {
                    let _ = reply.send(state.retry(&temp_id));
                }
                RoomCommand::Discard { temp_id } => {
                    state.discard(&temp_id);
                }
                RoomCommand::Push(event) => {
                    state.apply_push(&event);
                }
                RoomCommand::OlderPage(items) => {
                    state.load_older_page(items);
                }
                RoomCommand::Resync => {
                    state.reset_for_resync();
                }
            }
            if snap_tx.send(state.snapshot()).is_err() {
                break;
            }
        }
        debug!("🪦 room writer for {} stopped", state.room_id());
    });

    RoomHandle {
        commands: cmd_tx,
        snapshots: snap_rx,
    }
}
