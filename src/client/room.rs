use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::event::ServerEvent;
use crate::domain::message::{ChatMessage, ContentType, DeliveryStatus};

/// 房间列表条目 / Room list entry
///
/// 乐观条目带 `temp_id`;规范条目 `temp_id` 为 None
/// / Optimistic entries carry a `temp_id`; canonical ones do not.
#[derive(Debug, Clone)]
pub struct RoomEntry {
    pub message: ChatMessage,
    pub status: DeliveryStatus,
    pub temp_id: Option<String>,
}

/// 渲染快照 / Render-ready snapshot
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub entries: Vec<RoomEntry>,
    pub members: Vec<String>,
    pub typing_users: Vec<String>,
}

/// 客户端协调存储 / Client reconciliation store
///
/// 把乐观写入、分页历史与服务端推送合并为单一有序无重复视图。所有变更
/// 经由单个逻辑写者串行执行(见 worker),原位替换与合并不需要锁
/// / Merges optimistic writes, paginated history and pushed events into
/// one ordered duplicate-free view. All mutations are serialized
/// through a single logical writer (see worker), so in-place
/// replace/merge needs no locking.
pub struct RoomState {
    room_id: String,
    user_id: String,
    /// 最新在前 / Newest-first
    entries: Vec<RoomEntry>,
    /// 已存在的规范 id / Canonical ids present in the list
    canonical_ids: HashSet<String>,
    members: BTreeSet<String>,
    /// 输入指示到期时刻 / Typing indicator deadlines
    typing: HashMap<String, Instant>,
    typing_ttl: Duration,
    oldest_cursor: Option<String>,
}

impl RoomState {
    pub fn new(room_id: &str, user_id: &str) -> Self {
        Self::with_typing_ttl(room_id, user_id, Duration::from_secs(5))
    }

    pub fn with_typing_ttl(room_id: &str, user_id: &str, typing_ttl: Duration) -> Self {
        Self {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            entries: Vec::new(),
            canonical_ids: HashSet::new(),
            members: BTreeSet::new(),
            typing: HashMap::new(),
            typing_ttl,
            oldest_cursor: None,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// 分页游标,None 表示从最新开始 / Pagination cursor, None = newest
    pub fn oldest_cursor(&self) -> Option<&str> {
        self.oldest_cursor.as_deref()
    }

    /// 乐观插入,立即出现在最新端;`local-` 前缀保证与服务端 id 永不冲突
    /// Optimistic insert at the newest-first head; the `local-` prefix
    /// guarantees a temp id can never collide with a server id.
    pub fn send_optimistic(&mut self, content: &str, content_type: ContentType) -> String {
        let temp_id = format!("local-{}", Uuid::new_v4());
        let now = chrono::Utc::now().timestamp_millis();
        let message = ChatMessage {
            id: temp_id.clone(),
            room_id: self.room_id.clone(),
            sender_id: self.user_id.clone(),
            content: content.to_string(),
            content_type,
            reply_to_id: None,
            is_edited: false,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        };
        self.entries.insert(
            0,
            RoomEntry {
                message,
                status: DeliveryStatus::Pending,
                temp_id: Some(temp_id.clone()),
            },
        );
        temp_id
    }

    /// 回执:按 `temp_id` 原位替换为规范消息,保持列表位置避免视觉重排;
    /// 若推送回声已先到,则丢弃乐观条目以维持 id 唯一
    /// Ack: in-place replace by `temp_id`, preserving position. If the
    /// push echo arrived first, the pending entry is dropped to keep
    /// the one-entry-per-id invariant.
    pub fn on_ack(&mut self, temp_id: &str, canonical: ChatMessage) -> bool {
        let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.temp_id.as_deref() == Some(temp_id))
        else {
            warn!("ack for unknown temp_id {}", temp_id);
            return false;
        };
        if self.canonical_ids.contains(&canonical.id) {
            self.entries.remove(idx);
            debug!("ack deduped against echo for {}", canonical.id);
            return true;
        }
        self.canonical_ids.insert(canonical.id.clone());
        self.entries[idx] = RoomEntry {
            message: canonical,
            status: DeliveryStatus::Sent,
            temp_id: None,
        };
        true
    }

    /// 失败(超时或显式拒绝):标记而绝不自动移除 / Failure (timeout or
    /// explicit rejection): marked, never removed automatically.
    pub fn on_failure(&mut self, temp_id: &str) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.temp_id.as_deref() == Some(temp_id))
        {
            Some(entry) => {
                entry.status = DeliveryStatus::Failed;
                true
            }
            None => false,
        }
    }

    /// 用户发起的重试:换新 `temp_id` 重新入队 / User-initiated retry
    /// requires a fresh `temp_id`.
    pub fn retry(&mut self, temp_id: &str) -> Option<String> {
        let idx = self.entries.iter().position(|e| {
            e.temp_id.as_deref() == Some(temp_id) && e.status == DeliveryStatus::Failed
        })?;
        let old = self.entries.remove(idx);
        Some(self.send_optimistic(&old.message.content, old.message.content_type))
    }

    /// 用户显式丢弃失败条目 / Explicit discard of a failed entry
    pub fn discard(&mut self, temp_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| {
            !(e.temp_id.as_deref() == Some(temp_id) && e.status != DeliveryStatus::Sent)
        });
        before != self.entries.len()
    }

    /// 应用服务端推送 / Apply a server push
    pub fn apply_push(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::Message { message } if message.room_id == self.room_id => {
                self.insert_canonical(message.clone());
            }
            ServerEvent::MessageEdited {
                room_id,
                message_id,
                content,
                updated_at,
            } if *room_id == self.room_id => {
                if let Some(e) = self
                    .entries
                    .iter_mut()
                    .find(|e| e.message.id == *message_id)
                {
                    e.message.content = content.clone();
                    e.message.is_edited = true;
                    e.message.updated_at = *updated_at;
                }
            }
            ServerEvent::MessageDeleted {
                room_id,
                message_id,
            } if *room_id == self.room_id => {
                // 墓碑:保留位置,清空内容 / Tombstone: keep position,
                // clear content
                if let Some(e) = self
                    .entries
                    .iter_mut()
                    .find(|e| e.message.id == *message_id)
                {
                    e.message.is_deleted = true;
                    e.message.content.clear();
                }
            }
            ServerEvent::MemberJoined { room_id, user_id } if *room_id == self.room_id => {
                self.members.insert(user_id.clone());
            }
            ServerEvent::MemberLeft { room_id, user_id } if *room_id == self.room_id => {
                self.members.remove(user_id);
                self.typing.remove(user_id);
            }
            ServerEvent::Typing {
                room_id,
                user_id,
                is_typing,
            } if *room_id == self.room_id => {
                if *is_typing {
                    self.typing
                        .insert(user_id.clone(), Instant::now() + self.typing_ttl);
                } else {
                    self.typing.remove(user_id);
                }
            }
            _ => {}
        }
    }

    /// 去重插入:同 id 条目已存在时跳过(覆盖重同步重投与发送端回声)
    /// Dedup insert: skipped when the id is already present (covers
    /// resync re-delivery and the sender's own echo).
    fn insert_canonical(&mut self, message: ChatMessage) {
        if self.canonical_ids.contains(&message.id) {
            return;
        }
        self.canonical_ids.insert(message.id.clone());
        let idx = self
            .entries
            .iter()
            .position(|e| message.cmp_newest_first(&e.message) == Ordering::Less)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            idx,
            RoomEntry {
                message,
                status: DeliveryStatus::Sent,
                temp_id: None,
            },
        );
    }

    /// 追加较旧分页:显式按 id 过滤,拒绝请求在途期间已经实时推送过的消息
    /// Append an older page, filtering ids already present from live
    /// pushes that raced the page request.
    pub fn load_older_page(&mut self, items: Vec<ChatMessage>) {
        if let Some(last) = items.last() {
            self.oldest_cursor = Some(last.id.clone());
        }
        for message in items {
            if self.canonical_ids.contains(&message.id) {
                continue;
            }
            self.canonical_ids.insert(message.id.clone());
            self.entries.push(RoomEntry {
                message,
                status: DeliveryStatus::Sent,
                temp_id: None,
            });
        }
    }

    /// 终端断开后的全量重同步:丢弃缓存页从头拉取,换带宽保证无静默缺口;
    /// 乐观条目(pending/failed)保留
    /// Full resync after a terminal disconnect cycle: drop cached pages
    /// and refetch from cursor-none. Optimistic entries survive.
    pub fn reset_for_resync(&mut self) {
        self.entries.retain(|e| e.status != DeliveryStatus::Sent);
        self.canonical_ids.clear();
        self.members.clear();
        self.typing.clear();
        self.oldest_cursor = None;
    }

    /// 正在输入的用户,过期指示在此被剔除 / Users currently typing;
    /// expired indicators are dropped here.
    pub fn typing_users(&mut self) -> Vec<String> {
        let now = Instant::now();
        self.typing.retain(|_, deadline| *deadline > now);
        let mut users: Vec<String> = self.typing.keys().cloned().collect();
        users.sort();
        users
    }

    pub fn snapshot(&mut self) -> RoomSnapshot {
        let typing_users = self.typing_users();
        RoomSnapshot {
            entries: self.entries.clone(),
            members: self.members.iter().cloned().collect(),
            typing_users,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical(id: &str, created_at: i64) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            room_id: "r1".to_string(),
            sender_id: "u2".to_string(),
            content: format!("content {}", id),
            content_type: ContentType::Text,
            reply_to_id: None,
            is_edited: false,
            is_deleted: false,
            created_at,
            updated_at: created_at,
        }
    }

    fn push(state: &mut RoomState, msg: ChatMessage) {
        state.apply_push(&ServerEvent::Message { message: msg });
    }

    #[test]
    fn dedup_at_most_one_entry_per_id() {
        let mut state = RoomState::new("r1", "u1");
        push(&mut state, canonical("m1", 100));
        push(&mut state, canonical("m1", 100));
        push(&mut state, canonical("m2", 200));
        push(&mut state, canonical("m2", 200));

        let ids: Vec<&str> = state.entries.iter().map(|e| e.message.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
    }

    #[test]
    fn ack_replaces_in_place_preserving_position() {
        let mut state = RoomState::new("r1", "u1");
        push(&mut state, canonical("m1", 100));
        let temp = state.send_optimistic("hello", ContentType::Text);
        push(&mut state, canonical("m2", i64::MAX - 1));

        let pending_pos = state
            .entries
            .iter()
            .position(|e| e.temp_id.as_deref() == Some(&temp))
            .unwrap();

        let mut srv = canonical("srv-1", 12345);
        srv.sender_id = "u1".to_string();
        assert!(state.on_ack(&temp, srv));

        // 位置不变,状态流转 pending → sent / Position unchanged
        assert_eq!(state.entries[pending_pos].message.id, "srv-1");
        assert_eq!(state.entries[pending_pos].status, DeliveryStatus::Sent);
        assert!(state.entries[pending_pos].temp_id.is_none());
    }

    #[test]
    fn ack_after_own_echo_keeps_single_entry() {
        let mut state = RoomState::new("r1", "u1");
        let temp = state.send_optimistic("hello", ContentType::Text);
        // 回声先于回执到达 / The echo races ahead of the ack
        push(&mut state, canonical("srv-1", 500));
        assert!(state.on_ack(&temp, canonical("srv-1", 500)));

        let count = state
            .entries
            .iter()
            .filter(|e| e.message.id == "srv-1")
            .count();
        assert_eq!(count, 1);
        assert!(state.entries.iter().all(|e| e.temp_id.is_none()));
    }

    #[test]
    fn failed_send_is_never_silently_removed() {
        let mut state = RoomState::new("r1", "u1");
        let temp = state.send_optimistic("hello", ContentType::Text);
        assert!(state.on_failure(&temp));

        let entry = state
            .entries
            .iter()
            .find(|e| e.temp_id.as_deref() == Some(&temp))
            .unwrap();
        assert_eq!(entry.status, DeliveryStatus::Failed);

        // 推送与分页都不会清掉它 / Neither pushes nor pages clear it
        push(&mut state, canonical("m1", 100));
        state.load_older_page(vec![canonical("m0", 50)]);
        assert!(state
            .entries
            .iter()
            .any(|e| e.status == DeliveryStatus::Failed));
    }

    #[test]
    fn retry_requires_fresh_temp_id() {
        let mut state = RoomState::new("r1", "u1");
        let temp = state.send_optimistic("hello", ContentType::Text);
        state.on_failure(&temp);

        let retried = state.retry(&temp).unwrap();
        assert_ne!(retried, temp);
        let entry = state
            .entries
            .iter()
            .find(|e| e.temp_id.as_deref() == Some(&retried))
            .unwrap();
        assert_eq!(entry.status, DeliveryStatus::Pending);
        assert_eq!(entry.message.content, "hello");

        // pending 条目不可重试 / A pending entry cannot be retried
        assert!(state.retry(&retried).is_none());
    }

    #[test]
    fn older_page_never_duplicates_live_pushes() {
        let mut state = RoomState::new("r1", "u1");
        push(&mut state, canonical("m3", 300));
        // 分页请求在途时 m2 已经实时到达 / m2 arrived live while the
        // page request was in flight
        push(&mut state, canonical("m2", 200));

        state.load_older_page(vec![canonical("m2", 200), canonical("m1", 100)]);

        let ids: Vec<&str> = state.entries.iter().map(|e| e.message.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m2", "m1"]);
        assert_eq!(state.oldest_cursor(), Some("m1"));
    }

    #[test]
    fn pushes_sort_newest_first_with_id_tiebreak() {
        let mut state = RoomState::new("r1", "u1");
        push(&mut state, canonical("m1", 100));
        push(&mut state, canonical("m3", 300));
        push(&mut state, canonical("m2", 200));
        // 相同时间戳,id 决胜 / Identical timestamps, id breaks the tie
        push(&mut state, canonical("m2b", 200));

        let ids: Vec<&str> = state.entries.iter().map(|e| e.message.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m2b", "m2", "m1"]);
    }

    #[test]
    fn edits_and_deletes_mutate_in_place() {
        let mut state = RoomState::new("r1", "u1");
        push(&mut state, canonical("m1", 100));
        push(&mut state, canonical("m2", 200));

        state.apply_push(&ServerEvent::MessageEdited {
            room_id: "r1".to_string(),
            message_id: "m1".to_string(),
            content: "edited".to_string(),
            updated_at: 999,
        });
        state.apply_push(&ServerEvent::MessageDeleted {
            room_id: "r1".to_string(),
            message_id: "m2".to_string(),
        });

        let ids: Vec<&str> = state.entries.iter().map(|e| e.message.id.as_str()).collect();
        // 排序位置不变 / Ordering positions unchanged
        assert_eq!(ids, vec!["m2", "m1"]);
        assert!(state.entries[0].message.is_deleted);
        assert!(state.entries[0].message.content.is_empty());
        assert!(state.entries[1].message.is_edited);
        assert_eq!(state.entries[1].message.content, "edited");
    }

    #[test]
    fn membership_events_update_member_cache_not_messages() {
        let mut state = RoomState::new("r1", "u1");
        push(&mut state, canonical("m1", 100));
        state.apply_push(&ServerEvent::MemberJoined {
            room_id: "r1".to_string(),
            user_id: "u9".to_string(),
        });

        let snap = state.snapshot();
        assert_eq!(snap.entries.len(), 1);
        assert!(snap.members.contains(&"u9".to_string()));

        state.apply_push(&ServerEvent::MemberLeft {
            room_id: "r1".to_string(),
            user_id: "u9".to_string(),
        });
        assert!(!state.snapshot().members.contains(&"u9".to_string()));
    }

    #[test]
    fn events_for_other_rooms_are_ignored() {
        let mut state = RoomState::new("r1", "u1");
        let mut other = canonical("mx", 100);
        other.room_id = "r2".to_string();
        push(&mut state, other);
        assert!(state.entries.is_empty());
    }

    #[test]
    fn resync_drops_canonical_keeps_optimistic() {
        let mut state = RoomState::new("r1", "u1");
        push(&mut state, canonical("m1", 100));
        let pending = state.send_optimistic("pending", ContentType::Text);
        let failed = state.send_optimistic("failed", ContentType::Text);
        state.on_failure(&failed);

        state.reset_for_resync();

        assert!(state.oldest_cursor().is_none());
        assert_eq!(state.entries.len(), 2);
        assert!(state
            .entries
            .iter()
            .any(|e| e.temp_id.as_deref() == Some(&pending)));

        // 重同步重投不会产生重复 / Resync re-delivery cannot duplicate
        push(&mut state, canonical("m1", 100));
        push(&mut state, canonical("m1", 100));
        let count = state
            .entries
            .iter()
            .filter(|e| e.message.id == "m1")
            .count();
        assert_eq!(count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_indicator_expires_on_receiver_side() {
        let mut state = RoomState::new("r1", "u1");
        state.apply_push(&ServerEvent::Typing {
            room_id: "r1".to_string(),
            user_id: "u2".to_string(),
            is_typing: true,
        });
        assert_eq!(state.typing_users(), vec!["u2".to_string()]);

        // 发送端不正常断开,无停止事件 / Ungraceful sender disconnect,
        // no stop event ever arrives
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(state.typing_users().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_clears_indicator() {
        let mut state = RoomState::new("r1", "u1");
        state.apply_push(&ServerEvent::Typing {
            room_id: "r1".to_string(),
            user_id: "u2".to_string(),
            is_typing: true,
        });
        state.apply_push(&ServerEvent::Typing {
            room_id: "r1".to_string(),
            user_id: "u2".to_string(),
            is_typing: false,
        });
        assert!(state.typing_users().is_empty());
    }
}
