//! 同步模块
//!
//! 职责：
//! - 持续拉取服务端 delta（`SyncEngine`）
//! - 管理同步游标（`SyncCursorStore`）
//! - 把 delta 应用到本地房间实体（`RoomCoordinator`）
//! - 失败退避（`RetryPolicy`）

pub mod cursor_store;
pub mod retry;
pub mod room_coordinator;
pub mod sync_engine;

pub use cursor_store::SyncCursorStore;
pub use retry::{RetryPolicy, SyncFailureReason};
pub use room_coordinator::RoomCoordinator;
pub use sync_engine::{LoopExit, SyncEngine, SyncHandler, SyncOutcome, SyncStats};

use serde::{Deserialize, Serialize};
use std::fmt;

/// 同步游标（服务端下发的 `next_batch`，下一轮作为 `since` 带上）
///
/// 对客户端不透明，只能整体替换。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(String);

impl SyncCursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SyncCursor {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

/// 房间成员关系
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Joined,
    Invited,
    Left,
}

/// 房间事件（时间线事件或状态事件）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    /// 邀请态的精简状态事件没有 event_id
    #[serde(default)]
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub sender: String,
    /// 存在即为状态事件
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub origin_server_ts: u64,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl RoomEvent {
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }
}

/// 单个房间的增量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomUpdate {
    pub room_id: String,
    pub membership: Membership,
    /// 时间线之前的状态
    #[serde(default)]
    pub state: Vec<RoomEvent>,
    #[serde(default)]
    pub timeline: Vec<RoomEvent>,
    /// 时间线有缺口，本地时间线需要重置
    #[serde(default)]
    pub timeline_limited: bool,
}

impl RoomUpdate {
    pub fn new(room_id: impl Into<String>, membership: Membership) -> Self {
        Self {
            room_id: room_id.into(),
            membership,
            state: Vec::new(),
            timeline: Vec::new(),
            timeline_limited: false,
        }
    }
}

/// 一轮同步返回的增量，连同下一轮的游标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDelta {
    pub next_cursor: SyncCursor,
    #[serde(default)]
    pub rooms: Vec<RoomUpdate>,
    /// 无游标请求得到的全量快照
    #[serde(default)]
    pub is_initial: bool,
}

impl SyncDelta {
    pub fn new(next_cursor: impl Into<String>) -> Self {
        Self {
            next_cursor: SyncCursor::new(next_cursor),
            rooms: Vec::new(),
            is_initial: false,
        }
    }

    pub fn with_room(mut self, update: RoomUpdate) -> Self {
        self.rooms.push(update);
        self
    }

    pub fn room_ids(&self) -> impl Iterator<Item = &str> {
        self.rooms.iter().map(|r| r.room_id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_is_transparent_on_the_wire() {
        let cursor = SyncCursor::new("s72594_4483_1934");
        assert_eq!(serde_json::to_string(&cursor).unwrap(), "\"s72594_4483_1934\"");
        assert_eq!(cursor.to_string(), "s72594_4483_1934");
    }

    #[test]
    fn stripped_state_event_parses_with_defaults() {
        let event: RoomEvent = serde_json::from_value(serde_json::json!({
            "type": "m.room.name",
            "state_key": "",
            "content": { "name": "Lobby" }
        }))
        .unwrap();
        assert!(event.is_state());
        assert!(event.event_id.is_empty());
        assert_eq!(event.origin_server_ts, 0);
    }

    #[test]
    fn delta_builder_collects_rooms() {
        let delta = SyncDelta::new("c1")
            .with_room(RoomUpdate::new("!a:example.org", Membership::Joined))
            .with_room(RoomUpdate::new("!b:example.org", Membership::Left));
        assert_eq!(
            delta.room_ids().collect::<Vec<_>>(),
            vec!["!a:example.org", "!b:example.org"]
        );
        assert!(!delta.is_empty());
    }
}
