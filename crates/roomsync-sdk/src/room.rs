//! 房间实体
//!
//! `Room` 由 `EntityManager<Room>` 持有，外部通过 `EntityHandle<Room>` 读取。
//! 状态只通过 `apply_update` 变更；`RoomCoordinator` 先在副本上应用、全部成功后再提交。

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, ManagerRef};
use crate::error::{RoomSyncError, Result};
use crate::sync::{Membership, RoomEvent, RoomUpdate};

pub const EVENT_ROOM_NAME: &str = "m.room.name";
pub const EVENT_ROOM_TOPIC: &str = "m.room.topic";
pub const EVENT_ROOM_MEMBER: &str = "m.room.member";
pub const EVENT_ROOM_CANONICAL_ALIAS: &str = "m.room.canonical_alias";

/// 房间
#[derive(Debug, Clone)]
pub struct Room {
    manager: ManagerRef<Room>,
    room_id: String,
    membership: Membership,
    name: Option<String>,
    topic: Option<String>,
    canonical_alias: Option<String>,
    /// user_id -> membership（join / invite / leave / ban）
    members: BTreeMap<String, String>,
    /// (event_type, state_key) -> 最新状态事件
    state: HashMap<(String, String), RoomEvent>,
    timeline: VecDeque<RoomEvent>,
    last_activity_ts: Option<u64>,
}

impl Entity for Room {
    const KIND: &'static str = "room";

    fn create(manager: ManagerRef<Self>, id: &str) -> Self {
        Self {
            manager,
            room_id: id.to_string(),
            membership: Membership::Joined,
            name: None,
            topic: None,
            canonical_alias: None,
            members: BTreeMap::new(),
            state: HashMap::new(),
            timeline: VecDeque::new(),
            last_activity_ts: None,
        }
    }

    fn id(&self) -> &str {
        &self.room_id
    }

    fn manager(&self) -> &ManagerRef<Self> {
        &self.manager
    }
}

impl Room {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn membership(&self) -> Membership {
        self.membership
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn canonical_alias(&self) -> Option<&str> {
        self.canonical_alias.as_deref()
    }

    /// 展示名：房间名 > 别名 > 房间 id
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.canonical_alias.as_deref())
            .unwrap_or(&self.room_id)
    }

    pub fn member_membership(&self, user_id: &str) -> Option<&str> {
        self.members.get(user_id).map(String::as_str)
    }

    /// 当前 join 状态的成员
    pub fn joined_members(&self) -> Vec<&str> {
        self.members
            .iter()
            .filter(|(_, m)| m.as_str() == "join")
            .map(|(user, _)| user.as_str())
            .collect()
    }

    pub fn state_event(&self, event_type: &str, state_key: &str) -> Option<&RoomEvent> {
        self.state
            .get(&(event_type.to_string(), state_key.to_string()))
    }

    pub fn timeline(&self) -> impl Iterator<Item = &RoomEvent> {
        self.timeline.iter()
    }

    pub fn timeline_len(&self) -> usize {
        self.timeline.len()
    }

    pub fn latest_event(&self) -> Option<&RoomEvent> {
        self.timeline.back()
    }

    pub fn last_activity_ts(&self) -> Option<u64> {
        self.last_activity_ts
    }

    /// 应用一个房间增量。失败时 self 可能已被部分修改，调用方必须在副本上调用。
    pub fn apply_update(&mut self, update: &RoomUpdate, timeline_limit: usize) -> Result<()> {
        self.membership = update.membership;

        for event in &update.state {
            if !event.is_state() {
                return Err(RoomSyncError::Apply(format!(
                    "房间 {} 的状态事件缺少 state_key: type={}",
                    self.room_id, event.event_type
                )));
            }
            self.apply_state_event(event);
        }

        if update.timeline_limited {
            self.timeline.clear();
        }

        for event in &update.timeline {
            if event.event_type.is_empty() {
                return Err(RoomSyncError::Apply(format!(
                    "房间 {} 的时间线事件缺少 type: event_id={}",
                    self.room_id, event.event_id
                )));
            }
            // 重放同一 delta 时按 event_id 去重
            if !event.event_id.is_empty()
                && self.timeline.iter().any(|e| e.event_id == event.event_id)
            {
                continue;
            }
            if event.is_state() {
                self.apply_state_event(event);
            }
            if event.origin_server_ts > 0 {
                self.last_activity_ts = Some(
                    self.last_activity_ts
                        .map_or(event.origin_server_ts, |ts| ts.max(event.origin_server_ts)),
                );
            }
            self.timeline.push_back(event.clone());
        }

        while self.timeline.len() > timeline_limit {
            self.timeline.pop_front();
        }

        Ok(())
    }

    fn apply_state_event(&mut self, event: &RoomEvent) {
        let state_key = event.state_key.clone().unwrap_or_default();
        let content = &event.content;

        match event.event_type.as_str() {
            EVENT_ROOM_NAME => {
                self.name = content
                    .get("name")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(String::from);
            }
            EVENT_ROOM_TOPIC => {
                self.topic = content
                    .get("topic")
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }
            EVENT_ROOM_CANONICAL_ALIAS => {
                self.canonical_alias = content
                    .get("alias")
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }
            EVENT_ROOM_MEMBER => {
                if let Some(membership) = content.get("membership").and_then(|v| v.as_str()) {
                    self.members.insert(state_key.clone(), membership.to_string());
                }
            }
            _ => {}
        }

        self.state
            .insert((event.event_type.clone(), state_key), event.clone());
    }

    /// 生成可序列化快照（用于写入缓存）
    pub fn snapshot(&self) -> RoomSnapshot {
        let mut state: Vec<RoomEvent> = self.state.values().cloned().collect();
        state.sort_by(|a, b| {
            (&a.event_type, &a.state_key).cmp(&(&b.event_type, &b.state_key))
        });
        RoomSnapshot {
            room_id: self.room_id.clone(),
            membership: self.membership,
            state,
            timeline: self.timeline.iter().cloned().collect(),
            last_activity_ts: self.last_activity_ts,
        }
    }

    /// 从快照恢复
    pub fn from_snapshot(manager: ManagerRef<Room>, snapshot: RoomSnapshot) -> Self {
        let mut room = Room::create(manager, &snapshot.room_id);
        room.membership = snapshot.membership;
        for event in &snapshot.state {
            room.apply_state_event(event);
        }
        room.timeline = snapshot.timeline.into_iter().collect();
        room.last_activity_ts = snapshot.last_activity_ts;
        room
    }
}

/// 房间快照（缓存格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub membership: Membership,
    pub state: Vec<RoomEvent>,
    pub timeline: Vec<RoomEvent>,
    pub last_activity_ts: Option<u64>,
}
