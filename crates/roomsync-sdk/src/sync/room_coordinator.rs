/// 房间协调器
///
/// 职责：
/// - 将服务端 delta 应用到房间 `EntityManager`
/// - 先在副本上暂存每个房间的新状态，全部校验通过后一次性提交
/// - 提交后把房间快照写入缓存（尽力而为）

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use regex::Regex;
use tokio::sync::Mutex;

use super::{Membership, SyncDelta};
use crate::cache::Cache;
use crate::entity::{Entity, EntityManager};
use crate::error::{RoomSyncError, Result};
use crate::logging::Logger;
use crate::room::{Room, RoomSnapshot};

/// `!opaque:server`
static ROOM_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^![^:\s]+:\S+$").ok());

const ROOM_INDEX_KEY: &str = "rooms:index";

fn room_key(room_id: &str) -> String {
    format!("room:{}", room_id)
}

pub fn is_valid_room_id(room_id: &str) -> bool {
    ROOM_ID
        .as_ref()
        .map(|re| re.is_match(room_id))
        .unwrap_or(false)
}

pub struct RoomCoordinator {
    rooms: Arc<EntityManager<Room>>,
    timeline_limit: usize,
    /// 是否把房间快照写入缓存并在登录时恢复
    persist_rooms: bool,
    cache: RwLock<Option<Arc<dyn Cache>>>,
    /// 保证两个 delta 不会交叠应用
    apply_lock: Mutex<()>,
    logger: Arc<dyn Logger>,
}

impl RoomCoordinator {
    pub fn new(
        rooms: Arc<EntityManager<Room>>,
        timeline_limit: usize,
        persist_rooms: bool,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            rooms,
            timeline_limit,
            persist_rooms,
            cache: RwLock::new(None),
            apply_lock: Mutex::new(()),
            logger,
        }
    }

    pub fn rooms(&self) -> &Arc<EntityManager<Room>> {
        &self.rooms
    }

    /// 绑定（或解绑）当前会话的缓存
    pub fn attach_cache(&self, cache: Option<Arc<dyn Cache>>) {
        *self.cache.write() = cache;
    }

    /// 应用一个 delta，返回涉及的房间数。
    ///
    /// 任一房间校验或应用失败时整个 delta 被拒绝，管理器保持原样。
    pub async fn handle_sync(&self, delta: &SyncDelta) -> Result<usize> {
        let _guard = self.apply_lock.lock().await;

        let mut seen = HashSet::with_capacity(delta.rooms.len());
        for update in &delta.rooms {
            if !is_valid_room_id(&update.room_id) {
                return Err(RoomSyncError::Apply(format!(
                    "无效的房间 id: {:?}",
                    update.room_id
                )));
            }
            if !seen.insert(update.room_id.as_str()) {
                return Err(RoomSyncError::Apply(format!(
                    "房间 {} 在同一 delta 中出现多次",
                    update.room_id
                )));
            }
        }

        // 暂存：在副本上应用
        let mut staged = Vec::with_capacity(delta.rooms.len());
        for update in &delta.rooms {
            let mut next = match self.rooms.get(&update.room_id) {
                Some(handle) => {
                    let current = handle.read();
                    current.clone()
                }
                None => Room::create(self.rooms.manager_ref(), &update.room_id),
            };
            next.apply_update(update, self.timeline_limit)?;
            staged.push(next);
        }

        // 提交：一次写锁内完成，不会失败
        let (created, left) = self.rooms.write_batch(|batch| {
            let mut created = 0usize;
            let mut left = 0usize;
            for room in staged {
                let room_id = room.room_id().to_string();
                let leaving = room.membership() == Membership::Left;
                if batch.upsert(&room_id, room) {
                    created += 1;
                }
                if leaving {
                    batch.remove(&room_id);
                    left += 1;
                }
            }
            (created, left)
        });

        self.logger.debug(&format!(
            "applied delta {}: {} rooms ({} new, {} left)",
            delta.next_cursor,
            delta.rooms.len(),
            created,
            left
        ));

        self.persist(delta).await;
        Ok(delta.rooms.len())
    }

    async fn persist(&self, delta: &SyncDelta) {
        if !self.persist_rooms {
            return;
        }
        let cache = self.cache.read().clone();
        let Some(cache) = cache else {
            return;
        };

        for room_id in delta.room_ids() {
            let snapshot = self.rooms.get(room_id).map(|handle| {
                let room = handle.read();
                room.snapshot()
            });
            let result = match snapshot {
                Some(snapshot) => match serde_json::to_string(&snapshot) {
                    Ok(json) => cache.set(&room_key(room_id), &json).await,
                    Err(e) => Err(e.into()),
                },
                None => cache.remove(&room_key(room_id)).await,
            };
            if let Err(e) = result {
                self.logger
                    .warn(&format!("failed to cache room {}: {}", room_id, e));
            }
        }

        let index = serde_json::to_string(&self.rooms.ids());
        let result = match index {
            Ok(json) => cache.set(ROOM_INDEX_KEY, &json).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            self.logger.warn(&format!("failed to cache room index: {}", e));
        }
    }

    /// 从缓存恢复房间。
    ///
    /// 只有索引中的每个房间都能读出时才写入 manager 并返回 `Some(数量)`；
    /// 未开启持久化、没有缓存、没有索引或有条目缺失/损坏时返回 `None`，manager 不变。
    pub async fn restore_from_cache(&self) -> Result<Option<usize>> {
        let _guard = self.apply_lock.lock().await;
        if !self.persist_rooms {
            return Ok(None);
        }
        let cache = self.cache.read().clone();
        let Some(cache) = cache else {
            return Ok(None);
        };
        let Some(index) = cache.get(ROOM_INDEX_KEY).await? else {
            return Ok(None);
        };
        let room_ids: Vec<String> = serde_json::from_str(&index)?;

        let mut restored = Vec::with_capacity(room_ids.len());
        for room_id in room_ids {
            let Some(json) = cache.get(&room_key(&room_id)).await? else {
                self.logger
                    .warn(&format!("cached room {} is missing, discarding cache", room_id));
                return Ok(None);
            };
            match serde_json::from_str::<RoomSnapshot>(&json) {
                Ok(snapshot) => {
                    restored.push(Room::from_snapshot(self.rooms.manager_ref(), snapshot))
                }
                Err(e) => {
                    self.logger
                        .warn(&format!("cached room {} is corrupt, discarding cache: {}", room_id, e));
                    return Ok(None);
                }
            }
        }

        let count = restored.len();
        self.rooms.write_batch(|batch| {
            for room in restored {
                let room_id = room.room_id().to_string();
                batch.upsert(&room_id, room);
            }
        });
        self.logger
            .info(&format!("restored {} rooms from cache", count));
        Ok(Some(count))
    }

    /// 清空房间与当前缓存命名空间（包括同一命名空间下的同步游标）
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.apply_lock.lock().await;
        self.rooms.clear();
        let cache = self.cache.read().clone();
        if let Some(cache) = cache {
            cache.clear().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheFactory, MemoryCacheFactory};
    use crate::logging::{LoggerFactory, RecordingLoggerFactory};
    use crate::sync::{RoomEvent, RoomUpdate};
    use serde_json::json;

    fn coordinator() -> RoomCoordinator {
        let loggers = RecordingLoggerFactory::default();
        RoomCoordinator::new(
            Arc::new(EntityManager::new()),
            50,
            true,
            loggers.get_logger("rooms"),
        )
    }

    fn named(room_id: &str, name: &str) -> RoomUpdate {
        let mut update = RoomUpdate::new(room_id, Membership::Joined);
        update.state.push(RoomEvent {
            event_id: format!("$name_{}", name),
            event_type: "m.room.name".to_string(),
            sender: "@alice:example.org".to_string(),
            state_key: Some(String::new()),
            origin_server_ts: 1,
            content: json!({ "name": name }),
        });
        update
    }

    #[test]
    fn room_id_grammar() {
        assert!(is_valid_room_id("!a:example.org"));
        assert!(is_valid_room_id("!OGEhHVWSdvArJzumhm:matrix.org"));
        assert!(!is_valid_room_id("a:example.org"));
        assert!(!is_valid_room_id("!a"));
        assert!(!is_valid_room_id("!a b:example.org"));
        assert!(!is_valid_room_id(""));
    }

    #[tokio::test]
    async fn identity_is_preserved_across_deltas() {
        let coordinator = coordinator();

        coordinator
            .handle_sync(&SyncDelta::new("c1").with_room(named("!a:example.org", "First")))
            .await
            .unwrap();
        let held = coordinator.rooms().get("!a:example.org").unwrap();

        coordinator
            .handle_sync(&SyncDelta::new("c2").with_room(named("!a:example.org", "Second")))
            .await
            .unwrap();

        let current = coordinator.rooms().get("!a:example.org").unwrap();
        assert!(Arc::ptr_eq(&held, &current));
        assert_eq!(held.read().name(), Some("Second"));
        assert!(held.read().manager().same_manager(&coordinator.rooms().manager_ref()));
    }

    #[tokio::test]
    async fn invalid_delta_commits_nothing() {
        let coordinator = coordinator();
        coordinator
            .handle_sync(&SyncDelta::new("c1").with_room(named("!a:example.org", "Before")))
            .await
            .unwrap();

        let bad_id = SyncDelta::new("c2")
            .with_room(named("!a:example.org", "After"))
            .with_room(named("not-a-room", "x"));
        assert_eq!(coordinator.handle_sync(&bad_id).await.unwrap_err().kind(), "apply");

        let duplicate = SyncDelta::new("c2")
            .with_room(named("!a:example.org", "After"))
            .with_room(named("!a:example.org", "Again"));
        assert!(coordinator.handle_sync(&duplicate).await.is_err());

        let mut broken = RoomUpdate::new("!b:example.org", Membership::Joined);
        broken.state.push(RoomEvent {
            event_id: "$x".to_string(),
            event_type: "m.room.topic".to_string(),
            sender: String::new(),
            state_key: None,
            origin_server_ts: 0,
            content: json!({}),
        });
        let missing_state_key = SyncDelta::new("c2")
            .with_room(named("!a:example.org", "After"))
            .with_room(broken);
        assert!(coordinator.handle_sync(&missing_state_key).await.is_err());

        let room = coordinator.rooms().get("!a:example.org").unwrap();
        assert_eq!(room.read().name(), Some("Before"));
        assert!(!coordinator.rooms().contains("!b:example.org"));
    }

    #[tokio::test]
    async fn left_room_is_removed_but_handle_sees_final_state() {
        let coordinator = coordinator();
        coordinator
            .handle_sync(&SyncDelta::new("c1").with_room(named("!a:example.org", "Lobby")))
            .await
            .unwrap();
        let held = coordinator.rooms().get("!a:example.org").unwrap();

        let delta = SyncDelta::new("c2").with_room(RoomUpdate::new("!a:example.org", Membership::Left));
        assert_eq!(coordinator.handle_sync(&delta).await.unwrap(), 1);

        assert!(!coordinator.rooms().contains("!a:example.org"));
        assert_eq!(held.read().membership(), Membership::Left);
        assert_eq!(held.read().name(), Some("Lobby"));
    }

    #[tokio::test]
    async fn rooms_survive_through_cache() {
        let factory = MemoryCacheFactory::new();
        let cache = factory.open("ns").await.unwrap();

        let first = coordinator();
        first.attach_cache(Some(cache.clone()));
        first
            .handle_sync(
                &SyncDelta::new("c1")
                    .with_room(named("!a:example.org", "Lobby"))
                    .with_room(named("!b:example.org", "Ops")),
            )
            .await
            .unwrap();
        first
            .handle_sync(&SyncDelta::new("c2").with_room(RoomUpdate::new("!b:example.org", Membership::Left)))
            .await
            .unwrap();

        let second = coordinator();
        second.attach_cache(Some(cache.clone()));
        assert_eq!(second.restore_from_cache().await.unwrap(), Some(1));
        let room = second.rooms().get("!a:example.org").unwrap();
        assert_eq!(room.read().name(), Some("Lobby"));
        assert!(!second.rooms().contains("!b:example.org"));

        second.clear().await.unwrap();
        assert!(second.rooms().is_empty());
        assert_eq!(cache.get(ROOM_INDEX_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn incomplete_cache_restores_nothing() {
        let factory = MemoryCacheFactory::new();
        let cache = factory.open("ns").await.unwrap();

        let first = coordinator();
        first.attach_cache(Some(cache.clone()));
        first
            .handle_sync(
                &SyncDelta::new("c1")
                    .with_room(named("!a:example.org", "Lobby"))
                    .with_room(named("!b:example.org", "Ops")),
            )
            .await
            .unwrap();
        cache.set(&room_key("!b:example.org"), "{not json").await.unwrap();

        let second = coordinator();
        second.attach_cache(Some(cache.clone()));
        assert_eq!(second.restore_from_cache().await.unwrap(), None);
        assert!(second.rooms().is_empty());

        cache.remove(ROOM_INDEX_KEY).await.unwrap();
        assert_eq!(second.restore_from_cache().await.unwrap(), None);

        let disabled = RoomCoordinator::new(
            Arc::new(EntityManager::new()),
            50,
            false,
            RecordingLoggerFactory::default().get_logger("rooms"),
        );
        disabled.attach_cache(Some(cache));
        assert_eq!(disabled.restore_from_cache().await.unwrap(), None);
    }
}
