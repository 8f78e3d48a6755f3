//! 实体管理
//!
//! `EntityManager<E>` 独占持有某一类实体（例如房间），按稳定的字符串 id 索引。
//! 外部拿到的是 `EntityHandle<E>`（共享句柄）：同一 id 的句柄在实体生命周期内不变，
//! 原地修改后所有持有者都能看到最新状态，无需重新获取。
//!
//! 实体内部只保存 `ManagerRef<E>`（弱引用）用于导航，不参与生命周期管理，
//! 因此不会形成 manager ↔ entity 的引用环。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockWriteGuard};

/// 实体共享句柄
pub type EntityHandle<E> = Arc<RwLock<E>>;

type EntityMap<E> = RwLock<HashMap<String, EntityHandle<E>>>;

/// 由 manager 管理的实体
pub trait Entity: Send + Sync + Sized + 'static {
    /// 实体种类（用于日志）
    const KIND: &'static str;

    /// 首次被引用时创建空实体
    fn create(manager: ManagerRef<Self>, id: &str) -> Self;

    /// 稳定 id
    fn id(&self) -> &str;

    /// 所属 manager 的弱引用
    fn manager(&self) -> &ManagerRef<Self>;
}

/// 指向 manager 的非拥有引用
pub struct ManagerRef<E> {
    inner: Weak<EntityMap<E>>,
}

impl<E> ManagerRef<E> {
    /// 按 id 查找同一 manager 中的其他实体；manager 已释放时返回 None
    pub fn lookup(&self, id: &str) -> Option<EntityHandle<E>> {
        let map = self.inner.upgrade()?;
        let guard = map.read();
        guard.get(id).cloned()
    }

    /// manager 是否仍然存活
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// 是否指向同一个 manager
    pub fn same_manager(&self, other: &ManagerRef<E>) -> bool {
        Weak::ptr_eq(&self.inner, &other.inner)
    }
}

impl<E> Clone for ManagerRef<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> fmt::Debug for ManagerRef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerRef")
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// 实体管理器
pub struct EntityManager<E: Entity> {
    entities: Arc<EntityMap<E>>,
}

impl<E: Entity> EntityManager<E> {
    pub fn new() -> Self {
        Self {
            entities: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 供实体保存的弱引用
    pub fn manager_ref(&self) -> ManagerRef<E> {
        ManagerRef {
            inner: Arc::downgrade(&self.entities),
        }
    }

    pub fn get(&self, id: &str) -> Option<EntityHandle<E>> {
        self.entities.read().get(id).cloned()
    }

    /// 获取或创建实体，返回 (句柄, 是否新建)
    pub fn get_or_create(&self, id: &str) -> (EntityHandle<E>, bool) {
        if let Some(handle) = self.get(id) {
            return (handle, false);
        }
        let mut map = self.entities.write();
        // 拿写锁期间可能已被其他调用方插入
        if let Some(handle) = map.get(id) {
            return (handle.clone(), false);
        }
        let handle = Arc::new(RwLock::new(E::create(self.manager_ref(), id)));
        map.insert(id.to_string(), handle.clone());
        (handle, true)
    }

    /// 原地修改实体；实体不存在时返回 None
    pub fn mutate<R>(&self, id: &str, f: impl FnOnce(&mut E) -> R) -> Option<R> {
        let handle = self.get(id)?;
        let mut entity = handle.write();
        Some(f(&mut entity))
    }

    /// 移除实体（实体离开）。已持有句柄的外部调用方仍可读取最终状态。
    pub fn remove(&self, id: &str) -> Option<EntityHandle<E>> {
        self.entities.write().remove(id)
    }

    /// 在一次写锁内完成多项变更，读者不会看到中间状态
    pub fn write_batch<R>(&self, f: impl FnOnce(&mut BatchWriter<'_, E>) -> R) -> R {
        let mut writer = BatchWriter {
            manager_ref: self.manager_ref(),
            map: self.entities.write(),
        };
        f(&mut writer)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    /// 所有实体 id（已排序，便于稳定输出）
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entities.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn handles(&self) -> Vec<EntityHandle<E>> {
        self.entities.read().values().cloned().collect()
    }

    /// 清空所有实体
    pub fn clear(&self) {
        self.entities.write().clear();
    }
}

impl<E: Entity> Default for EntityManager<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> fmt::Debug for EntityManager<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityManager")
            .field("kind", &E::KIND)
            .field("len", &self.len())
            .finish()
    }
}

/// 批量写入器，持有 manager 的写锁
pub struct BatchWriter<'a, E: Entity> {
    manager_ref: ManagerRef<E>,
    map: RwLockWriteGuard<'a, HashMap<String, EntityHandle<E>>>,
}

impl<'a, E: Entity> BatchWriter<'a, E> {
    /// 写入实体新状态：已存在则原地替换（保持句柄不变），否则新建句柄。返回是否新建。
    pub fn upsert(&mut self, id: &str, value: E) -> bool {
        if let Some(handle) = self.map.get(id) {
            *handle.write() = value;
            return false;
        }
        self.map
            .insert(id.to_string(), Arc::new(RwLock::new(value)));
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<EntityHandle<E>> {
        self.map.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<EntityHandle<E>> {
        self.map.get(id).cloned()
    }

    pub fn manager_ref(&self) -> ManagerRef<E> {
        self.manager_ref.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Counter {
        manager: ManagerRef<Counter>,
        id: String,
        value: u32,
    }

    impl Entity for Counter {
        const KIND: &'static str = "counter";

        fn create(manager: ManagerRef<Self>, id: &str) -> Self {
            Self {
                manager,
                id: id.to_string(),
                value: 0,
            }
        }

        fn id(&self) -> &str {
            &self.id
        }

        fn manager(&self) -> &ManagerRef<Self> {
            &self.manager
        }
    }

    #[test]
    fn get_or_create_preserves_identity() {
        let manager: EntityManager<Counter> = EntityManager::new();
        let (first, created) = manager.get_or_create("a");
        assert!(created);
        let (second, created) = manager.get_or_create("a");
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));

        manager.mutate("a", |c| c.value += 5);
        assert_eq!(first.read().value, 5);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn mutate_missing_returns_none() {
        let manager: EntityManager<Counter> = EntityManager::new();
        assert!(manager.mutate("missing", |c| c.value += 1).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn manager_ref_navigates_and_does_not_own() {
        let manager: EntityManager<Counter> = EntityManager::new();
        let (a, _) = manager.get_or_create("a");
        manager.get_or_create("b");

        let back_ref = a.read().manager().clone();
        assert!(back_ref.same_manager(&manager.manager_ref()));
        let b = back_ref.lookup("b").expect("b is registered");
        assert_eq!(b.read().id(), "b");

        drop(manager);
        assert!(!back_ref.is_alive());
        assert!(back_ref.lookup("b").is_none());
        // 外部句柄仍然有效
        assert_eq!(a.read().id(), "a");
    }

    #[test]
    fn batch_upsert_keeps_existing_handle() {
        let manager: EntityManager<Counter> = EntityManager::new();
        let (held, _) = manager.get_or_create("a");

        manager.write_batch(|batch| {
            let mut next = held.read().clone();
            next.value = 42;
            assert!(!batch.upsert("a", next));
            let fresh = Counter::create(batch.manager_ref(), "b");
            assert!(batch.upsert("b", fresh));
        });

        assert_eq!(held.read().value, 42);
        assert!(Arc::ptr_eq(&held, &manager.get("a").unwrap()));
        assert_eq!(manager.ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn remove_keeps_external_handle_readable() {
        let manager: EntityManager<Counter> = EntityManager::new();
        let (held, _) = manager.get_or_create("a");
        manager.mutate("a", |c| c.value = 7);

        let removed = manager.remove("a").unwrap();
        assert!(Arc::ptr_eq(&held, &removed));
        assert!(!manager.contains("a"));
        assert_eq!(held.read().value, 7);
    }
}
