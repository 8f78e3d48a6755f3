//! 缓存注入点
//!
//! 核心只依赖 `CacheFactory` / `Cache` 两个 trait：
//! - `MemoryCacheFactory`：默认实现，进程内 HashMap，进程退出即丢失
//! - `SledCacheFactory`：基于 sled 的本地持久化实现，每个命名空间一个 Tree
//!
//! 命名空间由 homeserver + user 派生（见 `namespace_for`），保证多账号互不干扰。

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{RoomSyncError, Result};

/// 字符串键值缓存
#[async_trait]
pub trait Cache: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// 清空当前命名空间
    async fn clear(&self) -> Result<()>;
}

/// 缓存工厂（由平台层实现，或使用默认实现）
#[async_trait]
pub trait CacheFactory: Send + Sync + fmt::Debug {
    /// 打开（或创建）指定命名空间的缓存
    async fn open(&self, namespace: &str) -> Result<Arc<dyn Cache>>;
}

/// 由 homeserver 与用户派生缓存命名空间：`roomsync_{sha256 前 16 位}`
pub fn namespace_for(homeserver_url: &str, user_id: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(homeserver_url.as_bytes());
    hasher.update(b"|");
    hasher.update(user_id.unwrap_or("_").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("roomsync_{}", &digest[..16])
}

/// token 指纹，用于没有 user_id 的 token 登录：`token:{sha256 前 16 位}`
pub fn token_fingerprint(access_token: &str) -> String {
    let digest = hex::encode(Sha256::digest(access_token.as_bytes()));
    format!("token:{}", &digest[..16])
}

// ============================================================
// 内存缓存
// ============================================================

/// 进程内缓存
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, String>>,
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }
}

/// 默认缓存工厂：同一命名空间返回同一个 `MemoryCache`
#[derive(Debug, Default)]
pub struct MemoryCacheFactory {
    caches: RwLock<HashMap<String, Arc<MemoryCache>>>,
}

impl MemoryCacheFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheFactory for MemoryCacheFactory {
    async fn open(&self, namespace: &str) -> Result<Arc<dyn Cache>> {
        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(MemoryCache::default()))
            .clone();
        debug!("memory cache opened: namespace={}", namespace);
        Ok(cache)
    }
}

// ============================================================
// sled 缓存
// ============================================================

/// sled Tree 上的缓存
#[derive(Debug)]
pub struct SledCache {
    tree: sled::Tree,
}

#[async_trait]
impl Cache for SledCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => {
                let value = String::from_utf8(bytes.to_vec())
                    .map_err(|e| RoomSyncError::Cache(format!("非 UTF-8 缓存值: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.tree.insert(key.as_bytes(), value.as_bytes())?;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.tree.remove(key.as_bytes())?;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.tree.clear()?;
        self.tree.flush_async().await?;
        Ok(())
    }
}

/// 基于 sled 的持久化缓存工厂
pub struct SledCacheFactory {
    path: PathBuf,
    db: sled::Db,
}

impl fmt::Debug for SledCacheFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SledCacheFactory")
            .field("path", &self.path)
            .finish()
    }
}

impl SledCacheFactory {
    /// 在 `base_path/cache` 下打开 sled 数据库
    pub fn open(base_path: &Path) -> Result<Self> {
        let path = base_path.join("cache");
        std::fs::create_dir_all(&path)
            .map_err(|e| RoomSyncError::Cache(format!("创建缓存目录失败: {}", e)))?;
        let db = sled::open(&path)?;
        info!("✅ sled 缓存已打开: {}", path.display());
        Ok(Self { path, db })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CacheFactory for SledCacheFactory {
    async fn open(&self, namespace: &str) -> Result<Arc<dyn Cache>> {
        let tree = self.db.open_tree(namespace)?;
        debug!("sled cache opened: namespace={}", namespace);
        Ok(Arc::new(SledCache { tree }))
    }
}
