//! 同步游标存储
//!
//! 内存中保存当前游标，可选写入缓存：`sync_cursor:since`。
//! 游标只在 delta 完整应用后整体替换，失败的一轮不会推进游标。

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::SyncCursor;
use crate::cache::Cache;
use crate::error::Result;

const CURSOR_KEY: &str = "sync_cursor:since";

#[derive(Debug, Default)]
pub struct SyncCursorStore {
    current: RwLock<Option<SyncCursor>>,
    cache: Option<Arc<dyn Cache>>,
}

impl SyncCursorStore {
    /// 仅内存
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// 带缓存持久化
    pub fn with_cache(cache: Arc<dyn Cache>) -> Self {
        Self {
            current: RwLock::new(None),
            cache: Some(cache),
        }
    }

    /// 内存中没有游标时从缓存恢复
    pub async fn load(&self) -> Result<Option<SyncCursor>> {
        if let Some(cursor) = self.current() {
            return Ok(Some(cursor));
        }
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        let restored = cache.get(CURSOR_KEY).await?.map(SyncCursor::new);
        if let Some(cursor) = &restored {
            debug!("restored sync cursor from cache: {}", cursor);
            *self.current.write() = Some(cursor.clone());
        }
        Ok(restored)
    }

    pub fn current(&self) -> Option<SyncCursor> {
        self.current.read().clone()
    }

    /// 提交新游标：先替换内存值，再写缓存。
    /// 缓存写入失败时内存游标已经生效，错误返回给调用方记录。
    pub async fn commit(&self, cursor: SyncCursor) -> Result<()> {
        *self.current.write() = Some(cursor.clone());
        if let Some(cache) = &self.cache {
            cache.set(CURSOR_KEY, cursor.as_str()).await?;
        }
        Ok(())
    }

    /// 丢弃游标，下一轮将拉取全量快照
    pub async fn reset(&self) -> Result<()> {
        *self.current.write() = None;
        if let Some(cache) = &self.cache {
            cache.remove(CURSOR_KEY).await?;
        }
        Ok(())
    }
}
