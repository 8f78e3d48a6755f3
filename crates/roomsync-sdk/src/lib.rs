//! RoomSync SDK - 基于游标的房间同步客户端
//!
//! 本 SDK 持续从服务端拉取增量（Matrix 风格 `/sync`），应用到本地房间实体，
//! 并按到达顺序通知订阅者：
//! - 🔐 认证：token 或用户名密码登录，凭证自动注入后续请求
//! - 🔄 同步循环：游标推进、失败退避、致命 token 自动停止
//! - 🏠 房间实体：句柄在生命周期内保持不变，原地更新
//! - ⚙️ 事件系统：`Ready`（每个会话一次）、`Sync`、`Error`
//! - 💾 可注入缓存与日志：默认内存缓存 + tracing，可选 sled 持久化
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use roomsync_sdk::{ClientEvent, RoomSyncClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RoomSyncClient::new("https://matrix.example.org")?;
//!     let mut events = client.subscribe();
//!
//!     client.login("syt_access_token").await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             ClientEvent::Ready => println!("初始同步完成，共 {} 个房间", client.rooms().len()),
//!             ClientEvent::Sync(delta) => println!("收到增量: {}", delta.next_cursor),
//!             ClientEvent::Error(e) if e.is_fatal() => break,
//!             ClientEvent::Error(e) => eprintln!("同步失败: {}", e),
//!         }
//!     }
//!
//!     client.logout().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod logging;
pub mod room;
pub mod sync;
pub mod transport;
pub mod version;

// 重新导出核心类型，方便使用
pub use auth::{AuthSession, Credential};
pub use cache::{namespace_for, token_fingerprint, Cache, CacheFactory, MemoryCacheFactory, SledCacheFactory};
pub use client::{ClientState, LoginRequest, RoomSyncClient};
pub use config::{ClientOptions, ClientOptionsBuilder, InternalOptions, RestOptions, SyncConfig, SyncOptions};
pub use entity::{Entity, EntityHandle, EntityManager, ManagerRef};
pub use error::{Result, RoomSyncError};
pub use events::{ClientEvent, EventFilter, EventManager, EventStats, FilteredEventReceiver};
pub use logging::{Logger, LoggerFactory, TracingLogger, TracingLoggerFactory};
pub use room::{Room, RoomSnapshot};
pub use sync::{
    Membership, RetryPolicy, RoomCoordinator, RoomEvent, RoomUpdate, SyncCursor, SyncCursorStore,
    SyncDelta, SyncEngine, SyncStats,
};
pub use transport::{HttpTransport, LoginResponse, SyncRequest, Transport};
pub use version::{SDK_NAME, SDK_VERSION};
