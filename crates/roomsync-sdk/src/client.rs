//! RoomSync 客户端
//!
//! 组合认证、同步循环、房间协调器与事件系统，对外提供唯一入口。
//!
//! 状态机：`Idle → Authenticating → Syncing → LoggedOut`，
//! 从 `Idle` 或 `LoggedOut` 可以重新登录；登录失败回到之前的状态。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthSession, Credential};
use crate::cache::{namespace_for, token_fingerprint, Cache};
use crate::config::{ClientOptions, InternalOptions};
use crate::entity::{EntityHandle, EntityManager};
use crate::error::{RoomSyncError, Result};
use crate::events::{ClientEvent, EventFilter, EventManager, EventStats, FilteredEventReceiver};
use crate::logging::Logger;
use crate::room::Room;
use crate::sync::{
    LoopExit, RoomCoordinator, SyncCursor, SyncCursorStore, SyncDelta, SyncEngine, SyncHandler,
    SyncOutcome, SyncStats,
};
use crate::transport::{HttpTransport, Transport};

/// 客户端状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    Idle,
    Authenticating,
    Syncing,
    LoggedOut,
}

/// 登录方式
#[derive(Clone)]
pub enum LoginRequest {
    /// 已有 access token
    Token(String),
    /// 用户名密码（m.login.password）
    Password { username: String, password: String },
}

impl LoginRequest {
    pub fn token(access_token: impl Into<String>) -> Self {
        LoginRequest::Token(access_token.into())
    }

    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        LoginRequest::Password {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginRequest::Token(_) => f.write_str("LoginRequest::Token(<redacted>)"),
            LoginRequest::Password { username, .. } => f
                .debug_struct("LoginRequest::Password")
                .field("username", username)
                .finish(),
        }
    }
}

impl From<&str> for LoginRequest {
    fn from(access_token: &str) -> Self {
        LoginRequest::token(access_token)
    }
}

impl From<String> for LoginRequest {
    fn from(access_token: String) -> Self {
        LoginRequest::Token(access_token)
    }
}

/// 一次登录对应的同步会话
struct SyncSession {
    id: String,
    namespace: String,
    cache: Option<Arc<dyn Cache>>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// 同步结果 → 房间与事件
struct ClientSyncHandler {
    session_id: String,
    coordinator: Arc<RoomCoordinator>,
    events: Arc<EventManager>,
    auth: Arc<AuthSession>,
    state: Arc<RwLock<ClientState>>,
    /// 本会话是否已发出 Ready
    ready: AtomicBool,
    logger: Arc<dyn Logger>,
}

#[async_trait]
impl SyncHandler for ClientSyncHandler {
    async fn on_delta(&self, delta: Arc<SyncDelta>) -> SyncOutcome {
        match self.coordinator.handle_sync(&delta).await {
            Ok(rooms) => {
                if !self.ready.swap(true, Ordering::SeqCst) {
                    info!("✅ 同步就绪: session={}, rooms={}", self.session_id, rooms);
                    self.events.emit(ClientEvent::Ready);
                }
                self.events.emit(ClientEvent::Sync(delta));
                SyncOutcome::Applied
            }
            Err(e) => {
                self.logger.error(&format!(
                    "failed to apply delta {}: {}",
                    delta.next_cursor, e
                ));
                self.events.emit(ClientEvent::Error(e));
                SyncOutcome::Rejected
            }
        }
    }

    async fn on_error(&self, error: RoomSyncError) {
        if error.is_fatal() {
            self.auth.invalidate();
            *self.state.write() = ClientState::LoggedOut;
        }
        self.events.emit(ClientEvent::Error(error));
    }
}

/// RoomSync 客户端
pub struct RoomSyncClient {
    options: InternalOptions,
    transport: Arc<dyn Transport>,
    auth: Arc<AuthSession>,
    rooms: Arc<EntityManager<Room>>,
    coordinator: Arc<RoomCoordinator>,
    events: Arc<EventManager>,
    state: Arc<RwLock<ClientState>>,
    session: Mutex<Option<SyncSession>>,
    /// 最近一次会话的同步引擎（登出后保留，便于读取游标与统计）
    engine: RwLock<Option<Arc<SyncEngine>>>,
    /// 最近一次会话的缓存命名空间
    last_namespace: RwLock<Option<String>>,
    logger: Arc<dyn Logger>,
}

impl fmt::Debug for RoomSyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomSyncClient")
            .field("homeserver_url", &self.options.homeserver_url)
            .field("state", &self.state())
            .field("rooms", &self.rooms.len())
            .finish()
    }
}

impl RoomSyncClient {
    /// 使用默认 HTTP 传输创建客户端
    pub fn new(options: impl Into<ClientOptions>) -> Result<Self> {
        let options = InternalOptions::resolve(options)?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&options)?);
        Ok(Self::build(options, transport))
    }

    /// 使用自定义传输创建客户端
    pub fn with_transport(
        options: impl Into<ClientOptions>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let options = InternalOptions::resolve(options)?;
        Ok(Self::build(options, transport))
    }

    fn build(options: InternalOptions, transport: Arc<dyn Transport>) -> Self {
        let loggers = options.logger.clone();
        let rooms = Arc::new(EntityManager::new());
        let coordinator = Arc::new(RoomCoordinator::new(
            rooms.clone(),
            options.sync.timeline_limit,
            options.sync.persist_rooms,
            loggers.get_logger("rooms"),
        ));
        let auth = Arc::new(AuthSession::new(transport.clone(), loggers.get_logger("auth")));
        let events = Arc::new(EventManager::new(options.event_buffer_size));

        info!("🚀 RoomSync 客户端已创建: {}", options.homeserver_url);

        Self {
            transport,
            auth,
            rooms,
            coordinator,
            events,
            state: Arc::new(RwLock::new(ClientState::Idle)),
            session: Mutex::new(None),
            engine: RwLock::new(None),
            last_namespace: RwLock::new(None),
            logger: loggers.get_logger("client"),
            options,
        }
    }

    /// 登录并启动同步循环。
    ///
    /// 返回 `Ok(true)` 表示同步循环已启动；已在认证或同步中时返回 `Ok(false)`，不做任何改变。
    pub async fn login(&self, request: impl Into<LoginRequest>) -> Result<bool> {
        let request = request.into();
        let mut session = self.session.lock().await;

        let prior = {
            let mut state = self.state.write();
            match *state {
                ClientState::Authenticating | ClientState::Syncing => return Ok(false),
                prior => {
                    *state = ClientState::Authenticating;
                    prior
                }
            }
        };

        // 上一个会话可能因致命错误自行结束，等它彻底退出
        if let Some(previous) = session.take() {
            previous.shutdown.cancel();
            if let Err(e) = previous.task.await {
                warn!("上一个同步任务异常退出: {}", e);
            }
        }

        let credential = match self.authenticate(request).await {
            Ok(credential) => credential,
            Err(e) => {
                warn!("❌ 登录失败: {}", e);
                *self.state.write() = prior;
                return Err(e);
            }
        };

        // token 登录拿不到 user_id 时用 token 指纹区分账号
        let identity = credential
            .user_id
            .clone()
            .unwrap_or_else(|| token_fingerprint(&credential.access_token));
        let namespace = namespace_for(&self.options.homeserver_url, Some(&identity));
        let previous_namespace = self.last_namespace.write().replace(namespace.clone());
        if previous_namespace.is_some_and(|previous| previous != namespace) {
            info!("切换账号，清空本地房间");
            self.rooms.clear();
        }

        let cache = match self.options.cache.open(&namespace).await {
            Ok(cache) => Some(cache),
            Err(e) => {
                self.logger
                    .warn(&format!("cache unavailable, continuing without it: {}", e));
                None
            }
        };

        self.coordinator.attach_cache(cache.clone());
        // 游标只有在对应的房间状态也在内存里时才能继续使用
        let rooms_in_place = if self.rooms.is_empty() {
            match self.coordinator.restore_from_cache().await {
                Ok(restored) => restored.is_some(),
                Err(e) => {
                    self.logger
                        .warn(&format!("failed to restore rooms from cache: {}", e));
                    false
                }
            }
        } else {
            true
        };

        let cursor_store = match (&cache, self.options.sync.persist_cursor) {
            (Some(cache), true) => SyncCursorStore::with_cache(cache.clone()),
            _ => SyncCursorStore::in_memory(),
        };
        match cursor_store.load().await {
            Ok(Some(cursor)) if !rooms_in_place => {
                self.logger.warn(&format!(
                    "cached cursor {} has no matching room state, requesting full snapshot",
                    cursor
                ));
                if let Err(e) = cursor_store.reset().await {
                    self.logger
                        .warn(&format!("failed to reset sync cursor: {}", e));
                }
            }
            Ok(_) => {}
            Err(e) => self
                .logger
                .warn(&format!("failed to load sync cursor: {}", e)),
        }

        let engine = Arc::new(SyncEngine::new(
            self.transport.clone(),
            Arc::new(cursor_store),
            self.options.sync.clone(),
            self.options.logger.get_logger("sync"),
        ));
        *self.engine.write() = Some(engine.clone());

        let session_id = Uuid::new_v4().to_string();
        let handler = ClientSyncHandler {
            session_id: session_id.clone(),
            coordinator: self.coordinator.clone(),
            events: self.events.clone(),
            auth: self.auth.clone(),
            state: self.state.clone(),
            ready: AtomicBool::new(false),
            logger: self.options.logger.get_logger("client"),
        };
        let shutdown = CancellationToken::new();

        *self.state.write() = ClientState::Syncing;

        let task = {
            let shutdown = shutdown.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                match engine.run(&handler, shutdown).await {
                    LoopExit::Shutdown => debug!("sync session {} stopped", session_id),
                    LoopExit::FatalToken(e) => {
                        warn!("⚠️ 同步会话 {} 因凭证失效结束: {}", session_id, e)
                    }
                }
            })
        };

        info!(
            "✅ 登录成功，同步已启动: session={}, user_id={:?}",
            session_id, credential.user_id
        );
        *session = Some(SyncSession {
            id: session_id,
            namespace,
            cache,
            shutdown,
            task,
        });
        Ok(true)
    }

    async fn authenticate(&self, request: LoginRequest) -> Result<Credential> {
        match request {
            LoginRequest::Token(token) => self.auth.login_with_token(&token).await,
            LoginRequest::Password { username, password } => {
                self.auth.login_with_password(&username, &password).await
            }
        }
    }

    /// 停止同步并登出；未登录时直接返回 `Ok(())`
    pub async fn logout(&self) -> Result<()> {
        let mut session = self.session.lock().await;

        let current = session.take();
        if let Some(current) = &current {
            info!("正在停止同步会话: {}", current.id);
        }
        if let Some(current) = current {
            current.shutdown.cancel();
            if let Err(e) = current.task.await {
                warn!("同步任务异常退出: {}", e);
            }

            if self.options.sync.clear_on_logout {
                if let Err(e) = self.coordinator.clear().await {
                    self.logger.warn(&format!("failed to clear rooms: {}", e));
                }
                if let Some(cache) = &current.cache {
                    if let Err(e) = cache.clear().await {
                        self.logger.warn(&format!(
                            "failed to clear cache {}: {}",
                            current.namespace, e
                        ));
                    }
                }
                *self.engine.write() = None;
                *self.last_namespace.write() = None;
            }
        }
        self.coordinator.attach_cache(None);

        self.auth.logout().await?;

        let mut state = self.state.write();
        if *state != ClientState::Idle {
            *state = ClientState::LoggedOut;
        }
        info!("👋 已登出");
        Ok(())
    }

    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    pub fn rooms(&self) -> Arc<EntityManager<Room>> {
        self.rooms.clone()
    }

    pub fn room(&self, room_id: &str) -> Option<EntityHandle<Room>> {
        self.rooms.get(room_id)
    }

    pub fn credential(&self) -> Option<Credential> {
        self.auth.credential()
    }

    pub fn options(&self) -> &InternalOptions {
        &self.options
    }

    /// 订阅所有事件。
    ///
    /// 订阅端落后超过 `event_buffer_size` 个事件时，`recv` 返回
    /// `RecvError::Lagged(n)`，这 `n` 个事件（包括 `Sync`）不会再投递。
    /// 需要逐个处理每个 delta 时使用 `add_listener`。
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// 按过滤器订阅；与 `subscribe` 一样可能因落后而丢事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.events.subscribe_filtered(filter)
    }

    /// 添加同步回调；`event_type` 为 `ready` / `sync` / `error` / `*`。
    ///
    /// 回调在同步任务内、下一轮请求发出之前被调用，不会丢事件；回调应尽快返回。
    pub fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.events.add_listener(event_type, listener);
    }

    pub fn event_stats(&self) -> EventStats {
        self.events.get_stats()
    }

    pub fn sync_stats(&self) -> Option<SyncStats> {
        self.engine.read().as_ref().map(|engine| engine.stats())
    }

    pub fn current_cursor(&self) -> Option<SyncCursor> {
        self.engine
            .read()
            .as_ref()
            .and_then(|engine| engine.current_cursor())
    }
}

impl Drop for RoomSyncClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().as_ref() {
            session.shutdown.cancel();
        }
    }
}
