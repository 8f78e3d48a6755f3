//! HTTP 传输 - Matrix client-server API 子集
//!
//! - `POST /_matrix/client/v3/login`（m.login.password）
//! - `POST /_matrix/client/v3/logout`
//! - `GET  /_matrix/client/v3/sync`

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::{LoginResponse, SyncRequest, Transport};
use crate::config::InternalOptions;
use crate::error::{RoomSyncError, Result};
use crate::sync::{Membership, RoomEvent, RoomUpdate, SyncCursor, SyncDelta};

const LOGIN_PATH: &str = "/_matrix/client/v3/login";
const LOGOUT_PATH: &str = "/_matrix/client/v3/logout";
const SYNC_PATH: &str = "/_matrix/client/v3/sync";

const FATAL_TOKEN_ERRCODES: &[&str] = &["M_UNKNOWN_TOKEN", "M_MISSING_TOKEN"];

/// 根据 token 生成安全请求头
pub type SecurityWorker = Arc<dyn Fn(&str) -> HeaderMap + Send + Sync>;

/// 默认安全头：`Authorization: Bearer <token>`
pub fn bearer_security_worker() -> SecurityWorker {
    Arc::new(|token: &str| {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    })
}

/// 基于 reqwest 的传输
pub struct HttpTransport {
    client: Client,
    base_url: String,
    security_data: RwLock<Option<String>>,
    security_worker: SecurityWorker,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("has_security_data", &self.security_data.read().is_some())
            .finish()
    }
}

impl HttpTransport {
    /// 按解析后的配置创建：默认请求头、连接超时、请求超时
    pub fn new(options: &InternalOptions) -> Result<Self> {
        let client = Client::builder()
            .default_headers(options.headers.clone())
            .connect_timeout(options.connect_timeout)
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| RoomSyncError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ HTTP 传输已创建 (base_url: {})", options.homeserver_url);

        Ok(Self {
            client,
            base_url: options.homeserver_url.clone(),
            security_data: RwLock::new(None),
            security_worker: bearer_security_worker(),
        })
    }

    /// 替换安全头生成方式
    pub fn with_security_worker(mut self, worker: SecurityWorker) -> Self {
        self.security_worker = worker;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn security_headers(&self) -> HeaderMap {
        match self.security_data.read().as_deref() {
            Some(token) => (self.security_worker)(token),
            None => HeaderMap::new(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn set_security_data(&self, access_token: Option<String>) {
        *self.security_data.write() = access_token;
    }

    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse> {
        info!("🔐 登录: user={}", username);

        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": username },
            "password": password,
        });
        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .json(&body)
            .send()
            .await
            .map_err(|e| RoomSyncError::Auth(format!("登录请求失败: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RoomSyncError::Auth(format!("读取登录响应失败: {}", e)))?;

        if !status.is_success() {
            error!("❌ 登录失败，HTTP 状态码: {}", status);
            return Err(classify_login_failure(status.as_u16(), &text));
        }

        let login: LoginResponse = serde_json::from_str(&text)
            .map_err(|e| RoomSyncError::Auth(format!("解析登录响应失败: {}", e)))?;
        if login.access_token.is_empty() {
            return Err(RoomSyncError::Auth("登录响应缺少 access_token".to_string()));
        }

        info!("✅ 登录成功: user_id={:?}", login.user_id);
        Ok(login)
    }

    async fn logout(&self) -> Result<()> {
        let response = self
            .client
            .post(self.url(LOGOUT_PATH))
            .headers(self.security_headers())
            .json(&json!({}))
            .send()
            .await?;

        let status = response.status();
        // token 已失效时服务端返回 401，结果等同于登出成功
        if status.is_success() || status.as_u16() == 401 {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        let wire = WireError::parse(&text);
        Err(RoomSyncError::Http {
            status: status.as_u16(),
            errcode: wire.errcode,
            message: wire.error,
        })
    }

    async fn sync(&self, request: SyncRequest) -> Result<SyncDelta> {
        let is_initial = request.since.is_none();
        debug!(
            "📥 sync request: since={:?}, timeout={}ms",
            request.since.as_ref().map(SyncCursor::as_str),
            request.timeout_ms
        );

        let response = self
            .client
            .get(self.url(SYNC_PATH))
            .headers(self.security_headers())
            .query(&request.query_pairs())
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let error = classify_sync_failure(status.as_u16(), &text);
            warn!("⚠️ sync 响应异常: {}", error);
            return Err(error);
        }

        parse_sync_response(&text, is_initial)
    }
}

/// Matrix 标准错误体
#[derive(Debug, Default, Deserialize)]
struct WireError {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

impl WireError {
    fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_else(|_| WireError {
            errcode: "M_UNKNOWN".to_string(),
            error: body.chars().take(200).collect(),
        })
    }
}

/// sync 非 2xx 响应分类：401 + token 错误码为致命错误，其余为单轮 HTTP 错误
pub(crate) fn classify_sync_failure(status: u16, body: &str) -> RoomSyncError {
    let wire = WireError::parse(body);
    if status == 401 && FATAL_TOKEN_ERRCODES.contains(&wire.errcode.as_str()) {
        return RoomSyncError::FatalToken(format!("{}: {}", wire.errcode, wire.error));
    }
    RoomSyncError::Http {
        status,
        errcode: wire.errcode,
        message: wire.error,
    }
}

/// 登录失败一律为认证错误
pub(crate) fn classify_login_failure(status: u16, body: &str) -> RoomSyncError {
    let wire = WireError::parse(body);
    RoomSyncError::Auth(format!("[{}] {}: {}", status, wire.errcode, wire.error))
}

#[derive(Debug, Deserialize)]
struct WireSyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: WireRooms,
}

#[derive(Debug, Default, Deserialize)]
struct WireRooms {
    #[serde(default)]
    join: BTreeMap<String, WireRoom>,
    #[serde(default)]
    invite: BTreeMap<String, WireInvitedRoom>,
    #[serde(default)]
    leave: BTreeMap<String, WireRoom>,
}

#[derive(Debug, Default, Deserialize)]
struct WireRoom {
    #[serde(default)]
    state: WireEvents,
    #[serde(default)]
    timeline: WireTimeline,
}

#[derive(Debug, Default, Deserialize)]
struct WireInvitedRoom {
    #[serde(default)]
    invite_state: WireEvents,
}

#[derive(Debug, Default, Deserialize)]
struct WireEvents {
    #[serde(default)]
    events: Vec<RoomEvent>,
}

#[derive(Debug, Default, Deserialize)]
struct WireTimeline {
    #[serde(default)]
    events: Vec<RoomEvent>,
    #[serde(default)]
    limited: bool,
}

fn room_update(room_id: String, membership: Membership, room: WireRoom) -> RoomUpdate {
    RoomUpdate {
        room_id,
        membership,
        state: room.state.events,
        timeline: room.timeline.events,
        timeline_limited: room.timeline.limited,
    }
}

/// 解析 sync 响应体，房间顺序：join、invite、leave
pub(crate) fn parse_sync_response(body: &str, is_initial: bool) -> Result<SyncDelta> {
    let wire: WireSyncResponse = serde_json::from_str(body)
        .map_err(|e| RoomSyncError::SyncRound(format!("无效的 sync 响应: {}", e)))?;

    if wire.next_batch.is_empty() {
        return Err(RoomSyncError::SyncRound("sync 响应缺少 next_batch".to_string()));
    }

    let mut delta = SyncDelta::new(wire.next_batch);
    delta.is_initial = is_initial;

    for (room_id, room) in wire.rooms.join {
        delta.rooms.push(room_update(room_id, Membership::Joined, room));
    }
    for (room_id, room) in wire.rooms.invite {
        let mut update = RoomUpdate::new(room_id, Membership::Invited);
        update.state = room.invite_state.events;
        delta.rooms.push(update);
    }
    for (room_id, room) in wire.rooms.leave {
        delta.rooms.push(room_update(room_id, Membership::Left, room));
    }

    Ok(delta)
}
