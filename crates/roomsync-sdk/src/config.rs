//! 客户端配置
//!
//! 用户输入为 `ClientOptions`（或直接传 homeserver URL 字符串），
//! 构造客户端时经 `InternalOptions::resolve` 一次性补全默认值，之后不再变化。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheFactory, MemoryCacheFactory};
use crate::error::{RoomSyncError, Result};
use crate::logging::{LoggerFactory, TracingLoggerFactory};
use crate::sync::RetryPolicy;
use crate::version::default_user_agent;

pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_TIMELINE_LIMIT: usize = 50;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
/// 请求超时 = 长轮询超时 + 该余量
pub const REQUEST_TIMEOUT_MARGIN_SECS: u64 = 30;
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 1000;

/// 同步选项（未设置的字段使用默认值）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// 长轮询超时（毫秒）
    pub timeout_ms: Option<u64>,
    /// 服务端 filter id 或内联 JSON
    pub filter: Option<String>,
    pub full_state: Option<bool>,
    /// 每个房间本地保留的时间线事件数
    pub timeline_limit: Option<usize>,
    pub retry: Option<RetryPolicy>,
    /// 登出时清空房间与游标
    pub clear_on_logout: Option<bool>,
    pub persist_cursor: Option<bool>,
    pub persist_rooms: Option<bool>,
}

/// REST 选项
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestOptions {
    /// 追加的请求头，与默认请求头浅合并，同名（大小写不敏感）时以此为准
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub connect_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

/// 客户端选项（用户输入）
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub homeserver_url: String,
    pub sync: SyncOptions,
    pub rest: RestOptions,
    pub cache: Option<Arc<dyn CacheFactory>>,
    pub logger: Option<Arc<dyn LoggerFactory>>,
    pub event_buffer_size: Option<usize>,
}

impl ClientOptions {
    pub fn new(homeserver_url: impl Into<String>) -> Self {
        Self {
            homeserver_url: homeserver_url.into(),
            ..Default::default()
        }
    }

    pub fn builder(homeserver_url: impl Into<String>) -> ClientOptionsBuilder {
        ClientOptionsBuilder::new(homeserver_url)
    }
}

impl From<&str> for ClientOptions {
    fn from(homeserver_url: &str) -> Self {
        Self::new(homeserver_url)
    }
}

impl From<String> for ClientOptions {
    fn from(homeserver_url: String) -> Self {
        Self::new(homeserver_url)
    }
}

/// `ClientOptions` 构建器
pub struct ClientOptionsBuilder {
    options: ClientOptions,
}

impl ClientOptionsBuilder {
    pub fn new(homeserver_url: impl Into<String>) -> Self {
        Self {
            options: ClientOptions::new(homeserver_url),
        }
    }

    pub fn sync_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.sync.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.options.sync.filter = Some(filter.into());
        self
    }

    pub fn full_state(mut self, full_state: bool) -> Self {
        self.options.sync.full_state = Some(full_state);
        self
    }

    pub fn timeline_limit(mut self, limit: usize) -> Self {
        self.options.sync.timeline_limit = Some(limit);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.options.sync.retry = Some(policy);
        self
    }

    pub fn clear_on_logout(mut self, enabled: bool) -> Self {
        self.options.sync.clear_on_logout = Some(enabled);
        self
    }

    pub fn persist_cursor(mut self, enabled: bool) -> Self {
        self.options.sync.persist_cursor = Some(enabled);
        self
    }

    pub fn persist_rooms(mut self, enabled: bool) -> Self {
        self.options.sync.persist_rooms = Some(enabled);
        self
    }

    /// 追加请求头
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.rest.headers.insert(name.into(), value.into());
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.options.rest.connect_timeout_secs = Some(secs);
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.options.rest.request_timeout_secs = Some(secs);
        self
    }

    pub fn cache(mut self, factory: Arc<dyn CacheFactory>) -> Self {
        self.options.cache = Some(factory);
        self
    }

    pub fn logger(mut self, factory: Arc<dyn LoggerFactory>) -> Self {
        self.options.logger = Some(factory);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.options.event_buffer_size = Some(size);
        self
    }

    pub fn build(self) -> ClientOptions {
        self.options
    }
}

/// 解析后的同步配置
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub timeout_ms: u64,
    pub filter: Option<String>,
    pub full_state: bool,
    pub timeline_limit: usize,
    pub retry: RetryPolicy,
    pub clear_on_logout: bool,
    pub persist_cursor: bool,
    pub persist_rooms: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            filter: None,
            full_state: false,
            timeline_limit: DEFAULT_TIMELINE_LIMIT,
            retry: RetryPolicy::default(),
            clear_on_logout: false,
            persist_cursor: true,
            persist_rooms: true,
        }
    }
}

impl SyncConfig {
    fn resolve(options: SyncOptions) -> Self {
        let defaults = Self::default();
        Self {
            timeout_ms: options.timeout_ms.unwrap_or(defaults.timeout_ms),
            filter: options.filter,
            full_state: options.full_state.unwrap_or(defaults.full_state),
            timeline_limit: options.timeline_limit.unwrap_or(defaults.timeline_limit),
            retry: options.retry.unwrap_or(defaults.retry),
            clear_on_logout: options.clear_on_logout.unwrap_or(defaults.clear_on_logout),
            persist_cursor: options.persist_cursor.unwrap_or(defaults.persist_cursor),
            persist_rooms: options.persist_rooms.unwrap_or(defaults.persist_rooms),
        }
    }
}

/// 解析后的内部配置（只读）
#[derive(Debug, Clone)]
pub struct InternalOptions {
    /// 不带结尾 `/`
    pub homeserver_url: String,
    pub headers: HeaderMap,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub sync: SyncConfig,
    pub cache: Arc<dyn CacheFactory>,
    pub logger: Arc<dyn LoggerFactory>,
    pub event_buffer_size: usize,
}

impl InternalOptions {
    /// 补全默认值并校验
    pub fn resolve(options: impl Into<ClientOptions>) -> Result<Self> {
        let options = options.into();

        let homeserver_url = normalize_homeserver_url(&options.homeserver_url)?;
        let headers = merge_headers(&options.rest.headers)?;
        let sync = SyncConfig::resolve(options.sync);

        let connect_timeout = Duration::from_secs(
            options
                .rest
                .connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        );
        let request_timeout = match options.rest.request_timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => {
                Duration::from_millis(sync.timeout_ms)
                    + Duration::from_secs(REQUEST_TIMEOUT_MARGIN_SECS)
            }
        };
        if request_timeout <= Duration::from_millis(sync.timeout_ms) {
            return Err(RoomSyncError::Config(format!(
                "请求超时 {:?} 必须大于长轮询超时 {}ms",
                request_timeout, sync.timeout_ms
            )));
        }

        let event_buffer_size = options
            .event_buffer_size
            .unwrap_or(DEFAULT_EVENT_BUFFER_SIZE);
        if event_buffer_size == 0 {
            return Err(RoomSyncError::Config("event_buffer_size 必须大于 0".to_string()));
        }

        Ok(Self {
            homeserver_url,
            headers,
            connect_timeout,
            request_timeout,
            sync,
            cache: options
                .cache
                .unwrap_or_else(|| Arc::new(MemoryCacheFactory::new())),
            logger: options
                .logger
                .unwrap_or_else(|| Arc::new(TracingLoggerFactory)),
            event_buffer_size,
        })
    }
}

fn normalize_homeserver_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(RoomSyncError::Config("homeserver_url 不能为空".to_string()));
    }
    let url = Url::parse(trimmed)
        .map_err(|e| RoomSyncError::Config(format!("无效的 homeserver_url {}: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(RoomSyncError::Config(format!(
            "homeserver_url 必须是 http(s) 地址: {}",
            raw
        )));
    }
    Ok(trimmed.to_string())
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(agent) = HeaderValue::from_str(&default_user_agent()) {
        headers.insert(USER_AGENT, agent);
    }
    headers
}

fn merge_headers(overrides: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut headers = default_headers();
    for (name, value) in overrides {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RoomSyncError::Config(format!("无效的请求头名 {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| RoomSyncError::Config(format!("无效的请求头值 {}: {}", name, e)))?;
        headers.insert(name, value);
    }
    Ok(headers)
}
