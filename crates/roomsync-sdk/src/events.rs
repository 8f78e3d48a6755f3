//! 事件系统模块 - 客户端对外通知
//!
//! 功能包括：
//! - `Ready`：会话内第一个 delta 应用成功（每次登录只发一次）
//! - `Sync`：每个成功应用的 delta
//! - `Error`：单轮失败、应用失败或致命 token 错误
//! - 事件广播和订阅机制

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::RoomSyncError;
use crate::sync::SyncDelta;

/// 客户端事件
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Ready,
    Sync(Arc<SyncDelta>),
    Error(RoomSyncError),
}

impl ClientEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::Ready => "ready",
            ClientEvent::Sync(_) => "sync",
            ClientEvent::Error(_) => "error",
        }
    }

    /// `Sync` 事件涉及的房间
    pub fn room_ids(&self) -> Vec<&str> {
        match self {
            ClientEvent::Sync(delta) => delta.room_ids().collect(),
            _ => Vec::new(),
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 房间过滤器（仅 `Sync` 事件带房间）
    pub room_ids: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加事件类型过滤
    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// 添加房间过滤
    pub fn with_room_ids(mut self, room_ids: Vec<String>) -> Self {
        self.room_ids = Some(room_ids);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &ClientEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref room_ids) = self.room_ids {
            // 事件没有房间但过滤器要求有
            if !event
                .room_ids()
                .iter()
                .any(|id| room_ids.iter().any(|wanted| wanted.as_str() == *id))
            {
                return false;
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&ClientEvent) + Send + Sync>;

/// 已注册的监听器；`event_type` 为 `None` 时接收所有事件
struct Registration {
    event_type: Option<String>,
    callback: EventListener,
}

impl Registration {
    fn wants(&self, event: &ClientEvent) -> bool {
        self.event_type
            .as_deref()
            .map_or(true, |wanted| wanted == event.event_type())
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间（毫秒时间戳）
    pub last_event_time: Option<i64>,
}

impl EventStats {
    fn record(&mut self, event: &ClientEvent) {
        self.total_events += 1;
        *self
            .events_by_type
            .entry(event.event_type().to_string())
            .or_default() += 1;
        self.last_event_time = Some(Utc::now().timestamp_millis());
    }
}

/// 事件管理器
///
/// 两条投递路径：
/// - broadcast 订阅者：异步接收，落后超过缓冲区容量时收到 `RecvError::Lagged`，中间的事件丢失
/// - 监听器：在同步任务内按注册顺序同步调用，不会丢事件
pub struct EventManager {
    sender: broadcast::Sender<ClientEvent>,
    listeners: RwLock<Vec<Registration>>,
    stats: RwLock<EventStats>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            listeners: RwLock::new(Vec::new()),
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// 发布事件：先调用监听器，再广播
    pub fn emit(&self, event: ClientEvent) {
        debug!("emit {} event", event.event_type());
        self.stats.write().record(&event);

        {
            let listeners = self.listeners.read();
            for registration in listeners.iter().filter(|r| r.wants(&event)) {
                (registration.callback)(&event);
            }
        }

        // 没有订阅者时 send 返回错误，忽略即可
        let _ = self.sender.send(event);
    }

    /// 订阅所有事件（可能因落后而丢事件，见 `EventManager` 说明）
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    /// 按过滤器订阅
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加监听器；`event_type` 为 `*` 时接收所有事件
    pub fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        let registration = Registration {
            event_type: (event_type != "*").then(|| event_type.to_string()),
            callback: Box::new(listener),
        };
        let count = {
            let mut listeners = self.listeners.write();
            listeners.push(registration);
            listeners.len()
        };
        self.stats.write().listener_count = count;
        info!("🔔 已添加事件监听器: {}", event_type);
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }
}

/// 按 `EventFilter` 过滤的订阅端
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<ClientEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<ClientEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 等待下一个匹配的事件；落后时返回 `Lagged`，调用方可以继续接收
    pub async fn recv(&mut self) -> Result<ClientEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 非阻塞接收
    pub fn try_recv(&mut self) -> Result<ClientEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
