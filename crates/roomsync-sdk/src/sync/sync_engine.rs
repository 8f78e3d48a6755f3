//! 同步引擎 - 持续拉取循环
//!
//! 每一轮：带上当前游标发起 sync → 交给 `SyncHandler` 应用 → 成功后替换游标 → 立即发起下一轮。
//! 失败只推迟下一轮（按 `RetryPolicy` 退避），致命 token 错误终止循环。
//! 第 N+1 个请求只会在第 N 个 delta 处理完成后发出。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::cursor_store::SyncCursorStore;
use super::retry::SyncFailureReason;
use super::{SyncCursor, SyncDelta};
use crate::config::SyncConfig;
use crate::error::RoomSyncError;
use crate::logging::Logger;
use crate::transport::{SyncRequest, Transport};

/// 处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// 已完整应用，可以推进游标
    Applied,
    /// 未应用，游标保持不变
    Rejected,
}

/// 循环退出原因
#[derive(Debug, Clone, PartialEq)]
pub enum LoopExit {
    Shutdown,
    FatalToken(RoomSyncError),
}

/// 同步结果的消费者
#[async_trait]
pub trait SyncHandler: Send + Sync {
    /// 处理一个 delta；返回 `Rejected` 时游标不会推进
    async fn on_delta(&self, delta: Arc<SyncDelta>) -> SyncOutcome;

    /// 单轮失败（包括致命错误）
    async fn on_error(&self, error: RoomSyncError);
}

/// 同步统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStats {
    pub rounds: u64,
    pub successes: u64,
    pub failures: u64,
    pub apply_failures: u64,
    pub consecutive_failures: u32,
    pub last_cursor: Option<SyncCursor>,
    pub last_success_at: Option<DateTime<Utc>>,
}

pub struct SyncEngine {
    transport: Arc<dyn Transport>,
    cursor_store: Arc<SyncCursorStore>,
    config: SyncConfig,
    logger: Arc<dyn Logger>,
    stats: RwLock<SyncStats>,
}

impl SyncEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        cursor_store: Arc<SyncCursorStore>,
        config: SyncConfig,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            transport,
            cursor_store,
            config,
            logger,
            stats: RwLock::new(SyncStats::default()),
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    pub fn current_cursor(&self) -> Option<SyncCursor> {
        self.cursor_store.current()
    }

    fn next_request(&self) -> SyncRequest {
        let since = self.cursor_store.current();
        SyncRequest {
            // 全量快照时不做长轮询，尽快返回
            timeout_ms: if since.is_some() { self.config.timeout_ms } else { 0 },
            since,
            filter: self.config.filter.clone(),
            full_state: self.config.full_state,
        }
    }

    /// 运行同步循环，直到 `shutdown` 被取消或遇到致命错误
    pub async fn run(&self, handler: &dyn SyncHandler, shutdown: CancellationToken) -> LoopExit {
        self.logger.info("sync loop started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let request = self.next_request();
            if request.since.is_none() {
                self.logger
                    .warn("no sync cursor, requesting full snapshot (this may take a while)");
            }
            self.stats.write().rounds += 1;

            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.transport.sync(request) => result,
            };

            // 已停止时丢弃迟到的响应
            if shutdown.is_cancelled() {
                self.logger.debug("discarding sync response received after shutdown");
                break;
            }

            let failure = match result {
                Ok(delta) => {
                    let delta = Arc::new(delta);
                    match handler.on_delta(delta.clone()).await {
                        SyncOutcome::Applied => {
                            self.commit_cursor(&delta).await;
                            None
                        }
                        SyncOutcome::Rejected => {
                            self.stats.write().apply_failures += 1;
                            Some(SyncFailureReason::Apply)
                        }
                    }
                }
                Err(error) if error.is_fatal() => {
                    self.logger
                        .error(&format!("sync stopped, credential rejected: {}", error));
                    self.record_failure();
                    handler.on_error(error.clone()).await;
                    return LoopExit::FatalToken(error);
                }
                Err(error) => {
                    let reason = SyncFailureReason::from(&error);
                    self.logger.warn(&format!("sync round failed: {}", error));
                    handler.on_error(error).await;
                    Some(reason)
                }
            };

            if let Some(reason) = failure {
                let consecutive = self.record_failure();
                let delay = self.config.retry.delay_for(consecutive, &reason);
                self.logger.debug(&format!(
                    "retrying sync in {:?} (consecutive failures: {})",
                    delay, consecutive
                ));
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.logger.info("sync loop stopped");
        LoopExit::Shutdown
    }

    async fn commit_cursor(&self, delta: &SyncDelta) {
        let cursor = delta.next_cursor.clone();
        if let Err(e) = self.cursor_store.commit(cursor.clone()).await {
            self.logger
                .warn(&format!("failed to persist sync cursor {}: {}", cursor, e));
        }
        let mut stats = self.stats.write();
        stats.successes += 1;
        stats.consecutive_failures = 0;
        stats.last_cursor = Some(cursor);
        stats.last_success_at = Some(Utc::now());
    }

    fn record_failure(&self) -> u32 {
        let mut stats = self.stats.write();
        stats.failures += 1;
        stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
        stats.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LoggerFactory, RecordingLoggerFactory};
    use crate::sync::{Membership, RetryPolicy, RoomUpdate};
    use crate::error::Result;
    use crate::transport::mock::MockTransport;
    use crate::transport::LoginResponse;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        deltas: Mutex<Vec<String>>,
        errors: Mutex<Vec<RoomSyncError>>,
        reject_next: Mutex<usize>,
    }

    #[async_trait]
    impl SyncHandler for Recorder {
        async fn on_delta(&self, delta: Arc<SyncDelta>) -> SyncOutcome {
            let mut reject = self.reject_next.lock();
            if *reject > 0 {
                *reject -= 1;
                return SyncOutcome::Rejected;
            }
            self.deltas.lock().push(delta.next_cursor.to_string());
            SyncOutcome::Applied
        }

        async fn on_error(&self, error: RoomSyncError) {
            self.errors.lock().push(error);
        }
    }

    fn engine(transport: Arc<MockTransport>, loggers: &RecordingLoggerFactory) -> SyncEngine {
        let config = SyncConfig {
            retry: RetryPolicy::immediate(),
            ..SyncConfig::default()
        };
        SyncEngine::new(
            transport,
            Arc::new(SyncCursorStore::in_memory()),
            config,
            loggers.get_logger("sync"),
        )
    }

    fn delta(cursor: &str) -> SyncDelta {
        SyncDelta::new(cursor).with_room(RoomUpdate::new("!a:example.org", Membership::Joined))
    }

    async fn run_until_requests(
        engine: Arc<SyncEngine>,
        transport: Arc<MockTransport>,
        handler: Arc<Recorder>,
        requests: usize,
    ) -> LoopExit {
        let shutdown = CancellationToken::new();
        let task = {
            let engine = engine.clone();
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { engine.run(handler.as_ref(), shutdown).await })
        };
        tokio::time::timeout(Duration::from_secs(5), transport.wait_for_requests(requests))
            .await
            .expect("sync requests issued");
        shutdown.cancel();
        task.await.expect("sync task joined")
    }

    #[tokio::test]
    async fn cursor_advances_after_each_applied_delta() {
        let transport = Arc::new(MockTransport::new());
        transport.push_sync(Ok(delta("c1")));
        transport.push_sync(Ok(delta("c2")));
        let loggers = RecordingLoggerFactory::default();
        let engine = Arc::new(engine(transport.clone(), &loggers));
        let handler = Arc::new(Recorder::default());

        let exit = run_until_requests(engine.clone(), transport.clone(), handler.clone(), 3).await;

        assert_eq!(exit, LoopExit::Shutdown);
        assert_eq!(
            transport.since_values(),
            vec![None, Some("c1".to_string()), Some("c2".to_string())]
        );
        assert_eq!(*handler.deltas.lock(), vec!["c1", "c2"]);
        assert_eq!(engine.current_cursor(), Some(SyncCursor::new("c2")));
        assert_eq!(engine.stats().successes, 2);
        // 仅第一轮没有游标
        assert_eq!(loggers.messages("sync", "warn").len(), 1);
    }

    #[tokio::test]
    async fn round_failure_keeps_cursor_and_continues() {
        let transport = Arc::new(MockTransport::new());
        transport.push_sync(Ok(delta("c1")));
        transport.push_sync(Err(RoomSyncError::SyncRound("connection reset".into())));
        let loggers = RecordingLoggerFactory::default();
        let engine = Arc::new(engine(transport.clone(), &loggers));
        let handler = Arc::new(Recorder::default());

        run_until_requests(engine.clone(), transport.clone(), handler.clone(), 3).await;

        assert_eq!(transport.since_values()[2], Some("c1".to_string()));
        assert_eq!(handler.errors.lock().len(), 1);
        let stats = engine.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.last_cursor, Some(SyncCursor::new("c1")));
    }

    #[tokio::test]
    async fn rejected_delta_is_refetched_from_same_cursor() {
        let transport = Arc::new(MockTransport::new());
        transport.push_sync(Ok(delta("c1")));
        transport.push_sync(Ok(delta("c1")));
        let loggers = RecordingLoggerFactory::default();
        let engine = Arc::new(engine(transport.clone(), &loggers));
        let handler = Arc::new(Recorder::default());
        *handler.reject_next.lock() = 1;

        run_until_requests(engine.clone(), transport.clone(), handler.clone(), 3).await;

        assert_eq!(
            transport.since_values(),
            vec![None, None, Some("c1".to_string())]
        );
        assert_eq!(engine.stats().apply_failures, 1);
    }

    #[tokio::test]
    async fn fatal_token_stops_loop() {
        let transport = Arc::new(MockTransport::new());
        transport.push_sync(Err(RoomSyncError::FatalToken("M_UNKNOWN_TOKEN".into())));
        let loggers = RecordingLoggerFactory::default();
        let engine = engine(transport.clone(), &loggers);
        let handler = Recorder::default();

        let exit = tokio::time::timeout(
            Duration::from_secs(5),
            engine.run(&handler, CancellationToken::new()),
        )
        .await
        .expect("loop exits on fatal error");

        assert!(matches!(exit, LoopExit::FatalToken(_)));
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(handler.errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_before_start_issues_no_request() {
        let transport = Arc::new(MockTransport::new());
        let loggers = RecordingLoggerFactory::default();
        let engine = engine(transport.clone(), &loggers);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let exit = engine.run(&Recorder::default(), shutdown).await;
        assert_eq!(exit, LoopExit::Shutdown);
        assert!(transport.requests().is_empty());
    }

    /// 响应在停止信号之后才到达的传输
    #[derive(Debug)]
    struct LateTransport {
        shutdown: CancellationToken,
        /// true：由传输自己触发停止后立即返回；false：等外部停止后再返回
        cancels_itself: bool,
    }

    #[async_trait]
    impl Transport for LateTransport {
        fn set_security_data(&self, _access_token: Option<String>) {}

        async fn login(&self, _username: &str, _password: &str) -> Result<LoginResponse> {
            Err(RoomSyncError::Auth("unsupported".into()))
        }

        async fn logout(&self) -> Result<()> {
            Ok(())
        }

        async fn sync(&self, _request: SyncRequest) -> Result<SyncDelta> {
            if self.cancels_itself {
                self.shutdown.cancel();
            } else {
                self.shutdown.cancelled().await;
            }
            Ok(delta("late"))
        }
    }

    async fn run_with_late_response(cancels_itself: bool) {
        let shutdown = CancellationToken::new();
        let transport = Arc::new(LateTransport {
            shutdown: shutdown.clone(),
            cancels_itself,
        });
        let cursor_store = Arc::new(SyncCursorStore::in_memory());
        cursor_store.commit(SyncCursor::new("c0")).await.unwrap();
        let loggers = RecordingLoggerFactory::default();
        let engine = Arc::new(SyncEngine::new(
            transport,
            cursor_store,
            SyncConfig::default(),
            loggers.get_logger("sync"),
        ));
        let handler = Arc::new(Recorder::default());

        let task = {
            let engine = engine.clone();
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { engine.run(handler.as_ref(), shutdown).await })
        };
        if !cancels_itself {
            tokio::task::yield_now().await;
            shutdown.cancel();
        }

        let exit = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("loop stops after shutdown")
            .expect("sync task joined");
        assert_eq!(exit, LoopExit::Shutdown);
        assert!(handler.deltas.lock().is_empty());
        assert_eq!(engine.current_cursor(), Some(SyncCursor::new("c0")));
        assert_eq!(engine.stats().successes, 0);
    }

    #[tokio::test]
    async fn response_arriving_with_shutdown_is_discarded() {
        run_with_late_response(true).await;
    }

    #[tokio::test]
    async fn response_arriving_after_shutdown_is_discarded() {
        run_with_late_response(false).await;
    }
}
