//! 日志注入点
//!
//! SDK 内部各子系统通过 `LoggerFactory::get_logger(subsystem)` 获取命名 logger。
//! 平台层可以注入自己的实现（例如转发到 App 的日志系统）；
//! 未注入时使用 `TracingLoggerFactory`，统一输出到 `tracing`。

use std::fmt;
use std::sync::Arc;

/// 命名 logger
pub trait Logger: Send + Sync + fmt::Debug {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// logger 工厂（由平台层实现，或使用默认实现）
pub trait LoggerFactory: Send + Sync + fmt::Debug {
    /// 获取指定子系统的 logger
    fn get_logger(&self, subsystem: &str) -> Arc<dyn Logger>;
}

/// 默认 logger：转发到 tracing，附带 subsystem 字段
#[derive(Debug, Clone)]
pub struct TracingLogger {
    subsystem: String,
}

impl TracingLogger {
    pub fn new(subsystem: impl Into<String>) -> Self {
        Self {
            subsystem: subsystem.into(),
        }
    }

    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }
}

impl Logger for TracingLogger {
    fn debug(&self, message: &str) {
        tracing::debug!(subsystem = %self.subsystem, "{}", message);
    }

    fn info(&self, message: &str) {
        tracing::info!(subsystem = %self.subsystem, "{}", message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!(subsystem = %self.subsystem, "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(subsystem = %self.subsystem, "{}", message);
    }
}

/// 默认 logger 工厂
#[derive(Debug, Default, Clone)]
pub struct TracingLoggerFactory;

impl LoggerFactory for TracingLoggerFactory {
    fn get_logger(&self, subsystem: &str) -> Arc<dyn Logger> {
        Arc::new(TracingLogger::new(subsystem))
    }
}


#[cfg(test)]
pub use test_helpers::RecordingLoggerFactory;
