use thiserror::Error;

/// SDK 错误
///
/// 需要通过 broadcast 事件分发给订阅者，因此所有变体只携带可 Clone 的数据。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomSyncError {
    /// 认证失败（登录被拒绝、token 校验失败），不自动重试
    #[error("Authentication error: {0}")]
    Auth(String),
    /// 单轮同步失败（网络、5xx 等），同步循环继续
    #[error("Sync round error: {0}")]
    SyncRound(String),
    /// 应用 delta 到本地状态失败，该 delta 不会被部分提交
    #[error("Apply error: {0}")]
    Apply(String),
    /// 服务端判定 token 永久失效，必须重新登录
    #[error("Fatal token error: {0}")]
    FatalToken(String),
    /// 非 2xx 的 HTTP 响应
    #[error("HTTP error [{status}] {errcode}: {message}")]
    Http {
        status: u16,
        errcode: String,
        message: String,
    },
    #[error("Config error: {0}")]
    Config(String),
    #[error("JSON error: {0}")]
    Json(String),
    #[error("Cache error: {0}")]
    Cache(String),
    #[error("Not logged in")]
    NotLoggedIn,
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Other error: {0}")]
    Other(String),
}

impl RoomSyncError {
    /// 是否为致命错误（同步循环必须停止）
    pub fn is_fatal(&self) -> bool {
        matches!(self, RoomSyncError::FatalToken(_))
    }

    /// 稳定的错误分类字符串，便于上层统计与日志
    pub fn kind(&self) -> &'static str {
        match self {
            RoomSyncError::Auth(_) => "auth",
            RoomSyncError::SyncRound(_) => "sync_round",
            RoomSyncError::Apply(_) => "apply",
            RoomSyncError::FatalToken(_) => "fatal_token",
            RoomSyncError::Http { .. } => "http",
            RoomSyncError::Config(_) => "config",
            RoomSyncError::Json(_) => "json",
            RoomSyncError::Cache(_) => "cache",
            RoomSyncError::NotLoggedIn => "not_logged_in",
            RoomSyncError::InvalidOperation(_) => "invalid_operation",
            RoomSyncError::Other(_) => "other",
        }
    }

    /// HTTP 状态码（仅 `Http` 变体）
    pub fn http_status(&self) -> Option<u16> {
        match self {
            RoomSyncError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for RoomSyncError {
    fn from(error: serde_json::Error) -> Self {
        RoomSyncError::Json(error.to_string())
    }
}

impl From<reqwest::Error> for RoomSyncError {
    fn from(error: reqwest::Error) -> Self {
        RoomSyncError::SyncRound(format!("transport: {}", error))
    }
}

impl From<sled::Error> for RoomSyncError {
    fn from(error: sled::Error) -> Self {
        RoomSyncError::Cache(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RoomSyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_fatal_token_is_fatal() {
        assert!(RoomSyncError::FatalToken("M_UNKNOWN_TOKEN".into()).is_fatal());
        assert!(!RoomSyncError::SyncRound("timeout".into()).is_fatal());
        assert!(!RoomSyncError::Apply("bad room".into()).is_fatal());
        assert!(!RoomSyncError::Auth("forbidden".into()).is_fatal());
    }

    #[test]
    fn http_status_only_on_http_variant() {
        let http = RoomSyncError::Http {
            status: 502,
            errcode: "M_UNKNOWN".into(),
            message: "bad gateway".into(),
        };
        assert_eq!(http.http_status(), Some(502));
        assert_eq!(http.kind(), "http");
        assert!(http.to_string().contains("502"));
        assert_eq!(RoomSyncError::SyncRound("reset".into()).http_status(), None);
    }
}
