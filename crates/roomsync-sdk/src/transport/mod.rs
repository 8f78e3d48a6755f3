//! 传输层
//!
//! 同步核心只依赖 `Transport` trait；`HttpTransport` 是基于 reqwest 的默认实现。

pub mod http;

pub use http::{bearer_security_worker, HttpTransport, SecurityWorker};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sync::{SyncCursor, SyncDelta};

/// 登录响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// 单轮同步请求
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    /// 缺省表示请求全量快照
    pub since: Option<SyncCursor>,
    pub timeout_ms: u64,
    pub filter: Option<String>,
    pub full_state: bool,
}

impl SyncRequest {
    /// URL query 参数
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("timeout", self.timeout_ms.to_string())];
        if let Some(since) = &self.since {
            pairs.push(("since", since.to_string()));
        }
        if let Some(filter) = &self.filter {
            pairs.push(("filter", filter.clone()));
        }
        if self.full_state {
            pairs.push(("full_state", "true".to_string()));
        }
        pairs
    }
}

/// 远端传输
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// 设置（或清除）后续请求使用的凭证
    fn set_security_data(&self, access_token: Option<String>);

    /// 用户名密码换取 token
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse>;

    /// 使当前 token 在服务端失效
    async fn logout(&self) -> Result<()>;

    /// 拉取一轮增量
    async fn sync(&self, request: SyncRequest) -> Result<SyncDelta>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_omit_absent_fields() {
        let first = SyncRequest {
            since: None,
            timeout_ms: 0,
            filter: None,
            full_state: false,
        };
        assert_eq!(first.query_pairs(), vec![("timeout", "0".to_string())]);

        let next = SyncRequest {
            since: Some(SyncCursor::new("c1")),
            timeout_ms: 30000,
            filter: Some("7".to_string()),
            full_state: true,
        };
        assert_eq!(
            next.query_pairs(),
            vec![
                ("timeout", "30000".to_string()),
                ("since", "c1".to_string()),
                ("filter", "7".to_string()),
                ("full_state", "true".to_string()),
            ]
        );
    }
}
