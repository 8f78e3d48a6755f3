//! 认证会话
//!
//! 保存当前凭证，并在登录返回前把 token 交给传输层，保证之后的同步请求都带签名。

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{RoomSyncError, Result};
use crate::logging::Logger;
use crate::transport::Transport;

/// 登录凭证
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish()
    }
}

pub struct AuthSession {
    transport: Arc<dyn Transport>,
    credential: RwLock<Option<Credential>>,
    logger: Arc<dyn Logger>,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("credential", &*self.credential.read())
            .finish()
    }
}

impl AuthSession {
    pub fn new(transport: Arc<dyn Transport>, logger: Arc<dyn Logger>) -> Self {
        Self {
            transport,
            credential: RwLock::new(None),
            logger,
        }
    }

    /// 直接使用已有 token
    pub async fn login_with_token(&self, access_token: &str) -> Result<Credential> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(RoomSyncError::Auth("access_token 不能为空".to_string()));
        }
        Ok(self.install(Credential {
            access_token: access_token.to_string(),
            user_id: None,
            device_id: None,
        }))
    }

    /// 用户名密码换取 token
    pub async fn login_with_password(&self, username: &str, password: &str) -> Result<Credential> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(RoomSyncError::Auth("用户名和密码不能为空".to_string()));
        }

        let response = self
            .transport
            .login(username.trim(), password)
            .await
            .map_err(|e| match e {
                RoomSyncError::Auth(_) => e,
                other => RoomSyncError::Auth(other.to_string()),
            })?;

        if response.access_token.is_empty() {
            return Err(RoomSyncError::Auth("服务端未返回 access_token".to_string()));
        }

        Ok(self.install(Credential {
            access_token: response.access_token,
            user_id: response.user_id,
            device_id: response.device_id,
        }))
    }

    fn install(&self, credential: Credential) -> Credential {
        self.transport
            .set_security_data(Some(credential.access_token.clone()));
        *self.credential.write() = Some(credential.clone());
        self.logger.info(&format!(
            "logged in: user_id={}",
            credential.user_id.as_deref().unwrap_or("<token>")
        ));
        credential
    }

    /// 登出；未登录时直接返回。服务端登出失败只记录日志，本地凭证照样清除。
    pub async fn logout(&self) -> Result<()> {
        let Some(credential) = self.credential.write().take() else {
            return Ok(());
        };

        if let Err(e) = self.transport.logout().await {
            self.logger.warn(&format!(
                "remote logout failed for {}: {}",
                credential.user_id.as_deref().unwrap_or("<token>"),
                e
            ));
        }
        self.transport.set_security_data(None);
        self.logger.info("logged out");
        Ok(())
    }

    /// 仅清除本地凭证（token 已被服务端判定失效）
    pub fn invalidate(&self) {
        if self.credential.write().take().is_some() {
            self.transport.set_security_data(None);
            self.logger.warn("credential invalidated");
        }
    }

    pub fn credential(&self) -> Option<Credential> {
        self.credential.read().clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.credential.read().is_some()
    }
}
