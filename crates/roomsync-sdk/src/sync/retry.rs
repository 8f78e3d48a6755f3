use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RoomSyncError;

/// 同步失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SyncFailureReason {
    /// 网络错误（连接失败、超时、响应不完整）
    Network,
    /// 服务端错误（非 2xx）
    ServerError(u16),
    /// 限流（429）
    RateLimited,
    /// 应用 delta 到本地状态失败
    Apply,
    /// token 永久失效 - 不重试
    FatalToken,
    /// 其他错误
    Unknown,
}

impl SyncFailureReason {
    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncFailureReason::FatalToken)
    }

    /// 获取重试延迟倍数
    pub fn get_delay_multiplier(&self) -> f64 {
        match self {
            SyncFailureReason::Network => 1.0,
            SyncFailureReason::ServerError(_) => 1.5,
            SyncFailureReason::RateLimited => 3.0, // 限流需要更长延迟
            _ => 1.0,
        }
    }
}

/// 从错误转换为失败原因
impl From<&RoomSyncError> for SyncFailureReason {
    fn from(error: &RoomSyncError) -> Self {
        match error {
            RoomSyncError::SyncRound(_) => SyncFailureReason::Network,
            RoomSyncError::Http { status: 429, .. } => SyncFailureReason::RateLimited,
            RoomSyncError::Http { status, .. } => SyncFailureReason::ServerError(*status),
            RoomSyncError::Apply(_) => SyncFailureReason::Apply,
            RoomSyncError::FatalToken(_) => SyncFailureReason::FatalToken,
            _ => SyncFailureReason::Unknown,
        }
    }
}

/// 同步退避策略
///
/// 同步循环没有最大重试次数：单轮失败只会推迟下一轮，不会终止循环。
/// 连续失败计数在成功一轮后归零。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// 基础延迟时间（毫秒），为 0 时立即重试
    pub base_delay_ms: u64,
    /// 最大延迟时间（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 不等待，失败后立即发起下一轮
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            backoff_factor: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// 计算第 `consecutive_failures` 次连续失败后的等待时间（从 1 开始计数）
    pub fn delay_for(&self, consecutive_failures: u32, failure_reason: &SyncFailureReason) -> Duration {
        if consecutive_failures == 0 || self.base_delay_ms == 0 {
            return Duration::ZERO;
        }

        // 基础延迟 = base_delay * (backoff_factor ^ (n - 1))
        let exponent = (consecutive_failures - 1).min(32) as f64;
        let base_delay = self.base_delay_ms as f64 * self.backoff_factor.powf(exponent);

        // 应用失败原因的延迟倍数
        let adjusted_delay = base_delay * failure_reason.get_delay_multiplier();

        // 限制最大延迟
        let capped_delay = adjusted_delay.min(self.max_delay_ms as f64);

        // 添加随机抖动
        let jitter = capped_delay * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_failure_reason_from_error() {
        let rate_limited = RoomSyncError::Http {
            status: 429,
            errcode: "M_LIMIT_EXCEEDED".into(),
            message: "slow down".into(),
        };
        assert_eq!(SyncFailureReason::from(&rate_limited), SyncFailureReason::RateLimited);
        assert_eq!(
            SyncFailureReason::from(&RoomSyncError::SyncRound("reset".into())),
            SyncFailureReason::Network
        );
        assert!(!SyncFailureReason::from(&RoomSyncError::FatalToken("x".into())).is_retryable());
        assert!(SyncFailureReason::Apply.is_retryable());
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = no_jitter();
        let reason = SyncFailureReason::Network;

        assert_eq!(policy.delay_for(0, &reason), Duration::ZERO);
        assert_eq!(policy.delay_for(1, &reason), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2, &reason), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3, &reason), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(20, &reason), Duration::from_millis(30000));
    }

    #[test]
    fn test_rate_limited_waits_longer() {
        let policy = no_jitter();
        let network = policy.delay_for(1, &SyncFailureReason::Network);
        let limited = policy.delay_for(1, &SyncFailureReason::RateLimited);
        assert!(limited > network);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.delay_for(1, &SyncFailureReason::Network);
            assert!(delay >= Duration::from_millis(950));
            assert!(delay <= Duration::from_millis(1050));
        }
    }

    #[test]
    fn test_immediate_policy() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.delay_for(5, &SyncFailureReason::RateLimited), Duration::ZERO);
    }
}
