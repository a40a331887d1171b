//! 重试分类
//!
//! 根据错误类别给出恢复动作：transient 按指数退避重试到 N 次；限流按 provider 指定或默认时间等待；
//! 校验/业务错误与致命错误立即上抛；熔断打开直接进入 fallback；未分类错误重试一次后进入 fallback 链。

use std::time::Duration;

use serde::Serialize;

use crate::config::ResilienceSection;
use crate::core::HiveError;

/// 重试视角下的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Transient,
    RateLimit,
    Unavailable,
    /// 无恢复路径，终止任务
    Fatal,
    Unclassified,
}

impl ErrorCategory {
    pub fn classify(err: &HiveError) -> Self {
        match err {
            HiveError::Validation(_) | HiveError::Config(_) => ErrorCategory::Validation,
            HiveError::Transient(_) | HiveError::Timeout(_) => ErrorCategory::Transient,
            HiveError::RateLimited { .. } => ErrorCategory::RateLimit,
            HiveError::ToolUnavailable(_) => ErrorCategory::Unavailable,
            HiveError::Fatal(_) => ErrorCategory::Fatal,
            _ => ErrorCategory::Unclassified,
        }
    }
}

/// 弹性层根据错误给出的动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 等待后重试同一 provider
    Retry { delay: Duration },
    /// 放弃当前 provider，交给 fallback 链
    Fallback,
    /// 立即上抛，不重试
    Surface,
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// transient / 限流最多尝试次数（含首次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub rate_limit_wait: Duration,
    /// 未分类错误额外重试次数
    pub unclassified_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ResilienceSection::default())
    }
}

impl From<&ResilienceSection> for RetryPolicy {
    fn from(s: &ResilienceSection) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms.max(s.base_delay_ms)),
            multiplier: s.backoff_multiplier.max(1.0),
            rate_limit_wait: Duration::from_millis(s.rate_limit_wait_ms),
            unclassified_retries: 1,
        }
    }
}

impl RetryPolicy {
    /// 不重试（每次调用只尝试一次）
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            unclassified_retries: 0,
            ..Self::default()
        }
    }

    /// 第 attempt 次（从 1 开始）失败后的退避时长
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let delay = self.base_delay.mul_f64(self.multiplier.powi(exp));
        delay.min(self.max_delay)
    }

    /// 根据错误与已尝试次数决定下一步
    pub fn decide(&self, err: &HiveError, attempt: u32) -> RecoveryAction {
        match ErrorCategory::classify(err) {
            ErrorCategory::Validation | ErrorCategory::Fatal => RecoveryAction::Surface,
            ErrorCategory::Unavailable => RecoveryAction::Fallback,
            ErrorCategory::Transient => {
                if attempt < self.max_attempts {
                    RecoveryAction::Retry {
                        delay: self.backoff(attempt),
                    }
                } else {
                    RecoveryAction::Fallback
                }
            }
            ErrorCategory::RateLimit => {
                if attempt < self.max_attempts {
                    let delay = match err {
                        HiveError::RateLimited {
                            retry_after_ms: Some(ms),
                        } => Duration::from_millis(*ms),
                        _ => self.rate_limit_wait,
                    };
                    RecoveryAction::Retry { delay }
                } else {
                    RecoveryAction::Fallback
                }
            }
            ErrorCategory::Unclassified => {
                if attempt <= self.unclassified_retries {
                    RecoveryAction::Retry {
                        delay: self.base_delay,
                    }
                } else {
                    RecoveryAction::Fallback
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            multiplier: 2.0,
            rate_limit_wait: Duration::from_millis(700),
            unclassified_retries: 1,
        }
    }

    #[test]
    fn test_validation_never_retried() {
        let action = policy().decide(&HiveError::validation("bad params"), 1);
        assert_eq!(action, RecoveryAction::Surface);
    }

    #[test]
    fn test_fatal_surfaces_without_retry() {
        let err = HiveError::Fatal("disk corrupted".into());
        assert_eq!(ErrorCategory::classify(&err), ErrorCategory::Fatal);
        assert_eq!(policy().decide(&err, 1), RecoveryAction::Surface);
    }

    #[test]
    fn test_transient_backoff_then_fallback() {
        let p = policy();
        let err = HiveError::Transient("connection reset".into());
        assert_eq!(
            p.decide(&err, 1),
            RecoveryAction::Retry { delay: Duration::from_millis(100) }
        );
        assert_eq!(
            p.decide(&err, 2),
            RecoveryAction::Retry { delay: Duration::from_millis(200) }
        );
        assert_eq!(p.decide(&err, 3), RecoveryAction::Fallback);
        // 退避有上限
        assert_eq!(p.backoff(5), Duration::from_millis(250));
    }

    #[test]
    fn test_rate_limit_uses_provider_wait() {
        let p = policy();
        let hinted = HiveError::RateLimited { retry_after_ms: Some(42) };
        assert_eq!(
            p.decide(&hinted, 1),
            RecoveryAction::Retry { delay: Duration::from_millis(42) }
        );
        let bare = HiveError::RateLimited { retry_after_ms: None };
        assert_eq!(
            p.decide(&bare, 1),
            RecoveryAction::Retry { delay: Duration::from_millis(700) }
        );
    }

    #[test]
    fn test_unclassified_retried_once() {
        let p = policy();
        let err = HiveError::ToolFailed("weird".into());
        assert!(matches!(p.decide(&err, 1), RecoveryAction::Retry { .. }));
        assert_eq!(p.decide(&err, 2), RecoveryAction::Fallback);
    }

    #[test]
    fn test_open_circuit_goes_to_fallback() {
        let err = HiveError::ToolUnavailable("open".into());
        assert_eq!(policy().decide(&err, 1), RecoveryAction::Fallback);
        assert_eq!(ErrorCategory::classify(&err), ErrorCategory::Unavailable);
    }
}
