//! 弹性调用层
//!
//! `ResilienceLayer::call` 将一次外部调用包进该服务的熔断器与重试策略；每个决策
//! （类别、尝试次数、动作）都会记录并作为事件发出。fallback 链由调用方（ToolExecutor）驱动：
//! 本层返回 Err 即表示当前 provider 已放弃。

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ResilienceSection;
use crate::core::HiveError;
use crate::observability::{EventKind, EventSink, ObservabilityEvent};
use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, ErrorCategory, RecoveryAction, RetryPolicy,
};

const MAX_DECISIONS: usize = 1024;

/// 决策动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    /// 熔断器拒绝，未触达 provider
    Rejected,
    Retry,
    Fallback,
    Surface,
    /// 重试后成功
    Recovered,
}

/// 单条弹性决策记录
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceDecision {
    pub service_id: String,
    pub task_id: Option<String>,
    pub category: Option<ErrorCategory>,
    pub attempt: u32,
    pub action: DecisionAction,
    pub at: DateTime<Utc>,
}

pub struct ResilienceLayer {
    breakers: CircuitBreakerRegistry,
    policy: RetryPolicy,
    sink: Option<Arc<dyn EventSink>>,
    decisions: Mutex<VecDeque<ResilienceDecision>>,
    degraded_fallback: bool,
}

impl Default for ResilienceLayer {
    fn default() -> Self {
        Self::from_config(&ResilienceSection::default())
    }
}

impl ResilienceLayer {
    pub fn new(breaker_config: CircuitBreakerConfig, policy: RetryPolicy) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(breaker_config),
            policy,
            sink: None,
            decisions: Mutex::new(VecDeque::new()),
            degraded_fallback: true,
        }
    }

    pub fn from_config(section: &ResilienceSection) -> Self {
        let mut layer = Self::new(section.into(), section.into());
        layer.degraded_fallback = section.degraded_fallback;
        layer
    }

    /// 设置事件采集器（熔断迁移与决策事件都会发往此处）
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.breakers = self.breakers.with_sink(Arc::clone(&sink));
        self.sink = Some(sink);
        self
    }

    pub fn with_degraded_fallback(mut self, enabled: bool) -> Self {
        self.degraded_fallback = enabled;
        self
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// fallback 链耗尽后是否允许返回降级结果
    pub fn degraded_fallback(&self) -> bool {
        self.degraded_fallback
    }

    /// 在熔断 + 重试保护下执行 op；op 每次尝试都会被重新调用
    pub async fn call<T, F, Fut>(
        &self,
        service_id: &str,
        task_id: Option<&str>,
        mut op: F,
    ) -> Result<T, HiveError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HiveError>>,
    {
        let breaker = self.breakers.breaker(service_id);
        let mut attempt: u32 = 0;
        loop {
            let permit = match breaker.acquire() {
                Ok(p) => p,
                Err(e) => {
                    self.record(
                        service_id,
                        task_id,
                        Some(ErrorCategory::Unavailable),
                        attempt,
                        DecisionAction::Rejected,
                    );
                    return Err(e);
                }
            };
            attempt += 1;

            match op().await {
                Ok(value) => {
                    permit.success();
                    if attempt > 1 {
                        self.record(service_id, task_id, None, attempt, DecisionAction::Recovered);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let category = ErrorCategory::classify(&err);
                    if category == ErrorCategory::Validation {
                        permit.neutral();
                    } else {
                        permit.failure();
                    }
                    match self.policy.decide(&err, attempt) {
                        RecoveryAction::Retry { delay } => {
                            tracing::debug!(
                                service = service_id,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "retrying"
                            );
                            self.record(service_id, task_id, Some(category), attempt, DecisionAction::Retry);
                            tokio::time::sleep(delay).await;
                        }
                        RecoveryAction::Fallback => {
                            tracing::warn!(service = service_id, attempt, error = %err, "giving up on provider");
                            self.record(service_id, task_id, Some(category), attempt, DecisionAction::Fallback);
                            return Err(err);
                        }
                        RecoveryAction::Surface => {
                            self.record(service_id, task_id, Some(category), attempt, DecisionAction::Surface);
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// 最近的决策记录（按时间顺序）
    pub fn decisions(&self) -> Vec<ResilienceDecision> {
        self.decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn record(
        &self,
        service_id: &str,
        task_id: Option<&str>,
        category: Option<ErrorCategory>,
        attempt: u32,
        action: DecisionAction,
    ) {
        let decision = ResilienceDecision {
            service_id: service_id.to_string(),
            task_id: task_id.map(str::to_string),
            category,
            attempt,
            action,
            at: Utc::now(),
        };
        if let Some(sink) = &self.sink {
            sink.emit(ObservabilityEvent::new(
                EventKind::ResilienceDecision,
                task_id,
                serde_json::to_value(&decision).unwrap_or_default(),
            ));
        }
        let mut log = self.decisions.lock().unwrap_or_else(PoisonError::into_inner);
        if log.len() == MAX_DECISIONS {
            log.pop_front();
        }
        log.push_back(decision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitStatus;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn layer(threshold: u32, cooldown_ms: u64, policy: RetryPolicy) -> ResilienceLayer {
        ResilienceLayer::new(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_millis(cooldown_ms),
                max_cooldown: Duration::from_millis(cooldown_ms * 8),
                backoff_multiplier: 2.0,
            },
            policy,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_rejects_without_calling_provider() {
        // threshold=3, cooldown=1000ms
        let layer = layer(3, 1000, RetryPolicy::no_retry());
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let result: Result<(), _> = layer
                .call("media", None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(HiveError::Transient("connection refused".into()))
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(layer.breakers().breaker("media").status(), CircuitStatus::Open);

        tokio::time::advance(Duration::from_millis(500)).await;
        let fourth: Result<(), _> = layer
            .call("media", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(fourth, Err(HiveError::ToolUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "provider must not be reached");

        let last = layer.decisions().pop().unwrap();
        assert_eq!(last.action, DecisionAction::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_closes_circuit() {
        let layer = layer(3, 1000, RetryPolicy::no_retry());
        for _ in 0..3 {
            let _: Result<(), _> = layer
                .call("media", None, || async { Err(HiveError::Timeout("slow".into())) })
                .await;
        }
        tokio::time::advance(Duration::from_millis(1000)).await;
        let trial: Result<u8, _> = layer.call("media", None, || async { Ok(7) }).await;
        assert_eq!(trial.unwrap(), 7);
        assert_eq!(layer.breakers().breaker("media").status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retried_until_success() {
        let layer = layer(10, 1000, RetryPolicy::default());
        let calls = AtomicU32::new(0);
        let result = layer
            .call("search", Some("task_1"), || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(HiveError::Transient("reset".into()))
                } else {
                    Ok("found")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "found");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let actions: Vec<_> = layer.decisions().into_iter().map(|d| d.action).collect();
        assert_eq!(
            actions,
            vec![DecisionAction::Retry, DecisionAction::Retry, DecisionAction::Recovered]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_surfaces_immediately() {
        let layer = layer(1, 1000, RetryPolicy::default());
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = layer
            .call("db", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HiveError::validation("missing field"))
            })
            .await;
        assert!(matches!(result, Err(HiveError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // 校验错误不计入熔断
        assert_eq!(layer.breakers().breaker("db").status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_surfaces_on_first_attempt() {
        let layer = ResilienceLayer::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = layer
            .call("disk", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HiveError::Fatal("disk corrupted".into()))
            })
            .await;
        assert!(matches!(result, Err(HiveError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let decision = layer.decisions().pop().unwrap();
        assert_eq!(decision.category, Some(ErrorCategory::Fatal));
        assert_eq!(decision.action, DecisionAction::Surface);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassified_retried_once_then_fallback() {
        let layer = layer(10, 1000, RetryPolicy::default());
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = layer
            .call("llm", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HiveError::ToolFailed("unexpected payload".into()))
            })
            .await;
        assert!(matches!(result, Err(HiveError::ToolFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(layer.decisions().last().unwrap().action, DecisionAction::Fallback);
    }
}
