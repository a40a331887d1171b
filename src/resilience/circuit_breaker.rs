//! 熔断器
//!
//! 每个外部服务一个 CircuitBreaker，状态只允许 CLOSED → OPEN → HALF_OPEN → {CLOSED | OPEN}。
//! 状态在每服务一把锁下变更（单写者），OPEN 期间直接拒绝而不触达 provider；
//! HALF_OPEN 只放行一次试探调用，试探失败时冷却时间按指数退避增长（有上限）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::ResilienceSection;
use crate::core::HiveError;
use crate::observability::{EventKind, EventSink, ObservabilityEvent};

/// 熔断状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// 熔断参数
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// 连续失败多少次后打开
    pub failure_threshold: u32,
    /// 初始冷却时间
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    pub backoff_multiplier: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&ResilienceSection::default())
    }
}

impl From<&ResilienceSection> for CircuitBreakerConfig {
    fn from(s: &ResilienceSection) -> Self {
        Self {
            failure_threshold: s.failure_threshold.max(1),
            cooldown: Duration::from_millis(s.cooldown_ms),
            max_cooldown: Duration::from_millis(s.max_cooldown_ms.max(s.cooldown_ms)),
            backoff_multiplier: s.backoff_multiplier.max(1.0),
        }
    }
}

/// 单个服务的熔断状态
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub service_id: String,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    /// OPEN 状态下允许下一次试探的时间点
    pub next_retry_at: Option<Instant>,
    /// 当前冷却时长（试探失败后增长）
    pub cooldown: Duration,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<CircuitState>,
    sink: Option<Arc<dyn EventSink>>,
}

impl CircuitBreaker {
    pub fn new(service_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let cooldown = config.cooldown;
        Self {
            config,
            state: Mutex::new(CircuitState {
                service_id: service_id.into(),
                status: CircuitStatus::Closed,
                consecutive_failures: 0,
                next_retry_at: None,
                cooldown,
                trial_in_flight: false,
            }),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn status(&self) -> CircuitStatus {
        self.lock().status
    }

    pub fn snapshot(&self) -> CircuitState {
        self.lock().clone()
    }

    /// 申请一次调用许可；OPEN 且未到冷却时间、或 HALF_OPEN 已有试探在途时拒绝
    pub fn acquire(self: &Arc<Self>) -> Result<CircuitPermit, HiveError> {
        let mut state = self.lock();
        match state.status {
            CircuitStatus::Closed => Ok(CircuitPermit::new(Arc::clone(self), false)),
            CircuitStatus::Open => {
                let ready = state.next_retry_at.map_or(true, |t| Instant::now() >= t);
                if !ready {
                    return Err(HiveError::ToolUnavailable(format!(
                        "circuit open for '{}'",
                        state.service_id
                    )));
                }
                self.transition(&mut state, CircuitStatus::HalfOpen);
                state.trial_in_flight = true;
                Ok(CircuitPermit::new(Arc::clone(self), true))
            }
            CircuitStatus::HalfOpen => {
                if state.trial_in_flight {
                    return Err(HiveError::ToolUnavailable(format!(
                        "circuit half-open for '{}', trial in flight",
                        state.service_id
                    )));
                }
                // 试探结果已记录却仍处于 HALF_OPEN 的情况不会出现；保守起见仍只放行一次
                state.trial_in_flight = true;
                Ok(CircuitPermit::new(Arc::clone(self), true))
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        if trial && state.status == CircuitStatus::HalfOpen {
            state.trial_in_flight = false;
            state.next_retry_at = None;
            state.cooldown = self.config.cooldown;
            self.transition(&mut state, CircuitStatus::Closed);
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut state = self.lock();
        match state.status {
            CircuitStatus::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.next_retry_at = Some(Instant::now() + state.cooldown);
                    self.transition(&mut state, CircuitStatus::Open);
                }
            }
            CircuitStatus::HalfOpen if trial => {
                state.consecutive_failures += 1;
                state.trial_in_flight = false;
                let grown = state.cooldown.mul_f64(self.config.backoff_multiplier);
                state.cooldown = grown.min(self.config.max_cooldown);
                state.next_retry_at = Some(Instant::now() + state.cooldown);
                self.transition(&mut state, CircuitStatus::Open);
            }
            // 打开之前已放行的普通调用迟到的失败，不再改变状态
            _ => {}
        }
    }

    /// 试探调用以中性结果结束（例如参数校验失败）：服务可达，视为恢复
    fn on_neutral(&self, trial: bool) {
        if trial {
            self.on_success(true);
        }
    }

    fn transition(&self, state: &mut CircuitState, to: CircuitStatus) {
        let from = state.status;
        if from == to {
            return;
        }
        state.status = to;
        match to {
            CircuitStatus::Open => tracing::warn!(
                service = %state.service_id,
                failures = state.consecutive_failures,
                cooldown_ms = state.cooldown.as_millis() as u64,
                "circuit opened"
            ),
            _ => tracing::info!(service = %state.service_id, ?from, ?to, "circuit transition"),
        }
        if let Some(sink) = &self.sink {
            sink.emit(ObservabilityEvent::new(
                EventKind::CircuitTransition,
                None,
                serde_json::json!({
                    "service_id": state.service_id,
                    "from": from,
                    "to": to,
                    "consecutive_failures": state.consecutive_failures,
                    "cooldown_ms": state.cooldown.as_millis() as u64,
                }),
            ));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 调用许可：必须以 success / failure / neutral 结束；试探许可被丢弃（调用被取消）时按失败处理
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl CircuitPermit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }

    pub fn neutral(mut self) {
        self.settled = true;
        self.breaker.on_neutral(self.trial);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.on_failure(true);
        }
    }
}

/// 熔断器注册表：按 service id 懒创建，进程内常驻
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// 获取（或首次创建）某服务的熔断器
    pub fn breaker(&self, service_id: &str) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(service_id.to_string())
            .or_insert_with(|| {
                let mut breaker = CircuitBreaker::new(service_id, self.config.clone());
                if let Some(sink) = &self.sink {
                    breaker = breaker.with_sink(Arc::clone(sink));
                }
                Arc::new(breaker)
            })
            .clone()
    }

    pub fn get(&self, service_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service_id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<CircuitState> {
        let map = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut states: Vec<CircuitState> = map.values().map(|b| b.snapshot()).collect();
        states.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MemorySink;

    fn config(threshold: u32, cooldown_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_ms),
            max_cooldown: Duration::from_millis(cooldown_ms * 4),
            backoff_multiplier: 2.0,
        }
    }

    fn fail_n(breaker: &Arc<CircuitBreaker>, n: u32) {
        for _ in 0..n {
            breaker.acquire().unwrap().failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = Arc::new(CircuitBreaker::new("search", config(3, 1000)));
        fail_n(&breaker, 2);
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        fail_n(&breaker, 1);
        assert_eq!(breaker.status(), CircuitStatus::Open);
        assert!(matches!(breaker.acquire(), Err(HiveError::ToolUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let breaker = Arc::new(CircuitBreaker::new("search", config(3, 1000)));
        fail_n(&breaker, 2);
        breaker.acquire().unwrap().success();
        fail_n(&breaker, 2);
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_exactly_one_trial() {
        let breaker = Arc::new(CircuitBreaker::new("media", config(1, 1000)));
        fail_n(&breaker, 1);
        tokio::time::advance(Duration::from_millis(1000)).await;

        let trial = breaker.acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.status(), CircuitStatus::HalfOpen);
        assert!(breaker.acquire().is_err(), "second caller must be rejected");

        trial.success();
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_backoff() {
        let breaker = Arc::new(CircuitBreaker::new("media", config(1, 1000)));
        fail_n(&breaker, 1);
        tokio::time::advance(Duration::from_millis(1000)).await;
        breaker.acquire().unwrap().failure();

        let state = breaker.snapshot();
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.cooldown, Duration::from_millis(2000));

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(breaker.acquire().is_err());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(breaker.acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_is_capped() {
        let breaker = Arc::new(CircuitBreaker::new("media", config(1, 1000)));
        fail_n(&breaker, 1);
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(10)).await;
            breaker.acquire().unwrap().failure();
        }
        assert_eq!(breaker.snapshot().cooldown, Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_counts_as_failure() {
        let breaker = Arc::new(CircuitBreaker::new("media", config(1, 1000)));
        fail_n(&breaker, 1);
        tokio::time::advance(Duration::from_millis(1000)).await;
        drop(breaker.acquire().unwrap());
        assert_eq!(breaker.status(), CircuitStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_emitted() {
        let sink = MemorySink::new();
        let registry = CircuitBreakerRegistry::new(config(1, 100)).with_sink(sink.clone());
        let breaker = registry.breaker("db");
        fail_n(&breaker, 1);
        tokio::time::advance(Duration::from_millis(100)).await;
        breaker.acquire().unwrap().success();
        // CLOSED→OPEN, OPEN→HALF_OPEN, HALF_OPEN→CLOSED
        assert_eq!(sink.count(EventKind::CircuitTransition), 3);
        assert!(Arc::ptr_eq(&breaker, &registry.breaker("db")));
    }
}
