//! 弹性层：熔断器 + 重试分类，包裹每一次外部 / 工具调用

pub mod circuit_breaker;
pub mod layer;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitPermit, CircuitState,
    CircuitStatus,
};
pub use layer::{DecisionAction, ResilienceDecision, ResilienceLayer};
pub use retry::{ErrorCategory, RecoveryAction, RetryPolicy};
