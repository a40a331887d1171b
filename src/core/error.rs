//! 错误分类
//!
//! HiveError 覆盖编排核心中所有可传播的错误；`kind()` 将其映射到对外可见的错误类别，
//! 供任务状态、快照与弹性层的重试分类使用。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 编排核心的统一错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HiveError {
    /// 输入格式错误，永不重试
    #[error("Validation error: {0}")]
    Validation(String),

    /// 超时 / 连接类错误，按指数退避重试
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// 限流：优先使用 provider 给出的等待时间
    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    /// 熔断器打开，直接走 fallback 链
    #[error("Tool unavailable: {0}")]
    ToolUnavailable(String),

    /// 工具返回了无法分类的错误
    #[error("Tool execution failed: {0}")]
    ToolFailed(String),

    #[error("No idle agent available for role '{role}'")]
    NoAgentAvailable { role: String },

    #[error("Message to '{recipient}' undeliverable: {reason}")]
    Undeliverable { recipient: String, reason: String },

    #[error("Consensus not reached after {rounds} rounds")]
    ConsensusFailure { rounds: usize },

    #[error("Quality rejected: {0}")]
    QualityRejected(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    /// 未分类且无恢复路径，终止任务
    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// 对外暴露的错误类别（任务失败原因、快照中使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Transient,
    RateLimit,
    ToolUnavailable,
    ConsensusFailure,
    QualityRejected,
    Timeout,
    NoAgentAvailable,
    Undeliverable,
    Cancelled,
    Unclassified,
    Fatal,
}

impl HiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HiveError::Validation(_) | HiveError::Config(_) => ErrorKind::Validation,
            HiveError::Transient(_) => ErrorKind::Transient,
            HiveError::Timeout(_) => ErrorKind::Timeout,
            HiveError::RateLimited { .. } => ErrorKind::RateLimit,
            HiveError::ToolUnavailable(_) => ErrorKind::ToolUnavailable,
            HiveError::ToolFailed(_) => ErrorKind::Unclassified,
            HiveError::NoAgentAvailable { .. } => ErrorKind::NoAgentAvailable,
            HiveError::Undeliverable { .. } => ErrorKind::Undeliverable,
            HiveError::ConsensusFailure { .. } => ErrorKind::ConsensusFailure,
            HiveError::QualityRejected(_) => ErrorKind::QualityRejected,
            HiveError::Cancelled => ErrorKind::Cancelled,
            HiveError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// 是否应直接终止整个任务（而非记为分支失败）
    pub fn is_fatal(&self) -> bool {
        matches!(self, HiveError::Fatal(_))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        HiveError::Validation(msg.into())
    }
}

impl From<config::ConfigError> for HiveError {
    fn from(e: config::ConfigError) -> Self {
        HiveError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for HiveError {
    fn from(e: serde_json::Error) -> Self {
        HiveError::Validation(format!("json: {e}"))
    }
}

/// 可序列化的失败原因（写入 Task，保证状态反映精确原因）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&HiveError> for FailureReason {
    fn from(e: &HiveError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}
