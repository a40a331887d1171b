//! 记忆条目

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 存储层级；晋升只允许 short → long
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Short,
    Long,
    Episodic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Observation,
    Action,
    /// 从情景日志或协商会话中归纳出的模式
    Pattern,
}

/// 动作/情景的结果，用于重要性加权
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub content: String,
    /// 语义键（long-term 以此去重）
    pub key: String,
    pub importance: f64,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub tier: MemoryTier,
    pub kind: MemoryKind,
    #[serde(default)]
    pub outcome: Option<Outcome>,
}

impl MemoryItem {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// 一次完整任务执行的情景记录（追加写，只读）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub task_id: String,
    /// 任务类型（brief 的 deliverable），用于模式挖掘分组
    pub task_type: String,
    pub agent_id: String,
    pub role: String,
    pub summary: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Episode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// 以 MemoryItem 视图参与检索
    pub fn as_item(&self) -> MemoryItem {
        MemoryItem {
            id: self.id.clone(),
            content: self.summary.clone(),
            key: format!("episode:{}", self.id),
            importance: match self.outcome {
                Outcome::Success => 1.0,
                Outcome::Failure => 0.7,
            },
            timestamp: self.timestamp,
            expires_at: self.expires_at,
            tier: MemoryTier::Episodic,
            kind: MemoryKind::Action,
            outcome: Some(self.outcome),
        }
    }
}
