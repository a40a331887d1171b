//! 提案、评估与协商会话记录

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    /// 产出该提案的 agent
    pub agent_id: String,
    pub content: String,
    /// 最近一轮的聚合认可度
    pub approval: f64,
    pub concerns: Vec<String>,
    pub modifications: Vec<String>,
    /// 经过调解修订的次数
    pub revision: u32,
}

impl Proposal {
    pub fn new(agent_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: format!("prop_{}", uuid::Uuid::new_v4()),
            agent_id: agent_id.into(),
            content: content.into(),
            approval: 0.0,
            concerns: Vec::new(),
            modifications: Vec::new(),
            revision: 0,
        }
    }
}

/// 参与者对提案的评估
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub agent_id: String,
    /// [0,1]
    pub approval: f64,
    pub concerns: Vec<String>,
    pub modifications: Vec<String>,
}

impl Evaluation {
    pub fn new(agent_id: impl Into<String>, approval: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            approval: approval.clamp(0.0, 1.0),
            concerns: Vec::new(),
            modifications: Vec::new(),
        }
    }

    pub fn with_concern(mut self, concern: impl Into<String>) -> Self {
        self.concerns.push(concern.into());
        self
    }

    pub fn with_modification(mut self, modification: impl Into<String>) -> Self {
        self.modifications.push(modification.into());
        self
    }

    /// 轮次超时未作答
    pub fn timed_out(agent_id: impl Into<String>) -> Self {
        Self::new(agent_id, 0.0).with_concern("evaluation timed out")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: usize,
    pub proposal: Proposal,
    pub evaluations: Vec<Evaluation>,
    pub aggregate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TerminalReason {
    Consensus,
    MaxRoundsExhausted,
    Vetoed { agent_id: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationSession {
    pub id: String,
    pub task_id: String,
    pub phase_id: String,
    pub strategy: String,
    pub rounds: Vec<RoundRecord>,
    pub consensus: bool,
    pub terminal_reason: Option<TerminalReason>,
    /// 达成共识时为最终提案；否则为得分最高的提案
    pub final_proposal: Option<Proposal>,
    /// 未达成共识，需要人工裁决
    pub needs_manual_review: bool,
    pub started_at: DateTime<Utc>,
}

impl NegotiationSession {
    pub fn new(task_id: &str, phase_id: &str, strategy: &str) -> Self {
        Self {
            id: format!("neg_{}", uuid::Uuid::new_v4()),
            task_id: task_id.to_string(),
            phase_id: phase_id.to_string(),
            strategy: strategy.to_string(),
            rounds: Vec::new(),
            consensus: false,
            terminal_reason: None,
            final_proposal: None,
            needs_manual_review: false,
            started_at: Utc::now(),
        }
    }

    pub fn round_count(&self) -> usize {
        self.rounds.len()
    }
}
