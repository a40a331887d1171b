//! 任务、brief 与阶段结果
//!
//! Task 只由 Orchestrator 修改；完成或失败后归档（不删除），保留部分结果。
//! 状态转换：pending → planning → executing ⇄ revising → complete；任何非终态都可进入 failed。

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::plan::ExecutionPlan;
use crate::core::{ErrorKind, FailureReason, HiveError};
use crate::negotiation::NegotiationSession;
use crate::quality::QualityReport;

/// 结构化需求
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Brief {
    pub title: String,
    /// 交付物类型，决定使用哪个计划模板
    pub deliverable: String,
    pub requirements: Vec<String>,
    /// 相关性评估用的关键词
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl Brief {
    pub fn new(title: impl Into<String>, deliverable: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            deliverable: deliverable.into(),
            ..Default::default()
        }
    }

    pub fn requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirements.push(requirement.into());
        self
    }

    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keywords.push(keyword.into());
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), HiveError> {
        if self.title.trim().is_empty() {
            return Err(HiveError::validation("brief title must not be empty"));
        }
        if self.deliverable.trim().is_empty() {
            return Err(HiveError::validation("brief deliverable must not be empty"));
        }
        if self.requirements.iter().all(|r| r.trim().is_empty()) {
            return Err(HiveError::validation("brief needs at least one requirement"));
        }
        if let Some(deadline) = self.deadline {
            if deadline <= now {
                return Err(HiveError::Validation(format!("brief deadline {deadline} is in the past")));
            }
        }
        Ok(())
    }

    /// 交给 agent 的目标描述
    pub fn objective(&self) -> String {
        format!("{}: {}", self.title, self.requirements.join("; "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    Executing,
    Revising,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }

    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (from, Failed) => !from.is_terminal(),
            (Pending, Planning)
            | (Planning, Executing)
            | (Executing, Revising)
            | (Revising, Executing)
            | (Executing, Complete) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Succeeded,
    Failed,
    TimedOut,
}

/// 阶段中单个 agent 的执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchResult {
    pub agent_id: String,
    pub role: String,
    pub status: BranchStatus,
    pub content: Option<String>,
    pub error: Option<FailureReason>,
    pub degraded: bool,
    pub latency_ms: u64,
}

impl BranchResult {
    pub fn succeeded(agent_id: &str, role: &str, content: String, degraded: bool, latency_ms: u64) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            role: role.to_string(),
            status: BranchStatus::Succeeded,
            content: Some(content),
            error: None,
            degraded,
            latency_ms,
        }
    }

    pub fn failed(agent_id: &str, role: &str, error: &HiveError, latency_ms: u64) -> Self {
        let status = if error.kind() == ErrorKind::Timeout {
            BranchStatus::TimedOut
        } else {
            BranchStatus::Failed
        };
        Self {
            agent_id: agent_id.to_string(),
            role: role.to_string(),
            status,
            content: None,
            error: Some(FailureReason::from(error)),
            degraded: false,
            latency_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == BranchStatus::Succeeded
    }
}

/// 未阻断任务、但需要记录的问题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deficiency {
    pub phase_id: String,
    pub agent_id: Option<String>,
    pub kind: ErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Succeeded,
    /// 部分分支失败，但未超过半数
    Partial,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase_id: String,
    pub status: PhaseStatus,
    /// 按 agent id 排序
    pub branches: Vec<BranchResult>,
    pub merged: String,
    pub deficiencies: Vec<Deficiency>,
    pub failure: Option<FailureReason>,
    pub negotiation: Option<NegotiationSession>,
    pub quality: Option<QualityReport>,
    pub revisions: u32,
    pub escalated: bool,
}

impl PhaseResult {
    pub fn new(phase_id: &str) -> Self {
        Self {
            phase_id: phase_id.to_string(),
            status: PhaseStatus::Succeeded,
            branches: Vec::new(),
            merged: String::new(),
            deficiencies: Vec::new(),
            failure: None,
            negotiation: None,
            quality: None,
            revisions: 0,
            escalated: false,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.status == PhaseStatus::Aborted
    }

    pub fn abort(&mut self, error: &HiveError) {
        self.status = PhaseStatus::Aborted;
        self.failure = Some(FailureReason::from(error));
    }

    pub fn branch(&self, agent_id: &str) -> Option<&BranchResult> {
        self.branches.iter().find(|b| b.agent_id == agent_id)
    }

    pub fn note(&mut self, agent_id: Option<&str>, kind: ErrorKind, detail: impl Into<String>) {
        self.deficiencies.push(Deficiency {
            phase_id: self.phase_id.clone(),
            agent_id: agent_id.map(str::to_string),
            kind,
            detail: detail.into(),
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub brief: Brief,
    pub status: TaskStatus,
    pub deadline: Option<DateTime<Utc>>,
    pub plan: Option<ExecutionPlan>,
    pub phase_results: Vec<PhaseResult>,
    pub output: Option<String>,
    pub failure: Option<FailureReason>,
    pub escalations: Vec<String>,
    pub revisions: u32,
    pub needs_manual_review: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(brief: Brief) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            deadline: brief.deadline,
            brief,
            status: TaskStatus::Pending,
            plan: None,
            phase_results: Vec::new(),
            output: None,
            failure: None,
            escalations: Vec::new(),
            revisions: 0,
            needs_manual_review: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, to: TaskStatus) -> Result<TaskStatus, HiveError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(HiveError::Validation(format!(
                "task '{}' cannot move from {from:?} to {to:?}",
                self.id
            )));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(from)
    }

    /// 所有阶段的缺陷（部分成功、降级结果、未达共识、质量升级）
    pub fn deficiencies(&self) -> Vec<&Deficiency> {
        self.phase_results
            .iter()
            .flat_map(|p| p.deficiencies.iter())
            .collect()
    }

    pub fn is_incomplete(&self) -> bool {
        self.status == TaskStatus::Failed
            || self.needs_manual_review
            || self.phase_results.iter().any(|p| !p.deficiencies.is_empty())
    }
}

/// 活动任务与归档任务
#[derive(Debug, Default)]
pub struct TaskStore {
    active: RwLock<HashMap<String, Task>>,
    archived: RwLock<HashMap<String, Task>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) {
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id.clone(), task);
    }

    /// 活动或已归档任务的快照
    pub fn get(&self, task_id: &str) -> Option<Task> {
        if let Some(t) = self.active.read().unwrap_or_else(PoisonError::into_inner).get(task_id) {
            return Some(t.clone());
        }
        self.archived
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    pub fn is_archived(&self, task_id: &str) -> bool {
        self.archived
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(task_id)
    }

    /// 修改活动任务；已归档或不存在返回 ValidationError
    pub fn update<R>(&self, task_id: &str, f: impl FnOnce(&mut Task) -> R) -> Result<R, HiveError> {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        let task = active
            .get_mut(task_id)
            .ok_or_else(|| HiveError::Validation(format!("no active task '{task_id}'")))?;
        let result = f(task);
        task.updated_at = Utc::now();
        Ok(result)
    }

    /// 从活动表移入归档表
    pub fn archive(&self, task_id: &str) -> Option<Task> {
        let task = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id)?;
        self.archived
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id.clone(), task.clone());
        Some(task)
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn brief() -> Brief {
        Brief::new("Tokio guide", "blog").requirement("explain tasks")
    }

    #[test]
    fn test_brief_validation() {
        let now = Utc::now();
        assert!(brief().validate(now).is_ok());
        assert!(Brief::new("", "blog").requirement("x").validate(now).is_err());
        assert!(Brief::new("t", " ").requirement("x").validate(now).is_err());
        assert!(Brief::new("t", "blog").validate(now).is_err());
        let late = brief().with_deadline(now - Duration::seconds(1));
        assert!(matches!(late.validate(now), Err(HiveError::Validation(_))));
    }

    #[test]
    fn test_status_transitions() {
        let mut task = Task::new(brief());
        assert!(task.set_status(TaskStatus::Executing).is_err());
        task.set_status(TaskStatus::Planning).unwrap();
        task.set_status(TaskStatus::Executing).unwrap();
        task.set_status(TaskStatus::Revising).unwrap();
        task.set_status(TaskStatus::Executing).unwrap();
        task.set_status(TaskStatus::Complete).unwrap();
        assert!(task.set_status(TaskStatus::Failed).is_err());
    }

    #[test]
    fn test_timeout_branch_is_marked_timed_out() {
        let b = BranchResult::failed("b", "writer", &HiveError::Timeout("5000ms".into()), 5000);
        assert_eq!(b.status, BranchStatus::TimedOut);
        assert_eq!(b.error.unwrap().kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_store_archives_instead_of_deleting() {
        let store = TaskStore::new();
        let task = Task::new(brief());
        let id = task.id.clone();
        store.insert(task);
        store.update(&id, |t| t.output = Some("partial".into())).unwrap();
        store.archive(&id).unwrap();
        assert!(store.is_archived(&id));
        assert_eq!(store.get(&id).unwrap().output.as_deref(), Some("partial"));
        assert!(store.update(&id, |_| ()).is_err());
    }
}
