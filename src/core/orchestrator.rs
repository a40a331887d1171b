//! 编排器：任务生命周期、阶段执行、质量门修订循环
//!
//! 流程：submit_task 校验 brief 并创建 pending 任务；execute_task 生成计划后按拓扑序执行各阶段。
//! 并行阶段每个角色预约一个 agent，分支放入 JoinSet，在阶段截止时间前汇合，超时分支被中止并记为
//! TimeoutError；顺序阶段按角色顺序执行，每一步消费上一步的输出。阶段结果经质量门评分，驳回时带着
//! 结构化意见重新执行，预算耗尽后升级人工复核。任务结束（成功或失败）后归档，保留部分结果。
//! 首次执行任务时为每个 agent 启动收件箱应答循环，agent 执行中向同伴的征询由它们作答。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::{
    AgentContext, AgentHandle, AgentLease, AgentOutput, AgentRegistry, AgentRequirements, AgentSnapshot,
};
use crate::bus::{CommunicationBus, Mailbox};
use crate::config::OrchestratorSection;
use crate::core::plan::{ExecutionPlan, MergePolicy, Phase};
use crate::core::planner::Planner;
use crate::core::supervisor::TaskSupervisor;
use crate::core::task::{BranchResult, Brief, PhaseResult, PhaseStatus, Task, TaskStatus, TaskStore};
use crate::core::{ErrorKind, FailureReason, HiveError};
use crate::memory::Outcome;
use crate::negotiation::{NegotiationEngine, Negotiator, Proposal};
use crate::observability::{EventKind, EventSink, ObservabilityEvent};
use crate::quality::{GateFactory, QualityReport};

/// 编排运行参数（由配置 `[orchestrator]` 派生）
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// 每个阶段质量门驳回后的最多修订次数
    pub revision_budget: u32,
    pub default_phase_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&OrchestratorSection::default())
    }
}

impl From<&OrchestratorSection> for OrchestratorConfig {
    fn from(section: &OrchestratorSection) -> Self {
        Self {
            revision_budget: section.revision_budget,
            default_phase_timeout: Duration::from_millis(section.default_phase_timeout_ms),
        }
    }
}

/// 分支任务的返回值：agent、角色、结果、耗时
type BranchOutcome = (String, String, Result<AgentOutput, HiveError>, Duration);

pub struct Orchestrator {
    config: OrchestratorConfig,
    agents: Arc<AgentRegistry>,
    bus: Arc<CommunicationBus>,
    negotiation: Arc<NegotiationEngine>,
    planner: Planner,
    gate_factory: GateFactory,
    tasks: TaskStore,
    supervisor: TaskSupervisor,
    sink: Arc<dyn EventSink>,
    /// 尚未启动应答循环的收件箱
    mailboxes: Mutex<Vec<Mailbox>>,
    /// 随 Orchestrator 一起 drop（中止全部应答循环）
    responders: Mutex<JoinSet<()>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("agents", &self.agents.len())
            .field("active_tasks", &self.tasks.active_ids())
            .finish()
    }
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        agents: Arc<AgentRegistry>,
        bus: Arc<CommunicationBus>,
        negotiation: Arc<NegotiationEngine>,
        planner: Planner,
        gate_factory: GateFactory,
        sink: Arc<dyn EventSink>,
        mailboxes: Vec<Mailbox>,
    ) -> Self {
        Self {
            config,
            agents,
            bus,
            negotiation,
            planner,
            gate_factory,
            tasks: TaskStore::new(),
            supervisor: TaskSupervisor::new(),
            sink,
            mailboxes: Mutex::new(mailboxes),
            responders: Mutex::new(JoinSet::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn bus(&self) -> &Arc<CommunicationBus> {
        &self.bus
    }

    pub fn negotiation(&self) -> &Arc<NegotiationEngine> {
        &self.negotiation
    }

    pub fn agent_snapshots(&self) -> Vec<AgentSnapshot> {
        self.agents.snapshots()
    }

    /// 为尚未启动的收件箱启动应答循环；须在 tokio 运行时内调用
    fn start_responders(&self) {
        let mailboxes = std::mem::take(&mut *self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner));
        if mailboxes.is_empty() {
            return;
        }
        let mut responders = self.responders.lock().unwrap_or_else(PoisonError::into_inner);
        for mailbox in mailboxes {
            let Some(agent) = self.agents.get(mailbox.agent_id()) else {
                continue;
            };
            responders.spawn(answer_peers(agent, Arc::clone(&self.bus), mailbox));
        }
        tracing::debug!(responders = responders.len(), "peer responders started");
    }

    // ---------- 任务生命周期 ----------

    pub fn submit_task(&self, brief: Brief) -> Result<String, HiveError> {
        brief.validate(Utc::now())?;
        let task = Task::new(brief);
        let id = task.id.clone();
        tracing::info!(task = %id, title = %task.brief.title, deliverable = %task.brief.deliverable, "task submitted");
        self.tasks.insert(task);
        self.emit(
            EventKind::TaskStatusChanged,
            &id,
            json!({ "from": null, "to": TaskStatus::Pending }),
        );
        Ok(id)
    }

    pub fn get_task_status(&self, task_id: &str) -> Result<TaskStatus, HiveError> {
        self.tasks
            .get(task_id)
            .map(|t| t.status)
            .ok_or_else(|| HiveError::Validation(format!("unknown task '{task_id}'")))
    }

    /// 任务快照（含已归档任务）
    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id)
    }

    pub fn active_tasks(&self) -> Vec<String> {
        self.tasks.active_ids()
    }

    pub fn select_agent(&self, requirements: &AgentRequirements) -> Result<AgentLease, HiveError> {
        self.agents.select_agent(requirements)
    }

    /// 按 deliverable 选择模板生成计划；计划引用的角色必须已注册
    pub fn create_execution_plan(&self, task_id: &str) -> Result<ExecutionPlan, HiveError> {
        let task = self.active_task(task_id)?;
        if let Some(plan) = task.plan {
            return Ok(plan);
        }
        self.transition(task_id, TaskStatus::Planning)?;

        let plan = self.planner.create(&task.brief).and_then(|plan| {
            let roles = self.agents.roles();
            let missing = plan
                .phases
                .iter()
                .flat_map(|p| p.roles.iter().map(move |r| (p, r)))
                .find(|(_, r)| !roles.contains(r))
                .map(|(phase, role)| format!("phase '{}' requires unregistered role '{role}'", phase.id));
            match missing {
                Some(message) => Err(HiveError::Validation(message)),
                None => Ok(plan),
            }
        });

        match plan {
            Ok(plan) => {
                tracing::info!(
                    task = %task_id,
                    plan = %plan.id,
                    phases = ?plan.phases.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
                    "execution plan created"
                );
                self.tasks.update(task_id, |t| t.plan = Some(plan.clone()))?;
                Ok(plan)
            }
            Err(e) => {
                self.fail_task(task_id, FailureReason::from(&e));
                self.tasks.archive(task_id);
                Err(e)
            }
        }
    }

    /// 驱动整个任务直到完成或失败；任务状态与失败原因记录在返回的快照中。
    /// 仅当任务不存在或已结束时返回 Err。
    pub async fn execute_task(&self, task_id: &str) -> Result<Task, HiveError> {
        let task = self.active_task(task_id)?;
        if task.status.is_terminal() {
            return Err(HiveError::Validation(format!("task '{task_id}' already finished")));
        }
        self.start_responders();
        let token = self.supervisor.token(task_id);
        let started = Instant::now();

        let plan = match self.create_execution_plan(task_id) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(task = %task_id, error = %e, "planning failed");
                self.supervisor.finish(task_id);
                return self.get_task(task_id).ok_or(e);
            }
        };

        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut involved: BTreeSet<String> = BTreeSet::new();
        let failure = match self
            .run_phases(&task, &plan, &token, &mut outputs, &mut involved)
            .await
        {
            Ok(None) => self
                .complete(task_id, &plan, &outputs)
                .err()
                .map(|e| FailureReason::from(&e)),
            Ok(Some(reason)) => Some(reason),
            Err(e) => {
                tracing::warn!(task = %task_id, error = %e, "task execution interrupted");
                Some(FailureReason::from(&e))
            }
        };

        if let Some(reason) = failure {
            if reason.kind == ErrorKind::Fatal {
                let snapshot = self
                    .get_task(task_id)
                    .and_then(|t| serde_json::to_string(&t).ok())
                    .unwrap_or_default();
                tracing::error!(task = %task_id, snapshot = %snapshot, "fatal error, task aborted");
            }
            self.fail_task(task_id, reason);
        }

        self.record_episodes(task_id, &involved, started.elapsed()).await;
        self.supervisor.finish(task_id);
        let archived = self
            .tasks
            .archive(task_id)
            .ok_or_else(|| HiveError::Validation(format!("unknown task '{task_id}'")))?;
        tracing::info!(
            task = %task_id,
            status = ?archived.status,
            incomplete = archived.is_incomplete(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "task finished"
        );
        Ok(archived)
    }

    /// 按拓扑序执行各阶段；返回使任务失败的原因（全部完成时为 None）
    async fn run_phases(
        &self,
        task: &Task,
        plan: &ExecutionPlan,
        token: &CancellationToken,
        outputs: &mut HashMap<String, String>,
        involved: &mut BTreeSet<String>,
    ) -> Result<Option<FailureReason>, HiveError> {
        let task_id = task.id.as_str();
        self.transition(task_id, TaskStatus::Executing)?;

        for phase in &plan.phases {
            if token.is_cancelled() {
                return Ok(Some(FailureReason::from(&HiveError::Cancelled)));
            }
            if task.deadline.is_some_and(|d| d <= Utc::now()) {
                return Ok(Some(FailureReason::from(&HiveError::Timeout(format!(
                    "task deadline passed before phase '{}'",
                    phase.id
                )))));
            }

            let inputs: Vec<&str> = phase
                .depends_on
                .iter()
                .filter_map(|d| outputs.get(d).map(String::as_str))
                .filter(|o| !o.is_empty())
                .collect();
            let input = (!inputs.is_empty()).then(|| inputs.join("\n\n"));

            let result = self.execute_phase(task_id, phase, input.clone(), &[]).await?;
            let result = self.quality_gate_check(task_id, phase, result, input).await?;

            involved.extend(result.branches.iter().filter(|b| b.is_success()).map(|b| b.agent_id.clone()));
            outputs.insert(phase.id.clone(), result.merged.clone());
            let aborted = result.failure.clone().filter(|_| result.is_aborted());
            self.absorb(task_id, result)?;

            if aborted.is_some() {
                return Ok(aborted);
            }
        }
        Ok(None)
    }

    /// 汇总终点阶段的输出并标记完成
    fn complete(
        &self,
        task_id: &str,
        plan: &ExecutionPlan,
        outputs: &HashMap<String, String>,
    ) -> Result<(), HiveError> {
        let output = plan
            .sinks()
            .iter()
            .filter_map(|p| outputs.get(&p.id))
            .filter(|o| !o.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n\n");
        self.tasks.update(task_id, |t| t.output = Some(output))?;
        self.transition(task_id, TaskStatus::Complete)
    }

    /// 取消任务：执行中的分支在下一个挂起点结束，agent 回到 idle，任务以 Cancelled 失败。
    /// 返回 false 表示任务已结束。
    pub fn cancel_task(&self, task_id: &str) -> Result<bool, HiveError> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| HiveError::Validation(format!("unknown task '{task_id}'")))?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        tracing::info!(task = %task_id, "cancelling task");
        if !self.supervisor.cancel(task_id) {
            // 尚未开始执行
            self.fail_task(task_id, FailureReason::from(&HiveError::Cancelled));
            self.tasks.archive(task_id);
        }
        Ok(true)
    }

    // ---------- 阶段执行 ----------

    /// 执行单个阶段。feedback 为质量门的修订意见（首轮为空）。
    pub async fn execute_phase(
        &self,
        task_id: &str,
        phase: &Phase,
        input: Option<String>,
        feedback: &[String],
    ) -> Result<PhaseResult, HiveError> {
        let task = self.active_task(task_id)?;
        let ctx = AgentContext {
            task_id: task_id.to_string(),
            task_type: task.brief.deliverable.clone(),
            phase: phase.id.clone(),
            objective: format!("{} ({})", phase.objective, task.brief.objective()),
            keywords: task.brief.keywords.clone(),
            input,
            feedback: feedback.to_vec(),
        };
        let token = self.supervisor.token(task_id);
        let deadline = Instant::now() + phase.timeout_duration();

        self.emit(
            EventKind::PhaseStarted,
            task_id,
            json!({
                "phase": phase.id,
                "roles": phase.roles,
                "parallel": phase.parallel,
                "timeout_ms": phase.timeout_ms,
                "revision": !feedback.is_empty(),
            }),
        );
        let started = Instant::now();

        let mut result = if phase.parallel {
            self.run_parallel(phase, &ctx, &token, deadline).await
        } else {
            self.run_sequential(phase, &ctx, &token, deadline).await
        };
        if token.is_cancelled() && !result.is_aborted() {
            result.abort(&HiveError::Cancelled);
        }

        tracing::info!(
            task = %task_id,
            phase = %phase.id,
            status = ?result.status,
            branches = result.branches.len(),
            deficiencies = result.deficiencies.len(),
            "phase finished"
        );
        self.emit(
            EventKind::PhaseCompleted,
            task_id,
            json!({
                "phase": phase.id,
                "status": result.status,
                "elapsed_ms": started.elapsed().as_millis() as u64,
                "failed_branches": result.branches.iter().filter(|b| !b.is_success()).count(),
                "failure": result.failure,
            }),
        );
        Ok(result)
    }

    async fn run_parallel(
        &self,
        phase: &Phase,
        ctx: &AgentContext,
        token: &CancellationToken,
        deadline: Instant,
    ) -> PhaseResult {
        let mut result = PhaseResult::new(&phase.id);
        let mut errors: BTreeMap<String, HiveError> = BTreeMap::new();
        let mut outputs: Vec<AgentOutput> = Vec::new();
        let mut outstanding: BTreeMap<String, String> = BTreeMap::new();
        let mut set: JoinSet<BranchOutcome> = JoinSet::new();

        for role in &phase.roles {
            let lease = match self.agents.select_agent(&AgentRequirements::role(role)) {
                Ok(lease) => lease,
                Err(e) => {
                    let slot = format!("unassigned:{role}");
                    result.branches.push(BranchResult::failed(&slot, role, &e, 0));
                    errors.insert(slot, e);
                    continue;
                }
            };
            outstanding.insert(lease.id().to_string(), role.clone());
            let branch_ctx = ctx.clone();
            let token = token.clone();
            set.spawn(async move {
                let start = Instant::now();
                let outcome = tokio::select! {
                    _ = token.cancelled() => Err(HiveError::Cancelled),
                    r = lease.run(&branch_ctx) => r,
                };
                (lease.id().to_string(), lease.role().to_string(), outcome, start.elapsed())
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(joined))) => {
                    collect_branch(joined, &mut result, &mut outputs, &mut errors, &mut outstanding)
                }
                Ok(Some(Err(join_err))) => {
                    tracing::warn!(phase = %phase.id, error = %join_err, "branch task ended abnormally");
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        phase = %phase.id,
                        outstanding = ?outstanding.keys().collect::<Vec<_>>(),
                        "phase deadline reached, aborting outstanding branches"
                    );
                    set.abort_all();
                    while let Some(joined) = set.join_next().await {
                        if let Ok(joined) = joined {
                            collect_branch(joined, &mut result, &mut outputs, &mut errors, &mut outstanding);
                        }
                    }
                    let err = HiveError::Timeout(format!(
                        "phase '{}' deadline of {}ms elapsed",
                        phase.id, phase.timeout_ms
                    ));
                    for (agent_id, role) in std::mem::take(&mut outstanding) {
                        result
                            .branches
                            .push(BranchResult::failed(&agent_id, &role, &err, phase.timeout_ms));
                        errors.insert(agent_id, err.clone());
                    }
                    break;
                }
            }
        }
        // 未返回结果的分支（任务 panic）
        for (agent_id, role) in outstanding {
            let err = HiveError::ToolFailed("branch task panicked".to_string());
            result.branches.push(BranchResult::failed(&agent_id, &role, &err, 0));
            errors.insert(agent_id, err);
        }
        result.branches.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        outputs.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let total = result.branches.len();
        let failed = errors.len();
        if let Some(fatal) = errors.values().find(|e| e.is_fatal()) {
            result.abort(fatal);
            return result;
        }
        if failed * 2 > total {
            let first = errors.values().next().cloned().unwrap_or(HiveError::Cancelled);
            tracing::warn!(phase = %phase.id, failed, total, "majority of branches failed, phase aborted");
            result.abort(&first);
            return result;
        }

        for (agent_id, err) in &errors {
            let agent = (!agent_id.starts_with("unassigned:")).then_some(agent_id.as_str());
            result.note(agent, err.kind(), err.to_string());
        }
        for out in outputs.iter().filter(|o| o.degraded) {
            result.note(
                Some(&out.agent_id),
                ErrorKind::ToolUnavailable,
                format!("degraded output for '{}' served by '{}'", out.capability, out.served_by),
            );
        }

        result.merged = match phase.merge {
            MergePolicy::Negotiate if outputs.len() > 1 => self.negotiate_merge(ctx, &outputs, &mut result).await,
            _ => concatenate(&outputs),
        };
        if !result.deficiencies.is_empty() {
            result.status = PhaseStatus::Partial;
        }
        result
    }

    /// 拼接后的草稿作为初始提案，由产出分支的 agent 协商定稿
    async fn negotiate_merge(&self, ctx: &AgentContext, outputs: &[AgentOutput], result: &mut PhaseResult) -> String {
        let draft = concatenate(outputs);
        let participants: Vec<Arc<dyn Negotiator>> = outputs
            .iter()
            .filter_map(|o| self.agents.get(&o.agent_id))
            .map(|a| a as Arc<dyn Negotiator>)
            .collect();
        let proposal = Proposal::new(&outputs[0].agent_id, draft.clone());
        let session = self.negotiation.negotiate(ctx, proposal, &participants, None).await;
        if !session.consensus {
            let err = HiveError::ConsensusFailure {
                rounds: session.round_count(),
            };
            result.note(None, err.kind(), format!("{err}; best proposal kept for manual review"));
        }
        let merged = session
            .final_proposal
            .as_ref()
            .map(|p| p.content.clone())
            .unwrap_or(draft);
        result.negotiation = Some(session);
        merged
    }

    async fn run_sequential(
        &self,
        phase: &Phase,
        ctx: &AgentContext,
        token: &CancellationToken,
        deadline: Instant,
    ) -> PhaseResult {
        let mut result = PhaseResult::new(&phase.id);
        let mut input = ctx.input.clone();

        for role in &phase.roles {
            let lease = match self.agents.select_agent(&AgentRequirements::role(role)) {
                Ok(lease) => lease,
                Err(e) => {
                    result
                        .branches
                        .push(BranchResult::failed(&format!("unassigned:{role}"), role, &e, 0));
                    result.abort(&e);
                    return result;
                }
            };
            let step_ctx = AgentContext {
                input: input.clone(),
                ..ctx.clone()
            };
            let start = Instant::now();
            let outcome = tokio::select! {
                _ = token.cancelled() => Err(HiveError::Cancelled),
                r = tokio::time::timeout_at(deadline, lease.run(&step_ctx)) => r.unwrap_or_else(|_| {
                    Err(HiveError::Timeout(format!(
                        "phase '{}' deadline of {}ms elapsed",
                        phase.id, phase.timeout_ms
                    )))
                }),
            };
            let latency = start.elapsed().as_millis() as u64;
            let agent_id = lease.id().to_string();
            drop(lease);

            match outcome {
                Ok(out) => {
                    if out.degraded {
                        result.note(
                            Some(&agent_id),
                            ErrorKind::ToolUnavailable,
                            format!("degraded output for '{}' served by '{}'", out.capability, out.served_by),
                        );
                        result.status = PhaseStatus::Partial;
                    }
                    result
                        .branches
                        .push(BranchResult::succeeded(&agent_id, role, out.content.clone(), out.degraded, latency));
                    input = Some(out.content);
                }
                Err(e) => {
                    tracing::warn!(phase = %phase.id, agent = %agent_id, error = %e, "sequential step failed, phase aborted");
                    result.branches.push(BranchResult::failed(&agent_id, role, &e, latency));
                    result.abort(&e);
                    return result;
                }
            }
        }
        result.merged = input.unwrap_or_default();
        result
    }

    // ---------- 质量门 ----------

    /// 对阶段结果评分；驳回且有剩余预算时带着修订意见重新执行该阶段，
    /// 预算耗尽后保留得分最高的结果并升级人工复核。
    pub async fn quality_gate_check(
        &self,
        task_id: &str,
        phase: &Phase,
        result: PhaseResult,
        input: Option<String>,
    ) -> Result<PhaseResult, HiveError> {
        if !phase.quality_check || result.is_aborted() {
            return Ok(result);
        }
        let task = self.active_task(task_id)?;
        let gate = (self.gate_factory)(&task.brief.keywords)?;

        let mut report = gate.score(&result.merged);
        self.emit_quality(task_id, &phase.id, 0, &report);
        let mut current = result;
        let mut best: Option<(PhaseResult, QualityReport)> = None;
        let mut revisions = 0;

        while !report.accepted && revisions < self.config.revision_budget {
            revisions += 1;
            self.transition(task_id, TaskStatus::Revising)?;
            let feedback = report.feedback();
            tracing::info!(task = %task_id, phase = %phase.id, revision = revisions, feedback = ?feedback, "quality gate rejected, revising");

            if best.as_ref().map_or(true, |(_, b)| report.weighted > b.weighted) {
                best = Some((current, report));
            }
            let revised = self.execute_phase(task_id, phase, input.clone(), &feedback).await?;
            self.transition(task_id, TaskStatus::Executing)?;
            if revised.is_aborted() {
                let mut revised = revised;
                revised.revisions = revisions;
                return Ok(revised);
            }
            current = revised;
            report = gate.score(&current.merged);
            self.emit_quality(task_id, &phase.id, revisions, &report);
        }

        if report.accepted {
            current.quality = Some(report);
            current.revisions = revisions;
            return Ok(current);
        }

        // 预算耗尽：保留得分最高的版本
        let (mut kept, kept_report) = match best {
            Some((b, r)) if r.weighted > report.weighted => (b, r),
            _ => (current, report),
        };
        let detail = kept_report.feedback().join("; ");
        tracing::warn!(task = %task_id, phase = %phase.id, score = kept_report.weighted, "quality budget exhausted, escalating");
        kept.note(
            None,
            ErrorKind::QualityRejected,
            format!(
                "score {:.2} below {:.2} after {revisions} revisions: {detail}",
                kept_report.weighted, kept_report.threshold
            ),
        );
        if kept.status == PhaseStatus::Succeeded {
            kept.status = PhaseStatus::Partial;
        }
        kept.escalated = true;
        kept.revisions = revisions;
        kept.quality = Some(kept_report);
        Ok(kept)
    }

    // ---------- 内部 ----------

    fn active_task(&self, task_id: &str) -> Result<Task, HiveError> {
        if self.tasks.is_archived(task_id) {
            return Err(HiveError::Validation(format!("task '{task_id}' already finished")));
        }
        self.tasks
            .get(task_id)
            .ok_or_else(|| HiveError::Validation(format!("unknown task '{task_id}'")))
    }

    fn transition(&self, task_id: &str, to: TaskStatus) -> Result<(), HiveError> {
        let from = self.tasks.update(task_id, |t| t.set_status(to))??;
        tracing::debug!(task = %task_id, ?from, ?to, "task status changed");
        self.emit(EventKind::TaskStatusChanged, task_id, json!({ "from": from, "to": to }));
        Ok(())
    }

    fn fail_task(&self, task_id: &str, reason: FailureReason) {
        tracing::warn!(task = %task_id, kind = ?reason.kind, message = %reason.message, "task failed");
        let changed = self.tasks.update(task_id, |t| {
            let from = t.set_status(TaskStatus::Failed).ok()?;
            t.failure = Some(reason.clone());
            Some(from)
        });
        if let Ok(Some(from)) = changed {
            self.emit(
                EventKind::TaskStatusChanged,
                task_id,
                json!({ "from": from, "to": TaskStatus::Failed, "failure": reason }),
            );
        }
    }

    /// 把阶段结果并入任务：升级项、修订次数、人工复核标记
    fn absorb(&self, task_id: &str, result: PhaseResult) -> Result<(), HiveError> {
        self.tasks.update(task_id, |t| {
            if result.escalated {
                t.escalations
                    .push(format!("phase '{}': quality below threshold after revisions", result.phase_id));
                t.needs_manual_review = true;
            }
            if let Some(session) = result.negotiation.as_ref().filter(|s| s.needs_manual_review) {
                t.escalations.push(format!(
                    "phase '{}': no consensus after {} rounds",
                    result.phase_id,
                    session.round_count()
                ));
                t.needs_manual_review = true;
            }
            t.revisions += result.revisions;
            t.phase_results.push(result);
        })
    }

    async fn record_episodes(&self, task_id: &str, involved: &BTreeSet<String>, elapsed: Duration) {
        let Some(task) = self.tasks.get(task_id) else {
            return;
        };
        let outcome = if task.status == TaskStatus::Complete {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        let summary = format!(
            "{} '{}' ended {:?} after {} phases",
            task.brief.deliverable,
            task.brief.title,
            task.status,
            task.phase_results.len()
        );
        let ctx = AgentContext {
            task_id: task_id.to_string(),
            task_type: task.brief.deliverable.clone(),
            phase: "task".to_string(),
            objective: task.brief.objective(),
            keywords: task.brief.keywords.clone(),
            ..AgentContext::default()
        };
        for agent in involved.iter().filter_map(|id| self.agents.get(id)) {
            agent.record_episode(&ctx, &summary, outcome, elapsed).await;
        }
    }

    fn emit_quality(&self, task_id: &str, phase_id: &str, revision: u32, report: &QualityReport) {
        self.emit(
            EventKind::QualityGate,
            task_id,
            json!({
                "phase": phase_id,
                "revision": revision,
                "accepted": report.accepted,
                "weighted": report.weighted,
                "threshold": report.threshold,
                "shortfalls": report.shortfalls,
            }),
        );
    }

    fn emit(&self, kind: EventKind, task_id: &str, payload: serde_json::Value) {
        self.sink.emit(ObservabilityEvent::new(kind, Some(task_id), payload));
    }
}

/// 收件箱应答循环：需要响应的请求交给 agent 作答，其余消息只记录
async fn answer_peers(agent: Arc<AgentHandle>, bus: Arc<CommunicationBus>, mut mailbox: Mailbox) {
    while let Some(message) = mailbox.recv().await {
        if !message.requires_response {
            tracing::debug!(agent = %agent.id(), from = %message.from, kind = ?message.kind, "message received");
            continue;
        }
        if let Err(e) = bus.respond(&message, agent.id(), agent.answer(&message)) {
            tracing::warn!(agent = %agent.id(), from = %message.from, error = %e, "failed to answer peer");
        }
    }
}

fn collect_branch(
    joined: BranchOutcome,
    result: &mut PhaseResult,
    outputs: &mut Vec<AgentOutput>,
    errors: &mut BTreeMap<String, HiveError>,
    outstanding: &mut BTreeMap<String, String>,
) {
    let (agent_id, role, outcome, elapsed) = joined;
    outstanding.remove(&agent_id);
    let latency = elapsed.as_millis() as u64;
    match outcome {
        Ok(out) => {
            result
                .branches
                .push(BranchResult::succeeded(&agent_id, &role, out.content.clone(), out.degraded, latency));
            outputs.push(out);
        }
        Err(e) => {
            result.branches.push(BranchResult::failed(&agent_id, &role, &e, latency));
            errors.insert(agent_id, e);
        }
    }
}

/// 按 agent id 顺序拼接分支输出
fn concatenate(outputs: &[AgentOutput]) -> String {
    outputs
        .iter()
        .map(|o| o.content.as_str())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
