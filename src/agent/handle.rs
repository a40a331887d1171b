//! Agent 运行时句柄
//!
//! 状态机：idle →(分配) working →(完成) idle；working →(等待消息) blocked →(收到) working；
//! working →(不可恢复失败) idle 并记录失败原因；blocked → idle 只能经由取消。其余转换一律拒绝。
//! 状态与统计在同步锁里原子更新；记忆只在持有 agent 的异步锁时修改。

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::agent::{AgentContext, Consultation, Decision, RoleStrategy};
use crate::bus::{CommunicationBus, Message, MessageKind};
use crate::core::{FailureReason, HiveError};
use crate::memory::{AgentMemory, MemoryItem, MemoryKind, MemoryUpdate, Outcome};
use crate::negotiation::{Evaluation, FeatureRecord, Negotiator, Proposal};
use crate::tools::{ToolExecutor, ToolOutcome, ToolRequest};

/// 全局单调序号，用于 LRU 平局裁决
static USE_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// 灵活度对认可度的最大让步比例
const FLEXIBILITY_BIAS: f64 = 0.3;
const RECALL_LIMIT: usize = 3;

/// 角色对应的总线主题；同角色的 agent 都订阅它
pub fn role_topic(role: &str) -> String {
    format!("role:{role}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Working,
    Blocked,
}

/// 选择用的性能统计；新 agent 以 0.8 的成功率先验计一次观测
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub runs: u64,
    pub success_rate: f64,
    pub mean_latency_ms: f64,
}

impl Default for AgentStats {
    fn default() -> Self {
        Self {
            runs: 0,
            success_rate: 0.8,
            mean_latency_ms: 0.0,
        }
    }
}

impl AgentStats {
    pub fn new(success_rate: f64, mean_latency_ms: f64) -> Self {
        Self {
            runs: 0,
            success_rate: success_rate.clamp(0.0, 1.0),
            mean_latency_ms: mean_latency_ms.max(0.0),
        }
    }

    /// 增量均值更新
    pub fn record(&mut self, success: bool, latency: Duration) {
        self.runs += 1;
        let n = self.runs as f64;
        let x = if success { 1.0 } else { 0.0 };
        self.success_rate += (x - self.success_rate) / (n + 1.0);
        let ms = latency.as_secs_f64() * 1000.0;
        self.mean_latency_ms = if self.runs == 1 {
            ms
        } else {
            self.mean_latency_ms + (ms - self.mean_latency_ms) / n
        };
    }

    /// success_rate × 1 / (1 + latency / scale)
    pub fn fitness(&self, latency_scale_ms: f64) -> f64 {
        let scale = if latency_scale_ms > 0.0 { latency_scale_ms } else { 1.0 };
        self.success_rate / (1.0 + self.mean_latency_ms / scale)
    }
}

/// 注册 agent 时的声明
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub id: String,
    pub role: String,
    pub capabilities: BTreeSet<String>,
    pub flexibility: f64,
    pub stats: AgentStats,
}

impl AgentSpec {
    pub fn new<I, S>(id: impl Into<String>, role: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            role: role.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            flexibility: 0.5,
            stats: AgentStats::default(),
        }
    }

    pub fn with_flexibility(mut self, flexibility: f64) -> Self {
        self.flexibility = flexibility.clamp(0.0, 1.0);
        self
    }

    pub fn with_stats(mut self, stats: AgentStats) -> Self {
        self.stats = stats;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub role: String,
    pub state: AgentState,
    pub capabilities: BTreeSet<String>,
    pub stats: AgentStats,
    pub flexibility: f64,
    pub last_used: u64,
    pub last_failure: Option<FailureReason>,
}

/// 一次 run 的产出
#[derive(Debug, Clone, Serialize)]
pub struct AgentOutput {
    pub agent_id: String,
    pub role: String,
    pub capability: String,
    pub served_by: String,
    pub content: String,
    pub degraded: bool,
    pub latency_ms: u64,
    pub cost_units: f64,
}

#[derive(Debug)]
struct Status {
    state: AgentState,
    stats: AgentStats,
    last_used: u64,
    flexibility: f64,
    last_failure: Option<FailureReason>,
}

pub struct AgentHandle {
    id: String,
    role: String,
    capabilities: BTreeSet<String>,
    strategy: Arc<dyn RoleStrategy>,
    executor: Arc<ToolExecutor>,
    learning_rate: f64,
    bus: Option<Arc<CommunicationBus>>,
    status: Mutex<Status>,
    memory: tokio::sync::Mutex<AgentMemory>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

impl AgentHandle {
    pub fn new(
        spec: AgentSpec,
        strategy: Arc<dyn RoleStrategy>,
        executor: Arc<ToolExecutor>,
        memory: AgentMemory,
    ) -> Self {
        Self {
            status: Mutex::new(Status {
                state: AgentState::Idle,
                stats: spec.stats,
                last_used: 0,
                flexibility: spec.flexibility,
                last_failure: None,
            }),
            id: spec.id,
            role: spec.role,
            capabilities: spec.capabilities,
            strategy,
            executor,
            learning_rate: 0.3,
            bus: None,
            memory: tokio::sync::Mutex::new(memory),
        }
    }

    /// 接入总线后，策略要求的征询经由总线发给同伴
    pub fn with_bus(mut self, bus: Arc<CommunicationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// 协商成功模式对灵活度的影响比例
    pub fn with_learning_rate(mut self, rate: f64) -> Self {
        self.learning_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    pub fn memory(&self) -> &tokio::sync::Mutex<AgentMemory> {
        &self.memory
    }

    fn status(&self) -> std::sync::MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> AgentState {
        self.status().state
    }

    pub fn stats(&self) -> AgentStats {
        self.status().stats
    }

    pub fn current_flexibility(&self) -> f64 {
        self.status().flexibility
    }

    pub fn last_used(&self) -> u64 {
        self.status().last_used
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let s = self.status();
        AgentSnapshot {
            id: self.id.clone(),
            role: self.role.clone(),
            state: s.state,
            capabilities: self.capabilities.clone(),
            stats: s.stats,
            flexibility: s.flexibility,
            last_used: s.last_used,
            last_failure: s.last_failure.clone(),
        }
    }

    /// 受校验的状态转换；blocked → idle 只能用 `cancel`
    pub fn transition(&self, to: AgentState) -> Result<(), HiveError> {
        let mut s = self.status();
        let allowed = matches!(
            (s.state, to),
            (AgentState::Idle, AgentState::Working)
                | (AgentState::Working, AgentState::Idle)
                | (AgentState::Working, AgentState::Blocked)
                | (AgentState::Blocked, AgentState::Working)
        );
        if !allowed {
            return Err(HiveError::Validation(format!(
                "agent '{}' cannot move from {:?} to {:?}",
                self.id, s.state, to
            )));
        }
        if to == AgentState::Working && s.state == AgentState::Idle {
            s.last_used = USE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(agent = %self.id, from = ?s.state, to = ?to, "agent state changed");
        s.state = to;
        Ok(())
    }

    /// 取消：任何状态回到 idle
    pub fn cancel(&self) {
        let mut s = self.status();
        if s.state != AgentState::Idle {
            tracing::info!(agent = %self.id, from = ?s.state, "agent cancelled");
            s.state = AgentState::Idle;
        }
    }

    /// 原子地 idle → working，成功返回租约
    pub fn try_reserve(self: &Arc<Self>) -> Option<AgentLease> {
        self.transition(AgentState::Working).ok()?;
        Some(AgentLease {
            agent: Arc::clone(self),
        })
    }

    /// 召回记忆并交给角色策略决策；决策必须落在声明的能力内
    pub async fn think(&self, ctx: &AgentContext) -> Result<Decision, HiveError> {
        let recalled: Vec<MemoryItem> = {
            let mut memory = self.memory.lock().await;
            memory.retrieve(&ctx.query(), None, RECALL_LIMIT)
        };
        let decision = self.strategy.execute(ctx, &recalled, &self.capabilities)?;
        if !self.capabilities.contains(&decision.capability) {
            return Err(HiveError::Validation(format!(
                "agent '{}' decided on undeclared capability '{}'",
                self.id, decision.capability
            )));
        }
        Ok(decision)
    }

    /// 经工具执行器调用能力，并把动作记入记忆
    pub async fn act(&self, ctx: &AgentContext, decision: &Decision) -> Result<ToolOutcome, HiveError> {
        let request = ToolRequest::new(&self.id, &decision.capability, decision.params.clone())
            .with_capabilities(self.capabilities.clone())
            .with_task(Some(ctx.task_id.clone()));
        let result = self.executor.execute(request).await;
        let (line, outcome) = match &result {
            Ok(o) if o.degraded => (format!("{} degraded for {}", decision.capability, ctx.phase), Outcome::Failure),
            Ok(o) => (format!("{} via {} for {}", decision.capability, o.served_by, ctx.phase), Outcome::Success),
            Err(e) => (format!("{} failed for {}: {e}", decision.capability, ctx.phase), Outcome::Failure),
        };
        self.memory
            .lock()
            .await
            .remember(&line, MemoryKind::Action, Some(outcome));
        result
    }

    /// 把结果写入记忆（可能触发 consolidate）
    pub async fn reflect(&self, ctx: &AgentContext, result: &Result<ToolOutcome, HiveError>) -> MemoryUpdate {
        let (content, outcome) = match result {
            Ok(o) => (
                format!("{} / {}: {}", ctx.task_type, ctx.phase, o.output.content),
                if o.degraded { Outcome::Failure } else { Outcome::Success },
            ),
            Err(e) => (format!("{} / {} failed: {e}", ctx.task_type, ctx.phase), Outcome::Failure),
        };
        self.memory
            .lock()
            .await
            .remember(&content, MemoryKind::Observation, Some(outcome))
    }

    /// think → (征询同伴) → act → reflect，并更新统计
    pub async fn run(&self, ctx: &AgentContext) -> Result<AgentOutput, HiveError> {
        let start = Instant::now();
        let result = self.attempt(ctx).await;
        let elapsed = start.elapsed();

        let mut s = self.status();
        match result {
            Ok((decision, outcome)) => {
                s.stats.record(!outcome.degraded, elapsed);
                Ok(AgentOutput {
                    agent_id: self.id.clone(),
                    role: self.role.clone(),
                    capability: decision.capability,
                    served_by: outcome.served_by,
                    content: outcome.output.content,
                    degraded: outcome.degraded,
                    latency_ms: elapsed.as_millis() as u64,
                    cost_units: outcome.output.cost.units,
                })
            }
            Err(e) => {
                s.stats.record(false, elapsed);
                s.last_failure = Some(FailureReason::from(&e));
                tracing::warn!(agent = %self.id, phase = %ctx.phase, error = %e, "agent run failed");
                Err(e)
            }
        }
    }

    async fn attempt(&self, ctx: &AgentContext) -> Result<(Decision, ToolOutcome), HiveError> {
        let mut decision = self.think(ctx).await?;
        if let Some(consult) = decision.consult.take() {
            self.seek_advice(&consult, &mut decision).await?;
        }
        let outcome = self.act(ctx, &decision).await;
        self.reflect(ctx, &outcome).await;
        outcome.map(|o| (decision, o))
    }

    /// 征询结果并入决策的 input 参数
    async fn seek_advice(&self, consult: &Consultation, decision: &mut Decision) -> Result<(), HiveError> {
        let Some(bus) = self.bus.clone() else {
            tracing::debug!(agent = %self.id, role = %consult.role, "no bus attached, skipping consultation");
            return Ok(());
        };
        let replies = self
            .consult_role(&bus, &consult.role, &consult.question, bus.request_timeout())
            .await?;
        let notes: Vec<String> = replies
            .iter()
            .flat_map(|reply| {
                reply
                    .payload
                    .get("notes")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                    .map(move |note| format!("peer {}: {note}", reply.from))
            })
            .collect();
        if notes.is_empty() {
            return Ok(());
        }
        self.memory.lock().await.remember(
            &format!("consulted {} on {}: {}", consult.role, consult.question, notes.join("; ")),
            MemoryKind::Observation,
            None,
        );
        match decision.params.get_mut("input") {
            Some(Value::String(input)) => {
                for note in &notes {
                    input.push('\n');
                    input.push_str(note);
                }
            }
            _ => {
                if let Some(params) = decision.params.as_object_mut() {
                    params.insert("peer_notes".to_string(), serde_json::json!(notes));
                }
            }
        }
        Ok(())
    }

    /// 向某个角色的全部同伴征询；等待期间处于 blocked，未按时回复的同伴被忽略
    pub async fn consult_role(
        &self,
        bus: &CommunicationBus,
        role: &str,
        question: &str,
        wait: Duration,
    ) -> Result<Vec<Message>, HiveError> {
        self.transition(AgentState::Blocked)?;
        let payload = serde_json::json!({ "question": question, "from_role": self.role });
        let replies = bus
            .gather(&self.id, &role_topic(role), MessageKind::Request, payload, wait)
            .await;
        if self.transition(AgentState::Working).is_err() {
            return Err(HiveError::Cancelled);
        }
        tracing::debug!(agent = %self.id, role, replies = replies.len(), "consultation finished");
        Ok(replies)
    }

    /// 应答同伴的征询
    pub fn answer(&self, request: &Message) -> Value {
        let question = request
            .payload
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or_default();
        serde_json::json!({
            "role": self.role,
            "notes": self.strategy.advise(question),
        })
    }

    /// 向同伴发请求并等待回复；等待期间处于 blocked
    pub async fn consult(
        &self,
        bus: &CommunicationBus,
        peer: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Message, HiveError> {
        self.transition(AgentState::Blocked)?;
        let request = Message::direct(&self.id, peer, MessageKind::Request, payload);
        let result = bus.request(request, timeout).await;
        if self.transition(AgentState::Working).is_err() {
            return Err(HiveError::Cancelled);
        }
        result
    }

    /// 记录一条情景
    pub async fn record_episode(&self, ctx: &AgentContext, summary: &str, outcome: Outcome, duration: Duration) {
        self.memory.lock().await.record_episode(
            &ctx.task_id,
            &ctx.task_type,
            &self.role,
            summary,
            outcome,
            duration.as_millis() as u64,
        );
    }
}

#[async_trait]
impl Negotiator for AgentHandle {
    fn negotiator_id(&self) -> &str {
        &self.id
    }

    /// 策略评分后按灵活度让步：approval + (1 - approval) × flexibility × 0.3
    async fn evaluate(&self, proposal: &Proposal, ctx: &AgentContext) -> Evaluation {
        let mut eval = self.strategy.evaluate(proposal, ctx);
        let flex = self.current_flexibility();
        eval.agent_id = self.id.clone();
        eval.approval = (eval.approval + (1.0 - eval.approval) * flex * FLEXIBILITY_BIAS).clamp(0.0, 1.0);
        eval
    }

    async fn flexibility(&self) -> f64 {
        self.current_flexibility()
    }

    async fn learn(&self, record: &FeatureRecord, suggested_flexibility: Option<f64>) {
        self.memory
            .lock()
            .await
            .store_pattern(&record.memory_key(), &record.describe());
        if let Some(target) = suggested_flexibility {
            let mut s = self.status();
            s.flexibility = (s.flexibility + self.learning_rate * (target - s.flexibility)).clamp(0.0, 1.0);
        }
    }
}

/// 预约租约：drop 时 agent 回到 idle（包括被中止的分支）
#[derive(Debug)]
pub struct AgentLease {
    agent: Arc<AgentHandle>,
}

impl AgentLease {
    pub fn agent(&self) -> &Arc<AgentHandle> {
        &self.agent
    }
}

impl std::ops::Deref for AgentLease {
    type Target = AgentHandle;

    fn deref(&self) -> &AgentHandle {
        &self.agent
    }
}

impl Drop for AgentLease {
    fn drop(&mut self) {
        self.agent.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::KeywordStrategy;
    use crate::memory::{EpisodicLog, MemoryConfig, MemoryTier};
    use crate::resilience::ResilienceLayer;
    use crate::tools::{ScriptStep, ScriptedTool, ToolRegistry};
    use chrono::Utc;

    fn agent_with(tool: ScriptedTool) -> Arc<AgentHandle> {
        let mut registry = ToolRegistry::new();
        registry.register(tool).unwrap();
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(registry),
            Arc::new(ResilienceLayer::default()),
            5,
        ));
        let memory = AgentMemory::new("w1", MemoryConfig::default(), Arc::new(EpisodicLog::new(16)));
        Arc::new(AgentHandle::new(
            AgentSpec::new("w1", "writer", ["draft"]),
            Arc::new(KeywordStrategy::new("writer", "draft").with_focus(["summary"])),
            executor,
            memory,
        ))
    }

    fn ctx() -> AgentContext {
        AgentContext {
            task_id: "task_1".into(),
            task_type: "blog".into(),
            phase: "draft".into(),
            objective: "explain tokio".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_state_machine_rejects_illegal_transitions() {
        let agent = agent_with(ScriptedTool::new("draft"));
        assert!(agent.transition(AgentState::Blocked).is_err());
        agent.transition(AgentState::Working).unwrap();
        agent.transition(AgentState::Blocked).unwrap();
        assert!(agent.transition(AgentState::Idle).is_err());
        agent.cancel();
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[test]
    fn test_lease_drop_returns_to_idle() {
        let agent = agent_with(ScriptedTool::new("draft"));
        let lease = agent.try_reserve().unwrap();
        assert_eq!(agent.state(), AgentState::Working);
        assert!(agent.try_reserve().is_none());
        drop(lease);
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn test_run_records_stats_and_memory() {
        let agent = agent_with(ScriptedTool::new("draft").then(ScriptStep::Reply("tokio draft".into())));
        let out = agent.run(&ctx()).await.unwrap();
        assert_eq!(out.content, "tokio draft");
        assert_eq!(out.capability, "draft");
        assert!(!out.degraded);
        let stats = agent.stats();
        assert_eq!(stats.runs, 1);
        assert!((stats.success_rate - 0.9).abs() < 1e-9);

        let mut memory = agent.memory().lock().await;
        let hits = memory.retrieve_at("tokio draft", Some(MemoryTier::Short), 5, Utc::now());
        assert!(!hits.is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_records_failure() {
        let agent = agent_with(
            ScriptedTool::new("draft").otherwise(ScriptStep::Fail(HiveError::validation("bad input"))),
        );
        let err = agent.run(&ctx()).await.unwrap_err();
        assert!(matches!(err, HiveError::Validation(_)));
        let snap = agent.snapshot();
        assert!(snap.last_failure.is_some());
        assert!(snap.stats.success_rate < 0.8);
    }

    #[tokio::test]
    async fn test_flexibility_biases_evaluation_and_learning() {
        let agent = agent_with(ScriptedTool::new("draft"));
        let eval = agent.evaluate(&Proposal::new("x", "nothing relevant"), &ctx()).await;
        // 策略给 0，灵活度 0.5 让步 0.15
        assert!((eval.approval - 0.15).abs() < 1e-9);
        assert_eq!(eval.agent_id, "w1");

        let record = FeatureRecord {
            task_type: "blog".into(),
            strategy: "weighted".into(),
            proposal_length: 10,
            concerns_resolved: 1,
            rounds: 2,
            final_score: 0.8,
            flexibility: Default::default(),
            recorded_at: Utc::now(),
        };
        agent.learn(&record, Some(1.0)).await;
        assert!((agent.current_flexibility() - 0.65).abs() < 1e-9);
        assert!(agent.memory().lock().await.long_term().contains("negotiation:blog"));
    }

    #[tokio::test]
    async fn test_run_blocks_on_peer_and_folds_advice() {
        let bus = Arc::new(CommunicationBus::new(Duration::from_secs(5)));
        let mut registry = ToolRegistry::new();
        registry.register(ScriptedTool::new("draft")).unwrap();
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(registry),
            Arc::new(ResilienceLayer::default()),
            5,
        ));
        let memory = AgentMemory::new("w1", MemoryConfig::default(), Arc::new(EpisodicLog::new(16)));
        let agent = Arc::new(
            AgentHandle::new(
                AgentSpec::new("w1", "writer", ["draft"]),
                Arc::new(KeywordStrategy::new("writer", "draft").consulting("editor")),
                executor,
                memory,
            )
            .with_bus(Arc::clone(&bus)),
        );
        let mut editor = bus.register("e1");
        bus.subscribe("e1", &role_topic("editor"));

        let lease = agent.try_reserve().unwrap();
        let run = tokio::spawn(async move { lease.run(&ctx()).await });
        let request = editor.recv().await.unwrap();
        assert_eq!(agent.state(), AgentState::Blocked);
        assert_eq!(request.payload["from_role"], "writer");
        bus.respond(&request, "e1", serde_json::json!({"notes": ["cover zebra"]}))
            .unwrap();

        let out = run.await.unwrap().unwrap();
        assert!(out.content.contains("peer e1: cover zebra"));
        assert_eq!(agent.state(), AgentState::Idle);
        assert_eq!(agent.stats().runs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_consultation_resumes_work() {
        let bus = Arc::new(CommunicationBus::new(Duration::from_millis(100)));
        let agent = agent_with(ScriptedTool::new("draft"));
        let _silent = bus.register("e1");
        bus.subscribe("e1", &role_topic("editor"));
        let lease = agent.try_reserve().unwrap();

        let replies = lease
            .consult_role(&bus, "editor", "draft: tone?", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(replies.is_empty());
        assert_eq!(agent.state(), AgentState::Working);
        assert_eq!(bus.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_consult_blocks_until_reply() {
        let agent = agent_with(ScriptedTool::new("draft"));
        let bus = Arc::new(CommunicationBus::new(Duration::from_secs(1)));
        let _own = bus.register("w1");
        let mut peer = bus.register("editor");
        let lease = agent.try_reserve().unwrap();

        let responder = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                let req = peer.recv().await.unwrap();
                bus.respond(&req, "editor", serde_json::json!({"ok": true})).unwrap();
            })
        };
        let reply = lease
            .consult(&bus, "editor", serde_json::json!({"q": "tone?"}), Duration::from_secs(1))
            .await
            .unwrap();
        responder.await.unwrap();
        assert_eq!(reply.payload["ok"], true);
        assert_eq!(agent.state(), AgentState::Working);
    }
}
