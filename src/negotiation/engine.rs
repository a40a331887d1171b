//! 协商引擎
//!
//! 每轮所有参与者并发评估当前提案（单轮有超时，超时视为认可度 0）；先判否决，再聚合。
//! 所有认可度都达到阈值即为共识；否则调解生成修订提案进入下一轮。
//! 轮数耗尽返回历史最高分提案并标记人工裁决；否决立即终止并记录否决者与理由。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;

use crate::agent::AgentContext;
use crate::config::NegotiationSection;
use crate::core::HiveError;
use crate::negotiation::{
    strategy_from_config, ConsensusStrategy, Evaluation, FeatureRecord, NegotiationSession,
    Proposal, RoundRecord, SuccessPatternStore, TerminalReason, WeightedVoting,
};
use crate::observability::{EventKind, EventSink, ObservabilityEvent};

/// 协商参与者
#[async_trait]
pub trait Negotiator: Send + Sync {
    fn negotiator_id(&self) -> &str;

    async fn evaluate(&self, proposal: &Proposal, ctx: &AgentContext) -> Evaluation;

    /// 当前灵活度 [0,1]
    async fn flexibility(&self) -> f64 {
        0.5
    }

    /// 共识达成后回写学习结果（长期模式条目、灵活度偏置）
    async fn learn(&self, _record: &FeatureRecord, _suggested_flexibility: Option<f64>) {}
}

#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    pub threshold: f64,
    pub max_rounds: usize,
    pub round_timeout: Duration,
}

impl From<&NegotiationSection> for NegotiationConfig {
    fn from(s: &NegotiationSection) -> Self {
        Self {
            threshold: s.threshold.clamp(0.0, 1.0),
            max_rounds: s.max_rounds.max(1),
            round_timeout: Duration::from_millis(s.round_timeout_ms),
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self::from(&NegotiationSection::default())
    }
}

pub struct NegotiationEngine {
    config: NegotiationConfig,
    strategy: Arc<dyn ConsensusStrategy>,
    patterns: Arc<SuccessPatternStore>,
    sink: Option<Arc<dyn EventSink>>,
}

impl Default for NegotiationEngine {
    fn default() -> Self {
        Self::new(NegotiationConfig::default(), Arc::new(WeightedVoting::default()))
    }
}

impl NegotiationEngine {
    pub fn new(config: NegotiationConfig, strategy: Arc<dyn ConsensusStrategy>) -> Self {
        Self {
            config,
            strategy,
            patterns: Arc::new(SuccessPatternStore::default()),
            sink: None,
        }
    }

    pub fn from_config(section: &NegotiationSection) -> Result<Self, HiveError> {
        Ok(Self::new(section.into(), strategy_from_config(section)?))
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_patterns(mut self, patterns: Arc<SuccessPatternStore>) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn patterns(&self) -> &Arc<SuccessPatternStore> {
        &self.patterns
    }

    pub fn config(&self) -> &NegotiationConfig {
        &self.config
    }

    /// 协商；max_rounds 为 None 时使用配置值
    pub async fn negotiate(
        &self,
        ctx: &AgentContext,
        proposal: Proposal,
        participants: &[Arc<dyn Negotiator>],
        max_rounds: Option<usize>,
    ) -> NegotiationSession {
        let max_rounds = max_rounds.unwrap_or(self.config.max_rounds).max(1);
        let threshold = self.config.threshold;
        let mut session = NegotiationSession::new(&ctx.task_id, &ctx.phase, self.strategy.name());
        let mut current = proposal;
        let mut best: Option<Proposal> = None;

        let mut flexibility = BTreeMap::new();
        for p in participants {
            flexibility.insert(p.negotiator_id().to_string(), p.flexibility().await);
        }

        for round in 1..=max_rounds {
            let evaluations = self.collect(&current, ctx, participants).await;
            let vetoed = self.strategy.veto(&evaluations);
            let aggregate = self.strategy.aggregate(&evaluations);
            current.approval = aggregate;
            let all_pass = evaluations.iter().all(|e| e.approval >= threshold);

            self.emit_round(ctx, round, aggregate, &evaluations, vetoed.is_some());
            session.rounds.push(RoundRecord {
                round,
                proposal: current.clone(),
                evaluations: evaluations.clone(),
                aggregate,
            });
            if best.as_ref().map_or(true, |b| aggregate > b.approval) {
                best = Some(current.clone());
            }

            if let Some((agent_id, reason)) = vetoed {
                tracing::warn!(task_id = %ctx.task_id, agent = %agent_id, reason = %reason, round, "proposal vetoed");
                session.terminal_reason = Some(TerminalReason::Vetoed { agent_id, reason });
                session.final_proposal = best.clone();
                session.needs_manual_review = true;
                break;
            }

            if all_pass {
                tracing::info!(task_id = %ctx.task_id, round, aggregate, "consensus reached");
                session.consensus = true;
                session.terminal_reason = Some(TerminalReason::Consensus);
                session.final_proposal = Some(current.clone());
                self.learn(ctx, &session, &current, flexibility, participants).await;
                break;
            }

            if round == max_rounds {
                tracing::warn!(task_id = %ctx.task_id, rounds = round, "negotiation rounds exhausted");
                session.terminal_reason = Some(TerminalReason::MaxRoundsExhausted);
                session.final_proposal = best.clone();
                session.needs_manual_review = true;
                break;
            }

            current = self.strategy.mediate(&current, &evaluations, threshold);
        }
        session
    }

    async fn collect(
        &self,
        proposal: &Proposal,
        ctx: &AgentContext,
        participants: &[Arc<dyn Negotiator>],
    ) -> Vec<Evaluation> {
        let limit = self.config.round_timeout;
        let futures = participants.iter().map(|p| async move {
            match tokio::time::timeout(limit, p.evaluate(proposal, ctx)).await {
                Ok(mut eval) => {
                    eval.agent_id = p.negotiator_id().to_string();
                    eval.approval = eval.approval.clamp(0.0, 1.0);
                    eval
                }
                Err(_) => {
                    tracing::warn!(agent = p.negotiator_id(), "evaluation timed out");
                    Evaluation::timed_out(p.negotiator_id())
                }
            }
        });
        join_all(futures).await
    }

    async fn learn(
        &self,
        ctx: &AgentContext,
        session: &NegotiationSession,
        accepted: &Proposal,
        flexibility: BTreeMap<String, f64>,
        participants: &[Arc<dyn Negotiator>],
    ) {
        let record = FeatureRecord {
            task_type: ctx.task_type.clone(),
            strategy: session.strategy.clone(),
            proposal_length: accepted.content.chars().count(),
            concerns_resolved: accepted.concerns.len(),
            rounds: session.round_count(),
            final_score: accepted.approval,
            flexibility,
            recorded_at: Utc::now(),
        };
        self.patterns.record(record.clone());
        let suggested = self.patterns.suggested_flexibility(&ctx.task_type);
        join_all(participants.iter().map(|p| p.learn(&record, suggested))).await;
    }

    fn emit_round(
        &self,
        ctx: &AgentContext,
        round: usize,
        aggregate: f64,
        evaluations: &[Evaluation],
        vetoed: bool,
    ) {
        let Some(sink) = &self.sink else {
            return;
        };
        let approvals: BTreeMap<&str, f64> = evaluations
            .iter()
            .map(|e| (e.agent_id.as_str(), e.approval))
            .collect();
        sink.emit(ObservabilityEvent::new(
            EventKind::NegotiationRound,
            Some(&ctx.task_id),
            serde_json::json!({
                "phase": ctx.phase,
                "round": round,
                "strategy": self.strategy.name(),
                "aggregate": aggregate,
                "approvals": approvals,
                "vetoed": vetoed,
            }),
        ));
    }
}
