//! 共识策略：加权投票、否决、折中搜索
//!
//! 每轮先检查否决，再做聚合；未达成共识时由 `mediate` 合并低于阈值参与者的意见，产出修订提案。

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::NegotiationSection;
use crate::core::HiveError;
use crate::negotiation::{Evaluation, Proposal};

pub trait ConsensusStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// 返回 (agent_id, reason) 表示立即终止
    fn veto(&self, _evaluations: &[Evaluation]) -> Option<(String, String)> {
        None
    }

    fn aggregate(&self, evaluations: &[Evaluation]) -> f64;

    /// 合并低于阈值参与者的 concerns / modifications，得到修订提案
    fn mediate(&self, proposal: &Proposal, evaluations: &[Evaluation], threshold: f64) -> Proposal {
        let dissenters: Vec<&Evaluation> = evaluations
            .iter()
            .filter(|e| e.approval < threshold)
            .collect();
        merge_feedback(proposal, &dissenters)
    }
}

/// 把若干评估的意见并入提案：修改建议附加到内容末尾，concerns 去重累积
pub fn merge_feedback(proposal: &Proposal, evaluations: &[&Evaluation]) -> Proposal {
    let mut revised = proposal.clone();
    revised.revision += 1;
    let mut added = Vec::new();
    for eval in evaluations {
        for concern in &eval.concerns {
            if !revised.concerns.contains(concern) {
                revised.concerns.push(concern.clone());
            }
        }
        for m in &eval.modifications {
            if !revised.modifications.contains(m) {
                revised.modifications.push(m.clone());
                added.push(m.clone());
            }
        }
    }
    if !added.is_empty() {
        revised.content = format!("{}\n{}", revised.content, added.join("\n"));
    }
    revised
}

fn mean(evaluations: &[Evaluation]) -> f64 {
    if evaluations.is_empty() {
        return 0.0;
    }
    evaluations.iter().map(|e| e.approval).sum::<f64>() / evaluations.len() as f64
}

/// 加权投票：未配置权重的 agent 权重为 1
#[derive(Debug, Clone, Default)]
pub struct WeightedVoting {
    weights: HashMap<String, f64>,
}

impl WeightedVoting {
    pub fn new(weights: HashMap<String, f64>) -> Self {
        Self { weights }
    }

    fn weight(&self, agent_id: &str) -> f64 {
        self.weights.get(agent_id).copied().unwrap_or(1.0).max(0.0)
    }
}

impl ConsensusStrategy for WeightedVoting {
    fn name(&self) -> &str {
        "weighted"
    }

    fn aggregate(&self, evaluations: &[Evaluation]) -> f64 {
        let total: f64 = evaluations.iter().map(|e| self.weight(&e.agent_id)).sum();
        if total <= 0.0 {
            return mean(evaluations);
        }
        evaluations
            .iter()
            .map(|e| self.weight(&e.agent_id) * e.approval)
            .sum::<f64>()
            / total
    }
}

/// 否决：关键参与者低于其个人阈值时立即拒绝（先于聚合判断）
#[derive(Debug, Clone, Default)]
pub struct VetoStrategy {
    critical: HashMap<String, f64>,
    voting: WeightedVoting,
}

impl VetoStrategy {
    pub fn new(critical: HashMap<String, f64>, weights: HashMap<String, f64>) -> Self {
        Self {
            critical,
            voting: WeightedVoting::new(weights),
        }
    }
}

impl ConsensusStrategy for VetoStrategy {
    fn name(&self) -> &str {
        "veto"
    }

    fn veto(&self, evaluations: &[Evaluation]) -> Option<(String, String)> {
        evaluations.iter().find_map(|e| {
            let limit = *self.critical.get(&e.agent_id)?;
            if e.approval >= limit {
                return None;
            }
            let reason = if e.concerns.is_empty() {
                format!("approval {:.2} below veto threshold {:.2}", e.approval, limit)
            } else {
                e.concerns.join("; ")
            };
            Some((e.agent_id.clone(), reason))
        })
    }

    fn aggregate(&self, evaluations: &[Evaluation]) -> f64 {
        self.voting.aggregate(evaluations)
    }
}

/// 折中搜索：每轮只对得分最低的两位参与者做两两调和
#[derive(Debug, Clone, Default)]
pub struct CompromiseSearch;

impl ConsensusStrategy for CompromiseSearch {
    fn name(&self) -> &str {
        "compromise"
    }

    fn aggregate(&self, evaluations: &[Evaluation]) -> f64 {
        mean(evaluations)
    }

    fn mediate(&self, proposal: &Proposal, evaluations: &[Evaluation], threshold: f64) -> Proposal {
        let mut lowest: Vec<&Evaluation> = evaluations
            .iter()
            .filter(|e| e.approval < threshold)
            .collect();
        lowest.sort_by(|a, b| {
            a.approval
                .total_cmp(&b.approval)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        lowest.truncate(2);
        merge_feedback(proposal, &lowest)
    }
}

/// 按配置名构造策略：weighted / veto / compromise
pub fn strategy_from_config(section: &NegotiationSection) -> Result<Arc<dyn ConsensusStrategy>, HiveError> {
    match section.strategy.as_str() {
        "weighted" => Ok(Arc::new(WeightedVoting::new(section.weights.clone()))),
        "veto" => Ok(Arc::new(VetoStrategy::new(
            section.veto_thresholds.clone(),
            section.weights.clone(),
        ))),
        "compromise" => Ok(Arc::new(CompromiseSearch)),
        other => Err(HiveError::Config(format!("unknown negotiation strategy '{other}'"))),
    }
}
