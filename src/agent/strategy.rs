//! 角色策略
//!
//! Agent 只有一种类型，行为差异来自角色策略对象：`execute` 根据上下文与召回的记忆给出决策，
//! `evaluate` 对协商中的提案打分。角色到策略的映射是一张查找表，注册时校验。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::HiveError;
use crate::memory::tokenizer::{tokenize, tokenize_to_set};
use crate::memory::MemoryItem;
use crate::negotiation::{Evaluation, Proposal};

/// 一次阶段执行交给 agent 的上下文
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentContext {
    pub task_id: String,
    /// 任务类型（brief 的 deliverable）
    pub task_type: String,
    pub phase: String,
    pub objective: String,
    pub keywords: Vec<String>,
    /// 顺序阶段中上一步的输出
    pub input: Option<String>,
    /// 质量门驳回后的结构化修订意见
    pub feedback: Vec<String>,
}

impl AgentContext {
    /// 记忆检索用的查询文本
    pub fn query(&self) -> String {
        format!("{} {} {}", self.phase, self.objective, self.keywords.join(" "))
    }
}

/// 行动前向某个角色的同伴征询意见
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Consultation {
    pub role: String,
    pub question: String,
}

/// think 的结果：调用哪个能力、用什么参数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub capability: String,
    pub params: Value,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consult: Option<Consultation>,
}

pub trait RoleStrategy: Send + Sync {
    fn role(&self) -> &str;

    /// 纯函数：相同的上下文与记忆得到相同的决策
    fn execute(
        &self,
        ctx: &AgentContext,
        recalled: &[MemoryItem],
        capabilities: &BTreeSet<String>,
    ) -> Result<Decision, HiveError>;

    /// 返回的 Evaluation 的 agent_id 由调用方填写
    fn evaluate(&self, proposal: &Proposal, ctx: &AgentContext) -> Evaluation;

    /// 回答同伴的征询
    fn advise(&self, _question: &str) -> Vec<String> {
        Vec::new()
    }
}

/// 角色 → 策略
#[derive(Default, Clone)]
pub struct RoleTable {
    strategies: HashMap<String, Arc<dyn RoleStrategy>>,
}

impl RoleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: impl RoleStrategy + 'static) -> Result<(), HiveError> {
        self.register_arc(Arc::new(strategy))
    }

    pub fn register_arc(&mut self, strategy: Arc<dyn RoleStrategy>) -> Result<(), HiveError> {
        let role = strategy.role().trim().to_string();
        if role.is_empty() {
            return Err(HiveError::validation("role name must not be empty"));
        }
        if self.strategies.contains_key(&role) {
            return Err(HiveError::Validation(format!("role '{role}' already registered")));
        }
        self.strategies.insert(role, strategy);
        Ok(())
    }

    pub fn get(&self, role: &str) -> Result<Arc<dyn RoleStrategy>, HiveError> {
        self.strategies
            .get(role)
            .cloned()
            .ok_or_else(|| HiveError::Validation(format!("unknown role '{role}'")))
    }

    pub fn contains(&self, role: &str) -> bool {
        self.strategies.contains_key(role)
    }

    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.strategies.keys().cloned().collect();
        roles.sort();
        roles
    }
}

/// 关键词驱动的通用角色策略
///
/// execute：用首选能力（未声明时退回到排序后的第一个能力），把目标、关键词、上一步输出、
/// 修订意见与召回的记忆拼成 `input` 参数。
/// evaluate：提案对关注词（角色关注词 + brief 关键词）的覆盖率即认可度，缺失的词给出 concern 与修改建议。
/// advise：把角色关注词作为建议回给征询方。
#[derive(Debug, Clone)]
pub struct KeywordStrategy {
    role: String,
    capability: String,
    focus: Vec<String>,
    consults: Option<String>,
}

impl KeywordStrategy {
    pub fn new(role: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            capability: capability.into(),
            focus: Vec::new(),
            consults: None,
        }
    }

    /// 每次执行前先征询该角色的同伴
    pub fn consulting(mut self, role: impl Into<String>) -> Self {
        self.consults = Some(role.into());
        self
    }

    pub fn with_focus<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.focus.extend(terms.into_iter().map(Into::into));
        self
    }

    fn terms(&self, ctx: &AgentContext) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.focus
            .iter()
            .chain(ctx.keywords.iter())
            .filter(|t| !tokenize(t).is_empty())
            .filter(|t| seen.insert(t.to_lowercase()))
            .cloned()
            .collect()
    }
}

impl RoleStrategy for KeywordStrategy {
    fn role(&self) -> &str {
        &self.role
    }

    fn execute(
        &self,
        ctx: &AgentContext,
        recalled: &[MemoryItem],
        capabilities: &BTreeSet<String>,
    ) -> Result<Decision, HiveError> {
        let capability = if capabilities.contains(&self.capability) {
            self.capability.clone()
        } else {
            capabilities
                .iter()
                .next()
                .cloned()
                .ok_or_else(|| HiveError::Validation(format!("role '{}' has no capabilities", self.role)))?
        };

        let mut lines = vec![format!("[{}] {}", ctx.phase, ctx.objective)];
        if !ctx.keywords.is_empty() {
            lines.push(format!("keywords: {}", ctx.keywords.join(", ")));
        }
        if let Some(input) = &ctx.input {
            lines.push(input.clone());
        }
        lines.extend(ctx.feedback.iter().map(|f| format!("revise: {f}")));
        lines.extend(recalled.iter().take(2).map(|m| format!("context: {}", m.content)));

        Ok(Decision {
            rationale: format!(
                "{} handles '{}' via {} with {} recalled item(s)",
                self.role,
                ctx.phase,
                capability,
                recalled.len()
            ),
            capability,
            params: serde_json::json!({ "input": lines.join("\n") }),
            consult: self.consults.as_ref().map(|role| Consultation {
                role: role.clone(),
                question: format!("{}: {}", ctx.phase, ctx.objective),
            }),
        })
    }

    fn evaluate(&self, proposal: &Proposal, ctx: &AgentContext) -> Evaluation {
        let terms = self.terms(ctx);
        if terms.is_empty() {
            return Evaluation::new(String::new(), 0.8);
        }
        let content = tokenize_to_set(&proposal.content);
        let missing: Vec<&String> = terms
            .iter()
            .filter(|t| !tokenize(t).iter().all(|tok| content.contains(tok)))
            .collect();
        let approval = 1.0 - missing.len() as f64 / terms.len() as f64;
        missing.into_iter().fold(Evaluation::new(String::new(), approval), |eval, term| {
            eval.with_concern(format!("{}: missing '{}'", self.role, term))
                .with_modification(format!("cover {term}"))
        })
    }

    fn advise(&self, _question: &str) -> Vec<String> {
        self.focus.iter().map(|t| format!("cover {t}")).collect()
    }
}
