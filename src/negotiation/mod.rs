//! 协商 / 共识引擎：提案评估、策略聚合、调解修订与成功模式学习

pub mod engine;
pub mod patterns;
pub mod proposal;
pub mod strategy;

pub use engine::{NegotiationConfig, NegotiationEngine, Negotiator};
pub use patterns::{FeatureRecord, SuccessPatternStore};
pub use proposal::{Evaluation, NegotiationSession, Proposal, RoundRecord, TerminalReason};
pub use strategy::{
    merge_feedback, strategy_from_config, CompromiseSearch, ConsensusStrategy, VetoStrategy,
    WeightedVoting,
};
