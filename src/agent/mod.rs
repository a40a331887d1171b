//! Agent：单一类型 + 角色策略，注册表负责选择与预约

pub mod handle;
pub mod registry;
pub mod strategy;

pub use handle::{
    role_topic, AgentHandle, AgentLease, AgentOutput, AgentSnapshot, AgentSpec, AgentState, AgentStats,
};
pub use registry::{AgentRegistry, AgentRequirements};
pub use strategy::{AgentContext, Consultation, Decision, KeywordStrategy, RoleStrategy, RoleTable};
