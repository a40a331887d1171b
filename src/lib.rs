//! Hive - 多 Agent 协作编排核心
//!
//! 模块划分：
//! - **tools**: 工具注册表、参数 schema 校验、带 fallback 的执行器
//! - **memory**: 短期 / 长期 / 情景三层记忆、脱敏与持久化
//! - **resilience**: 熔断器、重试策略与弹性调用层
//! - **bus**: agent 间点对点、广播与请求/响应消息
//! - **agent**: 单一 agent 类型 + 角色策略，注册表负责选择与预约
//! - **negotiation**: 提案评估、共识策略、调解与成功模式学习
//! - **quality**: 多维度质量评分与驳回反馈
//! - **core**: 任务、执行计划、编排器与构建器
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: 日志初始化与结构化领域事件

pub mod agent;
pub mod bus;
pub mod config;
pub mod core;
pub mod memory;
pub mod negotiation;
pub mod observability;
pub mod quality;
pub mod resilience;
pub mod tools;

pub use crate::core::{Brief, HiveError, Orchestrator, OrchestratorBuilder, Task, TaskStatus};
