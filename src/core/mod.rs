//! 核心编排层：错误分类、任务与计划、计划模板、任务监管、编排器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod planner;
pub mod supervisor;
pub mod task;

pub use builder::OrchestratorBuilder;
pub use error::{ErrorKind, FailureReason, HiveError};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use plan::{ExecutionPlan, MergePolicy, Phase, PlanBuilder};
pub use planner::{PlanTemplate, Planner, StaticTemplate};
pub use supervisor::TaskSupervisor;
pub use task::{
    BranchResult, BranchStatus, Brief, Deficiency, PhaseResult, PhaseStatus, Task, TaskStatus,
    TaskStore,
};
