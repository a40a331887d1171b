//! 工具层：注册表、参数 schema、带熔断与 fallback 的执行器

pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;
pub mod scripted;

pub use echo::EchoTool;
pub use executor::{ToolExecutor, ToolOutcome, ToolRequest, ToolUsage};
pub use registry::{CostMetadata, ToolOutput, ToolProvider, ToolRegistry};
pub use schema::{tool_call_schema_json, validate_params};
pub use scripted::{ScriptStep, ScriptedTool};
