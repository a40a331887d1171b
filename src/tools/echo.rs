//! Echo 工具（测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::core::HiveError;
use crate::tools::{ToolOutput, ToolProvider};

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl ToolProvider for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text (for testing). Params: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolOutput, HiveError> {
        let text = params
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(ToolOutput::text(text))
    }
}
