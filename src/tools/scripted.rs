//! 脚本化工具：按预设步骤返回结果，用于演示与测试熔断、重试、超时路径

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::HiveError;
use crate::tools::{ToolOutput, ToolProvider};

/// 单次调用的脚本步骤
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(String),
    /// 回显 params.input（可带前缀）
    Echo { prefix: String },
    Fail(HiveError),
    /// 等待后再回复
    Delay(Duration, String),
    /// 永不返回（由调用方超时）
    Hang,
}

pub struct ScriptedTool {
    name: String,
    service_id: String,
    description: String,
    script: Mutex<VecDeque<ScriptStep>>,
    default_step: ScriptStep,
    cost_units: f64,
    calls: AtomicU32,
}

impl ScriptedTool {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            service_id: name.clone(),
            description: format!("scripted tool '{name}'"),
            name,
            script: Mutex::new(VecDeque::new()),
            default_step: ScriptStep::Echo {
                prefix: String::new(),
            },
            cost_units: 1.0,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_service(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = service_id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// 追加一步；脚本耗尽后使用默认步骤
    pub fn then(self, step: ScriptStep) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(step);
        self
    }

    pub fn otherwise(mut self, step: ScriptStep) -> Self {
        self.default_step = step;
        self
    }

    pub fn with_cost(mut self, units: f64) -> Self {
        self.cost_units = units;
        self
    }

    /// 实际被调用的次数
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> ScriptStep {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.default_step.clone())
    }
}

#[async_trait]
impl ToolProvider for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "input": { "type": "string" } },
            "required": []
        })
    }

    fn service_id(&self) -> &str {
        &self.service_id
    }

    async fn execute(&self, params: Value) -> Result<ToolOutput, HiveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = match self.next_step() {
            ScriptStep::Reply(text) => text,
            ScriptStep::Echo { prefix } => {
                let input = params.get("input").and_then(Value::as_str).unwrap_or_default();
                format!("{prefix}{input}")
            }
            ScriptStep::Fail(err) => return Err(err),
            ScriptStep::Delay(delay, text) => {
                tokio::time::sleep(delay).await;
                text
            }
            ScriptStep::Hang => std::future::pending::<String>().await,
        };
        Ok(ToolOutput::text(content).with_cost(self.cost_units))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_default() {
        let tool = ScriptedTool::new("search")
            .then(ScriptStep::Fail(HiveError::Transient("reset".into())))
            .then(ScriptStep::Reply("first".into()));
        assert!(tool.execute(Value::Null).await.is_err());
        assert_eq!(tool.execute(Value::Null).await.unwrap().content, "first");
        let echoed = tool
            .execute(serde_json::json!({"input": "again"}))
            .await
            .unwrap();
        assert_eq!(echoed.content, "again");
        assert_eq!(echoed.cost.units, 1.0);
        assert_eq!(tool.calls(), 3);
    }
}
