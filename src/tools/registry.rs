//! 工具注册表
//!
//! 所有外部能力实现 ToolProvider trait（name / description / parameters_schema / execute），
//! 由 ToolRegistry 按名注册与查找；每个工具可声明备用 provider 组成 fallback 链。
//! ToolExecutor 在调用时做能力校验、参数校验、熔断重试与超时。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::HiveError;
use crate::tools::schema;

/// 调用成本元数据（由 provider 填写）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostMetadata {
    /// 计费单位（token、次数等，由 provider 自定义）
    pub units: f64,
    #[serde(default)]
    pub latency_ms: u64,
}

/// 工具输出
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    #[serde(default)]
    pub cost: CostMetadata,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            cost: CostMetadata::default(),
        }
    }

    pub fn with_cost(mut self, units: f64) -> Self {
        self.cost.units = units;
        self
    }
}

/// 外部能力 trait：名称、描述、参数 schema、异步执行（params 为 JSON）
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// 工具名称，同时是 Agent 能力集中的能力名
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认不限参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 熔断器按此 id 分组；默认与工具名相同
    fn service_id(&self) -> &str {
        self.name()
    }

    async fn execute(&self, params: Value) -> Result<ToolOutput, HiveError>;
}

/// 工具注册表：按名称存储 Arc<dyn ToolProvider>，并记录每个工具的备用链
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolProvider>>,
    fallbacks: HashMap<String, Vec<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；名称为空或重复时返回 ValidationError
    pub fn register(&mut self, tool: impl ToolProvider + 'static) -> Result<(), HiveError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn ToolProvider>) -> Result<(), HiveError> {
        let name = tool.name().trim().to_string();
        if name.is_empty() {
            return Err(HiveError::validation("tool name must not be empty"));
        }
        if self.tools.contains_key(&name) {
            return Err(HiveError::validation(format!("tool '{name}' already registered")));
        }
        tracing::debug!(tool = %name, service = tool.service_id(), "tool registered");
        self.tools.insert(name, tool);
        Ok(())
    }

    /// 为 primary 设置备用 provider（按顺序尝试）
    pub fn set_fallbacks(&mut self, primary: &str, alternates: Vec<String>) {
        self.fallbacks.insert(primary.to_string(), alternates);
    }

    /// 批量设置备用链（来自配置 `[tools.fallbacks]`）
    pub fn apply_fallbacks(&mut self, fallbacks: &HashMap<String, Vec<String>>) {
        for (primary, alternates) in fallbacks {
            self.set_fallbacks(primary, alternates.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolProvider>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// primary 在前，随后是已注册的备用 provider（去重，未注册的跳过）
    pub fn fallback_chain(&self, name: &str) -> Vec<Arc<dyn ToolProvider>> {
        let mut seen = vec![name.to_string()];
        let mut chain: Vec<Arc<dyn ToolProvider>> = self.get(name).into_iter().collect();
        if let Some(alternates) = self.fallbacks.get(name) {
            for alt in alternates {
                if seen.contains(alt) {
                    continue;
                }
                seen.push(alt.clone());
                match self.get(alt) {
                    Some(tool) => chain.push(tool),
                    None => tracing::warn!(tool = name, alternate = %alt, "fallback tool not registered"),
                }
            }
        }
        chain
    }

    /// 按工具声明的 schema 校验参数
    pub fn validate_params(&self, name: &str, params: &Value) -> Result<(), HiveError> {
        let tool = self
            .get(name)
            .ok_or_else(|| HiveError::validation(format!("unknown tool: {name}")))?;
        schema::validate_params(&tool.parameters_schema(), params)
            .map_err(|e| HiveError::validation(format!("{name}: {e}")))
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// (name, description) 列表，按名称排序
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        let sorted: BTreeMap<_, _> = self.tools.iter().collect();
        sorted
            .into_iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect()
    }

    /// 已注册工具的 schema JSON（名称、描述、参数、备用链）
    pub fn to_schema_json(&self) -> String {
        let sorted: BTreeMap<_, _> = self.tools.iter().collect();
        let tools: Vec<Value> = sorted
            .into_iter()
            .map(|(name, tool)| {
                serde_json::json!({
                    "name": name,
                    "description": tool.description(),
                    "service_id": tool.service_id(),
                    "parameters": tool.parameters_schema(),
                    "fallbacks": self.fallbacks.get(name).cloned().unwrap_or_default(),
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    struct Named(&'static str);

    #[async_trait]
    impl ToolProvider for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "named"
        }
        async fn execute(&self, _params: Value) -> Result<ToolOutput, HiveError> {
            Ok(ToolOutput::text(self.0))
        }
    }

    #[test]
    fn test_register_rejects_duplicates_and_empty_names() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool).unwrap();
        assert!(matches!(reg.register(EchoTool), Err(HiveError::Validation(_))));
        assert!(matches!(reg.register(Named("  ")), Err(HiveError::Validation(_))));
        assert_eq!(reg.tool_names(), vec!["echo".to_string()]);
    }

    #[test]
    fn test_fallback_chain_skips_unknown_and_duplicates() {
        let mut reg = ToolRegistry::new();
        reg.register(Named("search")).unwrap();
        reg.register(Named("search_mirror")).unwrap();
        reg.set_fallbacks(
            "search",
            vec!["missing".into(), "search_mirror".into(), "search".into()],
        );
        let chain: Vec<String> = reg
            .fallback_chain("search")
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(chain, vec!["search", "search_mirror"]);
        assert!(reg.fallback_chain("nope").is_empty());
    }

    #[test]
    fn test_validate_params_against_schema() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool).unwrap();
        assert!(reg.validate_params("echo", &serde_json::json!({"text": "hi"})).is_ok());
        assert!(reg.validate_params("echo", &serde_json::json!({})).is_err());
        assert!(reg.validate_params("nope", &serde_json::json!({})).is_err());
    }

    #[test]
    fn test_schema_json_lists_tools() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool).unwrap();
        let v: Value = serde_json::from_str(&reg.to_schema_json()).unwrap();
        assert_eq!(v[0]["name"], "echo");
        assert_eq!(v[0]["parameters"]["required"][0], "text");
    }
}
