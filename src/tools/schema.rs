//! 参数校验与工具调用 JSON Schema
//!
//! `validate_params` 只覆盖 provider schema 中常用的子集：顶层 type=object、required、
//! 以及 properties 中每个字段的 type。`tool_call_schema_json` 由 schemars 生成。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 工具调用请求格式：`{"tool": "...", "params": {...}}`（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名（同时是 Agent 声明的能力名）
    pub tool: String,
    /// 工具参数，依工具不同而不同
    pub params: HashMap<String, serde_json::Value>,
}

/// 返回工具调用的 JSON Schema 字符串
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

/// 按 schema 校验参数，返回第一处不符的描述
pub fn validate_params(schema: &Value, params: &Value) -> Result<(), String> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, params) {
            return Err(format!("params must be of type {expected}"));
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if params.get(field).map_or(true, Value::is_null) {
                return Err(format!("missing required field '{field}'"));
            }
        }
    }

    if let (Some(props), Some(obj)) = (
        schema.get("properties").and_then(Value::as_object),
        params.as_object(),
    ) {
        for (field, value) in obj {
            let expected = props
                .get(field)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str);
            if let Some(expected) = expected {
                if !type_matches(expected, value) {
                    return Err(format!("field '{field}' must be of type {expected}"));
                }
            }
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "limit": {"type": "integer"}
            },
            "required": ["query"]
        })
    }

    #[test]
    fn test_accepts_valid_params() {
        assert!(validate_params(&schema(), &json!({"query": "rust", "limit": 5})).is_ok());
        // 未声明的字段不限制
        assert!(validate_params(&schema(), &json!({"query": "rust", "extra": true})).is_ok());
    }

    #[test]
    fn test_rejects_missing_and_mistyped() {
        let err = validate_params(&schema(), &json!({"limit": 5})).unwrap_err();
        assert!(err.contains("query"));
        let err = validate_params(&schema(), &json!({"query": "x", "limit": 1.5})).unwrap_err();
        assert!(err.contains("limit"));
        assert!(validate_params(&schema(), &json!("query")).is_err());
    }

    #[test]
    fn test_tool_call_schema_mentions_fields() {
        let s = tool_call_schema_json();
        assert!(s.contains("\"tool\""));
        assert!(s.contains("\"params\""));
    }
}
