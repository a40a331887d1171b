//! 工具执行器
//!
//! 持有 ToolRegistry、ResilienceLayer 与单次调用超时。execute 依次做能力校验、参数校验，
//! 然后沿 fallback 链逐个 provider 在熔断 + 重试保护下调用；链耗尽时按配置返回降级结果或原错误。
//! 每次 provider 调用输出结构化审计日志（JSON），并按 agent 累计调用次数与成本。

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::{timeout, Instant};

use crate::core::HiveError;
use crate::resilience::ResilienceLayer;
use crate::tools::{ToolOutput, ToolRegistry};

/// 一次工具调用请求
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub agent_id: String,
    pub capabilities: BTreeSet<String>,
    pub tool: String,
    pub params: Value,
    pub task_id: Option<String>,
}

impl ToolRequest {
    pub fn new(agent_id: impl Into<String>, tool: impl Into<String>, params: Value) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: BTreeSet::new(),
            tool: tool.into(),
            params,
            task_id: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: BTreeSet<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_task(mut self, task_id: Option<String>) -> Self {
        self.task_id = task_id;
        self
    }
}

/// 调用结果：实际提供服务的 provider，以及是否为降级结果
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutcome {
    pub requested: String,
    pub served_by: String,
    pub output: ToolOutput,
    /// 降级结果需人工复核
    pub degraded: bool,
    /// 被放弃的 provider 及原因
    pub failures: Vec<String>,
}

/// 单个 agent 的工具使用统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolUsage {
    pub calls: u64,
    pub failures: u64,
    pub cost_units: f64,
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    resilience: Arc<ResilienceLayer>,
    timeout: Duration,
    usage: Mutex<HashMap<String, ToolUsage>>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, resilience: Arc<ResilienceLayer>, timeout_secs: u64) -> Self {
        Self {
            registry,
            resilience,
            timeout: Duration::from_secs(timeout_secs),
            usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn resilience(&self) -> &Arc<ResilienceLayer> {
        &self.resilience
    }

    /// 执行工具；能力或参数不符返回 ValidationError（不重试），致命错误直接上抛，其余失败走 fallback 链
    pub async fn execute(&self, request: ToolRequest) -> Result<ToolOutcome, HiveError> {
        if !request.capabilities.contains(&request.tool) {
            return Err(HiveError::validation(format!(
                "agent '{}' lacks capability '{}'",
                request.agent_id, request.tool
            )));
        }
        self.registry.validate_params(&request.tool, &request.params)?;

        let chain = self.registry.fallback_chain(&request.tool);
        let task_id = request.task_id.as_deref();
        let mut failures = Vec::new();
        let mut last_err = HiveError::ToolUnavailable(request.tool.clone());

        for provider in chain {
            let name = provider.name().to_string();
            if name != request.tool {
                if let Err(e) = crate::tools::schema::validate_params(
                    &provider.parameters_schema(),
                    &request.params,
                ) {
                    tracing::warn!(tool = %request.tool, alternate = %name, error = %e, "alternate rejects params");
                    failures.push(format!("{name}: {e}"));
                    continue;
                }
            }

            let per_call = self.timeout;
            let params = request.params.clone();
            let start = Instant::now();
            let result = self
                .resilience
                .call(provider.service_id(), task_id, {
                    let provider = Arc::clone(&provider);
                    let name = name.clone();
                    move || {
                        let provider = Arc::clone(&provider);
                        let params = params.clone();
                        let name = name.clone();
                        async move {
                            match timeout(per_call, provider.execute(params)).await {
                                Ok(r) => r,
                                Err(_) => Err(HiveError::Timeout(format!(
                                    "tool '{name}' exceeded {}ms",
                                    per_call.as_millis()
                                ))),
                            }
                        }
                    }
                })
                .await;
            self.audit(&request, &name, &result, start.elapsed());

            match result {
                Ok(mut output) => {
                    if output.cost.latency_ms == 0 {
                        output.cost.latency_ms = start.elapsed().as_millis() as u64;
                    }
                    self.account(&request.agent_id, Some(output.cost.units));
                    return Ok(ToolOutcome {
                        requested: request.tool.clone(),
                        served_by: name,
                        output,
                        degraded: false,
                        failures,
                    });
                }
                Err(e @ (HiveError::Validation(_) | HiveError::Fatal(_))) => {
                    self.account(&request.agent_id, None);
                    return Err(e);
                }
                Err(e) => {
                    failures.push(format!("{name}: {e}"));
                    last_err = e;
                }
            }
        }

        self.account(&request.agent_id, None);
        if self.resilience.degraded_fallback() {
            tracing::warn!(tool = %request.tool, agent = %request.agent_id, "fallback chain exhausted, returning degraded result");
            Ok(ToolOutcome {
                requested: request.tool.clone(),
                served_by: "degraded".to_string(),
                output: ToolOutput::text(format!(
                    "[degraded] '{}' unavailable, manual review required: {last_err}",
                    request.tool
                )),
                degraded: true,
                failures,
            })
        } else {
            Err(last_err)
        }
    }

    /// 某 agent 的累计使用量
    pub fn usage(&self, agent_id: &str) -> ToolUsage {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    fn account(&self, agent_id: &str, cost: Option<f64>) {
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = usage.entry(agent_id.to_string()).or_default();
        entry.calls += 1;
        match cost {
            Some(units) => entry.cost_units += units,
            None => entry.failures += 1,
        }
    }

    fn audit(
        &self,
        request: &ToolRequest,
        provider: &str,
        result: &Result<ToolOutput, HiveError>,
        elapsed: Duration,
    ) {
        let (ok, outcome) = match result {
            Ok(_) => (true, "ok".to_string()),
            Err(e) => (false, format!("{:?}", e.kind()).to_lowercase()),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": request.tool,
            "provider": provider,
            "agent": request.agent_id,
            "task_id": request.task_id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": elapsed.as_millis() as u64,
            "params_preview": params_preview(&request.params),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
    }
}

fn params_preview(params: &Value) -> String {
    let s = params.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
