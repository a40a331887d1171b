//! Orchestrator 构建器
//!
//! 所有注册表（工具、角色、agent、熔断器）都是显式上下文对象，在这里组装并注入，
//! 同一进程内可以有多个互不影响的 Orchestrator。构建时校验每个 agent 的能力都是已注册工具。

use std::sync::Arc;
use std::time::Duration;

use crate::agent::{AgentRegistry, AgentSpec, RoleStrategy, RoleTable};
use crate::bus::CommunicationBus;
use crate::config::AppConfig;
use crate::core::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::core::planner::{PlanTemplate, Planner};
use crate::core::HiveError;
use crate::memory::{EpisodicLog, MemoryConfig};
use crate::negotiation::NegotiationEngine;
use crate::observability::{EventSink, TracingSink};
use crate::quality::{config_gate_factory, GateFactory};
use crate::resilience::ResilienceLayer;
use crate::tools::{ToolExecutor, ToolProvider, ToolRegistry};

pub struct OrchestratorBuilder {
    config: AppConfig,
    tools: ToolRegistry,
    roles: RoleTable,
    agents: Vec<AgentSpec>,
    templates: Vec<(String, Arc<dyn PlanTemplate>)>,
    bus: Option<Arc<CommunicationBus>>,
    sink: Option<Arc<dyn EventSink>>,
    resilience: Option<Arc<ResilienceLayer>>,
    episodic: Option<Arc<EpisodicLog>>,
    planner: Option<Planner>,
    gate_factory: Option<GateFactory>,
    errors: Vec<HiveError>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            tools: ToolRegistry::new(),
            roles: RoleTable::new(),
            agents: Vec::new(),
            templates: Vec::new(),
            bus: None,
            sink: None,
            resilience: None,
            episodic: None,
            planner: None,
            gate_factory: None,
            errors: Vec::new(),
        }
    }

    /// 注册工具；重名等错误推迟到 build 时返回
    pub fn tool(mut self, tool: impl ToolProvider + 'static) -> Self {
        if let Err(e) = self.tools.register(tool) {
            self.errors.push(e);
        }
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn role(mut self, strategy: impl RoleStrategy + 'static) -> Self {
        if let Err(e) = self.roles.register(strategy) {
            self.errors.push(e);
        }
        self
    }

    pub fn roles(mut self, roles: RoleTable) -> Self {
        self.roles = roles;
        self
    }

    pub fn agent(mut self, spec: AgentSpec) -> Self {
        self.agents.push(spec);
        self
    }

    pub fn template(mut self, deliverable: impl Into<String>, template: impl PlanTemplate + 'static) -> Self {
        self.templates.push((deliverable.into(), Arc::new(template)));
        self
    }

    pub fn planner(mut self, planner: Planner) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn bus(mut self, bus: Arc<CommunicationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn resilience(mut self, layer: Arc<ResilienceLayer>) -> Self {
        self.resilience = Some(layer);
        self
    }

    /// 共享情景日志（例如从持久化恢复后注入）
    pub fn episodic(mut self, log: Arc<EpisodicLog>) -> Self {
        self.episodic = Some(log);
        self
    }

    pub fn gate_factory(mut self, factory: GateFactory) -> Self {
        self.gate_factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<Orchestrator, HiveError> {
        if let Some(e) = self.errors.into_iter().next() {
            return Err(e);
        }
        let config = self.config;
        let sink: Arc<dyn EventSink> = self.sink.unwrap_or_else(|| Arc::new(TracingSink));

        let mut tools = self.tools;
        tools.apply_fallbacks(&config.tools.fallbacks);
        for spec in &self.agents {
            if let Some(missing) = spec.capabilities.iter().find(|c| !tools.contains(c)) {
                return Err(HiveError::Validation(format!(
                    "agent '{}' declares capability '{missing}' that is not a registered tool",
                    spec.id
                )));
            }
        }

        let resilience = self.resilience.unwrap_or_else(|| {
            Arc::new(ResilienceLayer::from_config(&config.resilience).with_sink(Arc::clone(&sink)))
        });
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(tools),
            resilience,
            config.tools.tool_timeout_secs,
        ));
        let episodic = self
            .episodic
            .unwrap_or_else(|| Arc::new(EpisodicLog::new(config.memory.episodic_capacity)));
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(CommunicationBus::from_config(&config.bus)));
        let agents = AgentRegistry::new(
            Arc::new(self.roles),
            executor,
            MemoryConfig::from(&config.memory),
            episodic,
        )
        .with_latency_scale(config.orchestrator.latency_scale_ms)
        .with_learning_rate(config.negotiation.learning_rate)
        .with_bus(Arc::clone(&bus));

        let mut mailboxes = Vec::with_capacity(self.agents.len());
        for spec in self.agents {
            let id = spec.id.clone();
            agents.register(spec)?;
            mailboxes.push(bus.register(&id));
        }

        let negotiation = NegotiationEngine::from_config(&config.negotiation)?.with_sink(Arc::clone(&sink));

        let default_timeout = Duration::from_millis(config.orchestrator.default_phase_timeout_ms);
        let mut planner = self
            .planner
            .unwrap_or_default()
            .with_default_timeout(default_timeout);
        for (deliverable, template) in self.templates {
            planner.register_arc(deliverable, template);
        }

        let gate_factory = self
            .gate_factory
            .unwrap_or_else(|| config_gate_factory(config.quality.clone()));
        // 质量配置错误在构建时暴露
        gate_factory(&[])?;

        tracing::info!(
            agents = agents.len(),
            roles = ?agents.roles().roles(),
            tools = ?agents.executor().tool_names(),
            "orchestrator built"
        );

        Ok(Orchestrator::new(
            OrchestratorConfig::from(&config.orchestrator),
            Arc::new(agents),
            bus,
            Arc::new(negotiation),
            planner,
            gate_factory,
            sink,
            mailboxes,
        ))
    }
}
