//! Agent 注册表与选择
//!
//! 系统初始化时注册 agent，跨任务存活。选择：能力匹配（二值门）× 性能权重，
//! 平局（差值 < 1e-9）取最久未使用者，再按 id。选中即原子预约（idle → working）。

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use crate::agent::handle::role_topic;
use crate::agent::{AgentHandle, AgentLease, AgentSnapshot, AgentSpec, AgentState, RoleTable};
use crate::bus::CommunicationBus;
use crate::core::HiveError;
use crate::memory::{AgentMemory, EpisodicLog, MemoryConfig};
use crate::tools::ToolExecutor;

const FITNESS_EPSILON: f64 = 1e-9;

/// 差值小于 FITNESS_EPSILON 的适配度落入同一档
fn quantize(fitness: f64) -> i64 {
    (fitness / FITNESS_EPSILON).round() as i64
}

/// 选择条件：角色 + 需要的能力
#[derive(Debug, Clone, Default)]
pub struct AgentRequirements {
    pub role: String,
    pub capabilities: BTreeSet<String>,
}

impl AgentRequirements {
    pub fn role(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }
}

pub struct AgentRegistry {
    roles: Arc<RoleTable>,
    executor: Arc<ToolExecutor>,
    memory_config: MemoryConfig,
    episodic: Arc<EpisodicLog>,
    latency_scale_ms: f64,
    learning_rate: f64,
    bus: Option<Arc<CommunicationBus>>,
    agents: RwLock<BTreeMap<String, Arc<AgentHandle>>>,
}

impl AgentRegistry {
    pub fn new(
        roles: Arc<RoleTable>,
        executor: Arc<ToolExecutor>,
        memory_config: MemoryConfig,
        episodic: Arc<EpisodicLog>,
    ) -> Self {
        Self {
            roles,
            executor,
            memory_config,
            episodic,
            latency_scale_ms: 1_000.0,
            learning_rate: 0.3,
            bus: None,
            agents: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_latency_scale(mut self, scale_ms: f64) -> Self {
        self.latency_scale_ms = scale_ms;
        self
    }

    pub fn with_learning_rate(mut self, rate: f64) -> Self {
        self.learning_rate = rate;
        self
    }

    /// 注册的 agent 接入总线并订阅自己角色的主题
    pub fn with_bus(mut self, bus: Arc<CommunicationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn roles(&self) -> &Arc<RoleTable> {
        &self.roles
    }

    pub fn episodic(&self) -> &Arc<EpisodicLog> {
        &self.episodic
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    /// 注册：角色必须在角色表中，id 不可重复，能力非空且都是已注册工具
    pub fn register(&self, spec: AgentSpec) -> Result<Arc<AgentHandle>, HiveError> {
        if spec.id.trim().is_empty() {
            return Err(HiveError::validation("agent id must not be empty"));
        }
        let strategy = self.roles.get(&spec.role)?;
        if spec.capabilities.is_empty() {
            return Err(HiveError::Validation(format!("agent '{}' declares no capabilities", spec.id)));
        }
        if let Some(missing) = spec
            .capabilities
            .iter()
            .find(|c| !self.executor.registry().contains(c))
        {
            return Err(HiveError::Validation(format!(
                "agent '{}' declares unregistered capability '{missing}'",
                spec.id
            )));
        }

        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        if agents.contains_key(&spec.id) {
            return Err(HiveError::Validation(format!("agent '{}' already registered", spec.id)));
        }
        let memory = AgentMemory::new(&spec.id, self.memory_config.clone(), Arc::clone(&self.episodic));
        let id = spec.id.clone();
        tracing::info!(agent = %id, role = %spec.role, capabilities = ?spec.capabilities, "agent registered");
        let mut handle = AgentHandle::new(spec, strategy, Arc::clone(&self.executor), memory)
            .with_learning_rate(self.learning_rate);
        if let Some(bus) = &self.bus {
            bus.subscribe(&id, &role_topic(handle.role()));
            handle = handle.with_bus(Arc::clone(bus));
        }
        let handle = Arc::new(handle);
        agents.insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> Option<Arc<AgentHandle>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<AgentHandle>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshots(&self) -> Vec<AgentSnapshot> {
        self.all().iter().map(|a| a.snapshot()).collect()
    }

    /// 挑选并预约最合适的空闲 agent
    pub fn select_agent(&self, requirements: &AgentRequirements) -> Result<AgentLease, HiveError> {
        let mut candidates: Vec<(f64, u64, Arc<AgentHandle>)> = self
            .all()
            .into_iter()
            .filter(|a| a.role() == requirements.role)
            .filter(|a| requirements.capabilities.is_subset(a.capabilities()))
            .filter(|a| a.state() == AgentState::Idle)
            .map(|a| (a.stats().fitness(self.latency_scale_ms), a.last_used(), a))
            .collect();

        // 量化后比较，保证排序关系可传递
        candidates.sort_by_cached_key(|(fitness, last_used, agent)| {
            (Reverse(quantize(*fitness)), *last_used, agent.id().to_string())
        });

        // 排序与预约之间可能被并发抢占，逐个尝试
        for (fitness, _, agent) in candidates {
            if let Some(lease) = agent.try_reserve() {
                tracing::debug!(agent = %agent.id(), role = %requirements.role, fitness, "agent selected");
                return Ok(lease);
            }
        }
        Err(HiveError::NoAgentAvailable {
            role: requirements.role.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentStats, KeywordStrategy};
    use crate::resilience::ResilienceLayer;
    use crate::tools::{EchoTool, ToolRegistry};

    fn registry() -> AgentRegistry {
        let mut roles = RoleTable::new();
        roles.register(KeywordStrategy::new("writer", "echo")).unwrap();
        roles.register(KeywordStrategy::new("editor", "echo")).unwrap();
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool).unwrap();
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(tools),
            Arc::new(ResilienceLayer::default()),
            5,
        ));
        AgentRegistry::new(
            Arc::new(roles),
            executor,
            MemoryConfig::default(),
            Arc::new(EpisodicLog::new(16)),
        )
    }

    #[test]
    fn test_register_validates() {
        let reg = registry();
        reg.register(AgentSpec::new("w1", "writer", ["echo"])).unwrap();
        assert!(reg.register(AgentSpec::new("w1", "writer", ["echo"])).is_err());
        assert!(reg.register(AgentSpec::new("x", "painter", ["echo"])).is_err());
        assert!(reg.register(AgentSpec::new("y", "writer", ["teleport"])).is_err());
        assert!(reg.register(AgentSpec::new("z", "writer", Vec::<String>::new())).is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_selects_higher_success_rate_writer() {
        let reg = registry();
        reg.register(AgentSpec::new("w-low", "writer", ["echo"]).with_stats(AgentStats::new(0.80, 0.0)))
            .unwrap();
        reg.register(AgentSpec::new("w-high", "writer", ["echo"]).with_stats(AgentStats::new(0.95, 0.0)))
            .unwrap();

        let lease = reg.select_agent(&AgentRequirements::role("writer")).unwrap();
        assert_eq!(lease.id(), "w-high");
        assert_eq!(reg.get("w-high").unwrap().state(), AgentState::Working);
        assert_eq!(reg.get("w-low").unwrap().state(), AgentState::Idle);

        // 已预约的不再被选中
        let second = reg.select_agent(&AgentRequirements::role("writer")).unwrap();
        assert_eq!(second.id(), "w-low");
        assert!(matches!(
            reg.select_agent(&AgentRequirements::role("writer")),
            Err(HiveError::NoAgentAvailable { .. })
        ));
        drop(lease);
        assert_eq!(reg.get("w-high").unwrap().state(), AgentState::Idle);
    }

    #[test]
    fn test_latency_lowers_fitness_and_ties_go_to_least_recent() {
        let reg = registry();
        reg.register(AgentSpec::new("fast", "editor", ["echo"]).with_stats(AgentStats::new(0.9, 0.0)))
            .unwrap();
        reg.register(AgentSpec::new("slow", "editor", ["echo"]).with_stats(AgentStats::new(0.9, 1_000.0)))
            .unwrap();
        assert_eq!(reg.select_agent(&AgentRequirements::role("editor")).unwrap().id(), "fast");

        let reg = registry();
        reg.register(AgentSpec::new("a", "writer", ["echo"])).unwrap();
        reg.register(AgentSpec::new("b", "writer", ["echo"])).unwrap();
        // 平局先按 id
        let first = reg.select_agent(&AgentRequirements::role("writer")).unwrap();
        assert_eq!(first.id(), "a");
        drop(first);
        // a 刚被使用过，b 更久未用
        assert_eq!(reg.select_agent(&AgentRequirements::role("writer")).unwrap().id(), "b");
    }

    #[test]
    fn test_near_equal_fitness_sorts_consistently() {
        let reg = registry();
        for i in 0..40 {
            let rate = 0.9 - i as f64 * 1e-11;
            reg.register(
                AgentSpec::new(format!("w{i:02}"), "writer", ["echo"]).with_stats(AgentStats::new(rate, 0.0)),
            )
            .unwrap();
        }
        let mut picked = Vec::new();
        while let Ok(lease) = reg.select_agent(&AgentRequirements::role("writer")) {
            picked.push(lease);
        }
        assert_eq!(picked.len(), 40);
        assert_eq!(picked[0].id(), "w00");
    }

    #[test]
    fn test_capability_gate() {
        let reg = registry();
        reg.register(AgentSpec::new("w1", "writer", ["echo"])).unwrap();
        let req = AgentRequirements::role("writer").with_capability("render");
        assert!(matches!(reg.select_agent(&req), Err(HiveError::NoAgentAvailable { .. })));
    }
}
