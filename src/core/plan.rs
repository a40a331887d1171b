//! 执行计划
//!
//! 阶段依赖用邻接表和入度表做拓扑排序（Kahn），同一层按声明顺序稳定输出；
//! 未知依赖、重复 id 与环都是 ValidationError。

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::HiveError;

const DEFAULT_PHASE_TIMEOUT_MS: u64 = 30_000;

/// 并行阶段多个分支结果的合并方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// 按 agent id 顺序拼接
    #[default]
    Concatenate,
    /// 多个分支结果进入协商
    Negotiate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub objective: String,
    /// 需要的角色；并行阶段每个角色一个 agent，顺序阶段按此顺序执行
    pub roles: Vec<String>,
    pub parallel: bool,
    pub timeout_ms: u64,
    pub depends_on: Vec<String>,
    pub merge: MergePolicy,
    pub quality_check: bool,
}

impl Phase {
    pub fn new<I, S>(id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        Self {
            objective: id.clone(),
            id,
            roles: roles.into_iter().map(Into::into).collect(),
            parallel: false,
            timeout_ms: 0,
            depends_on: Vec::new(),
            merge: MergePolicy::Concatenate,
            quality_check: false,
        }
    }

    pub fn objective(mut self, objective: impl Into<String>) -> Self {
        self.objective = objective.into();
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// 0 表示使用计划的默认超时
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn depends_on(mut self, phase_id: impl Into<String>) -> Self {
        self.depends_on.push(phase_id.into());
        self
    }

    pub fn negotiate(mut self) -> Self {
        self.merge = MergePolicy::Negotiate;
        self
    }

    pub fn quality_checked(mut self) -> Self {
        self.quality_check = true;
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 已校验的计划，phases 为拓扑序
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub name: String,
    pub phases: Vec<Phase>,
}

impl ExecutionPlan {
    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// 没有其他阶段依赖的阶段（最终交付物来源）
    pub fn sinks(&self) -> Vec<&Phase> {
        let depended: HashSet<&str> = self
            .phases
            .iter()
            .flat_map(|p| p.depends_on.iter().map(String::as_str))
            .collect();
        self.phases
            .iter()
            .filter(|p| !depended.contains(p.id.as_str()))
            .collect()
    }
}

pub struct PlanBuilder {
    name: String,
    default_timeout: Option<Duration>,
    phases: Vec<Phase>,
}

impl PlanBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_timeout: None,
            phases: Vec::new(),
        }
    }

    /// 未指定超时的阶段使用该值（缺省 30s）
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn phases(mut self, phases: impl IntoIterator<Item = Phase>) -> Self {
        self.phases.extend(phases);
        self
    }

    pub fn build(self) -> Result<ExecutionPlan, HiveError> {
        if self.phases.is_empty() {
            return Err(HiveError::validation("execution plan has no phases"));
        }
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if phase.roles.is_empty() {
                return Err(HiveError::Validation(format!("phase '{}' requires no roles", phase.id)));
            }
            if index.insert(phase.id.as_str(), i).is_some() {
                return Err(HiveError::Validation(format!("duplicate phase id '{}'", phase.id)));
            }
        }

        // 邻接表：阶段 -> 依赖它的阶段；入度：未满足的依赖数
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); self.phases.len()];
        let mut in_degree: Vec<usize> = vec![0; self.phases.len()];
        for (i, phase) in self.phases.iter().enumerate() {
            for dep in &phase.depends_on {
                let &d = index.get(dep.as_str()).ok_or_else(|| {
                    HiveError::Validation(format!("phase '{}' depends on unknown phase '{dep}'", phase.id))
                })?;
                adjacency[d].push(i);
                in_degree[i] += 1;
            }
        }

        let mut ready: VecDeque<usize> = (0..self.phases.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.phases.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &next in &adjacency[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }
        if order.len() != self.phases.len() {
            let stuck: Vec<&str> = (0..self.phases.len())
                .filter(|i| !order.contains(i))
                .map(|i| self.phases[i].id.as_str())
                .collect();
            return Err(HiveError::Validation(format!(
                "cyclic phase dependencies among {}",
                stuck.join(", ")
            )));
        }

        let default_timeout_ms = self
            .default_timeout
            .map_or(DEFAULT_PHASE_TIMEOUT_MS, |t| t.as_millis() as u64);
        let mut slots: Vec<Option<Phase>> = self.phases.into_iter().map(Some).collect();
        let phases = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .map(|mut p| {
                if p.timeout_ms == 0 {
                    p.timeout_ms = default_timeout_ms;
                }
                p
            })
            .collect();

        Ok(ExecutionPlan {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            name: self.name,
            phases,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topological_order() {
        let plan = PlanBuilder::new("blog")
            .phase(Phase::new("publish", ["editor"]).depends_on("review"))
            .phase(Phase::new("draft", ["writer"]))
            .phase(Phase::new("review", ["editor", "writer"]).parallel().depends_on("draft"))
            .build()
            .unwrap();
        let ids: Vec<&str> = plan.phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["draft", "review", "publish"]);
        assert_eq!(plan.sinks()[0].id, "publish");
    }

    #[test]
    fn test_cycle_and_unknown_dependency_rejected() {
        let cyclic = PlanBuilder::new("x")
            .phase(Phase::new("a", ["w"]).depends_on("b"))
            .phase(Phase::new("b", ["w"]).depends_on("a"))
            .build();
        assert!(matches!(cyclic, Err(HiveError::Validation(m)) if m.contains("cyclic")));

        let unknown = PlanBuilder::new("x")
            .phase(Phase::new("a", ["w"]).depends_on("ghost"))
            .build();
        assert!(unknown.is_err());
        assert!(PlanBuilder::new("x").build().is_err());
        assert!(PlanBuilder::new("x")
            .phase(Phase::new("a", ["w"]))
            .phase(Phase::new("a", ["w"]))
            .build()
            .is_err());
    }

    #[test]
    fn test_default_timeout_fills_unset_phases() {
        let plan = PlanBuilder::new("x")
            .default_timeout(Duration::from_secs(5))
            .phase(Phase::new("a", ["w"]))
            .phase(Phase::new("b", ["w"]).timeout(Duration::from_secs(1)))
            .build()
            .unwrap();
        assert_eq!(plan.phases[0].timeout_ms, 5_000);
        assert_eq!(plan.phases[1].timeout_ms, 1_000);

        let plan = PlanBuilder::new("x").phase(Phase::new("a", ["w"])).build().unwrap();
        assert_eq!(plan.phases[0].timeout_ms, 30_000);
    }
}
