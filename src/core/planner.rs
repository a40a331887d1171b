//! 计划模板：按 brief 的交付物类型选择模板，未注册的类型使用默认模板

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::core::plan::{ExecutionPlan, Phase, PlanBuilder};
use crate::core::task::Brief;
use crate::core::HiveError;

pub trait PlanTemplate: Send + Sync {
    fn plan(&self, brief: &Brief, default_timeout: Duration) -> Result<ExecutionPlan, HiveError>;
}

/// 固定阶段列表的模板
#[derive(Debug, Clone)]
pub struct StaticTemplate {
    phases: Vec<Phase>,
}

impl StaticTemplate {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    /// 默认模板：writer 起草（质量检查）→ writer 与 editor 并行评审后协商定稿
    pub fn standard() -> Self {
        Self::new(vec![
            Phase::new("draft", ["writer"])
                .objective("produce a first draft")
                .quality_checked(),
            Phase::new("review", ["editor", "writer"])
                .objective("review and refine the draft")
                .parallel()
                .negotiate()
                .depends_on("draft"),
        ])
    }
}

impl PlanTemplate for StaticTemplate {
    fn plan(&self, brief: &Brief, default_timeout: Duration) -> Result<ExecutionPlan, HiveError> {
        PlanBuilder::new(format!("{} ({})", brief.title, brief.deliverable))
            .default_timeout(default_timeout)
            .phases(self.phases.iter().cloned())
            .build()
    }
}

impl<F> PlanTemplate for F
where
    F: Fn(&Brief, Duration) -> Result<ExecutionPlan, HiveError> + Send + Sync,
{
    fn plan(&self, brief: &Brief, default_timeout: Duration) -> Result<ExecutionPlan, HiveError> {
        self(brief, default_timeout)
    }
}

pub struct Planner {
    templates: HashMap<String, Arc<dyn PlanTemplate>>,
    fallback: Arc<dyn PlanTemplate>,
    default_timeout: Duration,
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(StaticTemplate::standard(), Duration::from_secs(30))
    }
}

impl Planner {
    pub fn new(fallback: impl PlanTemplate + 'static, default_timeout: Duration) -> Self {
        Self {
            templates: HashMap::new(),
            fallback: Arc::new(fallback),
            default_timeout,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn register(&mut self, deliverable: impl Into<String>, template: impl PlanTemplate + 'static) {
        self.register_arc(deliverable, Arc::new(template));
    }

    pub fn register_arc(&mut self, deliverable: impl Into<String>, template: Arc<dyn PlanTemplate>) {
        self.templates.insert(deliverable.into(), template);
    }

    pub fn create(&self, brief: &Brief) -> Result<ExecutionPlan, HiveError> {
        let template = self
            .templates
            .get(&brief.deliverable)
            .unwrap_or(&self.fallback);
        template.plan(brief, self.default_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_template_wins_over_default() {
        let mut planner = Planner::default();
        planner.register(
            "video",
            StaticTemplate::new(vec![Phase::new("storyboard", ["director"])]),
        );
        let video = planner
            .create(&Brief::new("Launch", "video").requirement("30s"))
            .unwrap();
        assert_eq!(video.phases.len(), 1);
        assert_eq!(video.phases[0].id, "storyboard");

        let other = planner
            .create(&Brief::new("Post", "newsletter").requirement("weekly"))
            .unwrap();
        let ids: Vec<&str> = other.phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["draft", "review"]);
        assert_eq!(other.phases[0].timeout_ms, 30_000);
    }

    #[test]
    fn test_closure_template() {
        let mut planner = Planner::default();
        planner.register("broken", |_: &Brief, _: Duration| {
            PlanBuilder::new("bad")
                .phase(Phase::new("a", ["w"]).depends_on("a"))
                .build()
        });
        assert!(planner.create(&Brief::new("x", "broken").requirement("y")).is_err());
    }
}
