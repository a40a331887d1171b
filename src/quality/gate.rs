//! 质量门
//!
//! 加权分 = Σ weight × score（权重和必须为 1）。通过条件：加权分 ≥ 全局阈值，且每个维度 ≥ 其下限。
//! 驳回时给出按差距从大到小排序的 (维度, 差距, 修订建议) 列表，交给修订循环。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::QualitySection;
use crate::core::HiveError;
use crate::quality::evaluators::dedup_keywords;
use crate::quality::{Completeness, DimensionEvaluator, Readability, Relevance};

const WEIGHT_TOLERANCE: f64 = 1e-6;

pub struct GateDimension {
    pub evaluator: Arc<dyn DimensionEvaluator>,
    pub weight: f64,
    pub floor: f64,
}

impl GateDimension {
    pub fn new(evaluator: impl DimensionEvaluator + 'static, weight: f64) -> Self {
        Self {
            evaluator: Arc::new(evaluator),
            weight,
            floor: 0.0,
        }
    }

    pub fn with_floor(mut self, floor: f64) -> Self {
        self.floor = floor;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
    pub dimension: String,
    pub score: f64,
    pub weight: f64,
    pub floor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shortfall {
    pub dimension: String,
    pub shortfall: f64,
    pub fix: String,
}

impl Shortfall {
    /// 作为修订意见传给 agent 的一行
    pub fn as_feedback(&self) -> String {
        format!("{} short by {:.2}: {}", self.dimension, self.shortfall, self.fix)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub weighted: f64,
    pub threshold: f64,
    pub accepted: bool,
    pub dimensions: Vec<DimensionScore>,
    /// 驳回时非空，按差距降序
    pub shortfalls: Vec<Shortfall>,
}

impl QualityReport {
    pub fn feedback(&self) -> Vec<String> {
        self.shortfalls.iter().map(Shortfall::as_feedback).collect()
    }
}

pub struct QualityGate {
    threshold: f64,
    dimensions: Vec<GateDimension>,
}

impl std::fmt::Debug for QualityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.dimensions.iter().map(|d| d.evaluator.name()).collect();
        f.debug_struct("QualityGate")
            .field("threshold", &self.threshold)
            .field("dimensions", &names)
            .finish()
    }
}

impl QualityGate {
    /// 权重必须非负且和为 1，否则 ValidationError
    pub fn new(threshold: f64, dimensions: Vec<GateDimension>) -> Result<Self, HiveError> {
        if dimensions.is_empty() {
            return Err(HiveError::validation("quality gate needs at least one dimension"));
        }
        if let Some(d) = dimensions.iter().find(|d| d.weight < 0.0) {
            return Err(HiveError::Validation(format!(
                "negative weight for dimension '{}'",
                d.evaluator.name()
            )));
        }
        let sum: f64 = dimensions.iter().map(|d| d.weight).sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(HiveError::Validation(format!(
                "quality weights must sum to 1.0, got {sum:.4}"
            )));
        }
        Ok(Self {
            threshold: threshold.clamp(0.0, 1.0),
            dimensions,
        })
    }

    /// 按配置为某个 brief 构建：内置 relevance / readability / completeness，
    /// 配置中出现的其他维度名是错误
    pub fn for_brief(section: &QualitySection, keywords: &[String]) -> Result<Self, HiveError> {
        let mut names: Vec<&String> = section.weights.keys().collect();
        names.sort();
        let mut dimensions = Vec::with_capacity(names.len());
        for name in names {
            let evaluator: Arc<dyn DimensionEvaluator> = match name.as_str() {
                "relevance" => Arc::new(Relevance::new(dedup_keywords(keywords))),
                "readability" => Arc::new(Readability::default()),
                "completeness" => Arc::new(Completeness::new(section.target_length)),
                other => {
                    return Err(HiveError::Validation(format!("unknown quality dimension '{other}'")))
                }
            };
            dimensions.push(GateDimension {
                evaluator,
                weight: section.weights[name],
                floor: section.floors.get(name).copied().unwrap_or(0.0),
            });
        }
        Self::new(section.threshold, dimensions)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn score(&self, content: &str) -> QualityReport {
        let dimensions: Vec<DimensionScore> = self
            .dimensions
            .iter()
            .map(|d| DimensionScore {
                dimension: d.evaluator.name().to_string(),
                score: d.evaluator.score(content).clamp(0.0, 1.0),
                weight: d.weight,
                floor: d.floor,
            })
            .collect();
        let weighted: f64 = dimensions.iter().map(|d| d.weight * d.score).sum();
        let weighted_ok = weighted >= self.threshold;
        let floors_ok = dimensions.iter().all(|d| d.score >= d.floor);
        let accepted = weighted_ok && floors_ok;

        let mut shortfalls = Vec::new();
        if !accepted {
            for (d, gate) in dimensions.iter().zip(&self.dimensions) {
                let below_floor = (d.floor - d.score).max(0.0);
                let below_threshold = if weighted_ok {
                    0.0
                } else {
                    (self.threshold - d.score).max(0.0)
                };
                let gap = below_floor.max(below_threshold);
                if gap > 0.0 {
                    shortfalls.push(Shortfall {
                        dimension: d.dimension.clone(),
                        shortfall: gap,
                        fix: gate.evaluator.suggestion(content),
                    });
                }
            }
            shortfalls.sort_by(|a, b| {
                b.shortfall
                    .total_cmp(&a.shortfall)
                    .then_with(|| a.dimension.cmp(&b.dimension))
            });
        }

        QualityReport {
            weighted,
            threshold: self.threshold,
            accepted,
            dimensions,
            shortfalls,
        }
    }
}

/// 按 brief 关键词构建质量门；可替换为自定义实现
pub type GateFactory = Arc<dyn Fn(&[String]) -> Result<QualityGate, HiveError> + Send + Sync>;

/// 基于配置的默认工厂
pub fn config_gate_factory(section: QualitySection) -> GateFactory {
    Arc::new(move |keywords| QualityGate::for_brief(&section, keywords))
}
