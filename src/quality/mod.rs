//! 质量门：可插拔维度评估器 + 加权阈值与维度下限

pub mod evaluators;
pub mod gate;

pub use evaluators::{Completeness, DimensionEvaluator, FnEvaluator, Readability, Relevance};
pub use gate::{
    config_gate_factory, DimensionScore, GateDimension, GateFactory, QualityGate, QualityReport,
    Shortfall,
};
