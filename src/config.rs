//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__NEGOTIATION__THRESHOLD=0.8`）。
//! 各段只描述可调参数；运行时结构（CircuitBreakerConfig、RetryPolicy、MemoryConfig 等）通过 `From` 从对应段构建。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub orchestrator: OrchestratorSection,
    pub memory: MemorySection,
    pub resilience: ResilienceSection,
    pub negotiation: NegotiationSection,
    pub quality: QualitySection,
    pub bus: BusSection,
    pub tools: ToolsSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 记忆持久化目录，未设置时仅使用内存存储
    pub data_dir: Option<PathBuf>,
}

/// [orchestrator] 段：修订预算、阶段默认超时、选择时的延迟尺度
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 每个阶段最多修订轮数（K）
    pub revision_budget: u32,
    pub default_phase_timeout_ms: u64,
    /// 平均延迟归一化尺度：performance = success_rate / (1 + latency / scale)
    pub latency_scale_ms: f64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            revision_budget: 2,
            default_phase_timeout_ms: 30_000,
            latency_scale_ms: 1_000.0,
        }
    }
}

/// [memory] 段：各层容量、衰减半衰期、提升阈值、保留时长
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub short_term_capacity: usize,
    pub long_term_capacity: usize,
    pub episodic_capacity: usize,
    pub half_life_secs: u64,
    pub promotion_threshold: f64,
    /// 某类任务在情景日志中出现次数超过该值才沉淀为 pattern
    pub pattern_min_support: usize,
    /// 记忆条目保留时长，过期即清除
    pub retention_secs: u64,
    /// 每写入多少条短期记忆触发一次 consolidate
    pub consolidate_every: usize,
    /// 长期记忆淘汰时 recency 的权重（其余为 frequency）
    pub recency_weight: f64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            short_term_capacity: 32,
            long_term_capacity: 256,
            episodic_capacity: 128,
            half_life_secs: 3_600,
            promotion_threshold: 0.6,
            pattern_min_support: 3,
            retention_secs: 7 * 24 * 3_600,
            consolidate_every: 8,
            recency_weight: 0.5,
        }
    }
}

/// [resilience] 段：熔断与重试参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceSection {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    pub backoff_multiplier: f64,
    /// transient 错误最多尝试次数（含首次）
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// provider 未给出 retry-after 时的默认等待
    pub rate_limit_wait_ms: u64,
    /// fallback 链耗尽时是否返回降级（待人工复核）结果
    pub degraded_fallback: bool,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 1_000,
            max_cooldown_ms: 60_000,
            backoff_multiplier: 2.0,
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            rate_limit_wait_ms: 1_000,
            degraded_fallback: true,
        }
    }
}

/// [negotiation] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NegotiationSection {
    pub threshold: f64,
    pub max_rounds: usize,
    pub round_timeout_ms: u64,
    /// weighted / veto / compromise
    pub strategy: String,
    /// 成功模式对 agent 灵活度的影响比例
    pub learning_rate: f64,
    /// agent id -> 投票权重
    pub weights: HashMap<String, f64>,
    /// agent id -> 一票否决阈值（仅 veto 策略生效）
    pub veto_thresholds: HashMap<String, f64>,
}

impl Default for NegotiationSection {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            max_rounds: 3,
            round_timeout_ms: 10_000,
            strategy: "weighted".to_string(),
            learning_rate: 0.3,
            weights: HashMap::new(),
            veto_thresholds: HashMap::new(),
        }
    }
}

/// [quality] 段：全局阈值、各维度权重与下限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualitySection {
    pub threshold: f64,
    pub weights: HashMap<String, f64>,
    pub floors: HashMap<String, f64>,
    /// completeness 维度的目标字符数
    pub target_length: usize,
}

impl Default for QualitySection {
    fn default() -> Self {
        let weights = [("relevance", 0.5), ("readability", 0.3), ("completeness", 0.2)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let floors = [("relevance", 0.4)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self {
            threshold: 0.6,
            weights,
            floors,
            target_length: 400,
        }
    }
}

/// [bus] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub request_timeout_ms: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 主工具 -> 备用工具列表（按顺序尝试）
    pub fallbacks: HashMap<String, Vec<String>>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            fallbacks: HashMap::new(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_consistent() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestrator.revision_budget, 2);
        assert!((cfg.negotiation.threshold - 0.7).abs() < f64::EPSILON);
        let sum: f64 = cfg.quality.weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[resilience]\nfailure_threshold = 3\ncooldown_ms = 1000\n\n[negotiation]\nstrategy = \"veto\""
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.resilience.failure_threshold, 3);
        assert_eq!(cfg.negotiation.strategy, "veto");
        // 未出现的段取默认值
        assert_eq!(cfg.memory.short_term_capacity, 32);
    }
}
