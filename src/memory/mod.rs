//! 记忆层：短期（环形缓冲）、长期（语义键 KV）、情景（共享追加日志）、脱敏与持久化

pub mod agent_memory;
pub mod episodic;
pub mod importance;
pub mod item;
pub mod long_term;
pub mod persistence;
pub mod sanitize;
pub mod short_term;
pub mod tokenizer;

use std::time::Duration;

pub use agent_memory::{
    persist_episodic, restore_episodic, AgentMemory, ConsolidationReport, MemoryUpdate,
};
pub use episodic::{EpisodicLog, Pattern};
pub use importance::ImportanceScorer;
pub use item::{Episode, MemoryItem, MemoryKind, MemoryTier, Outcome};
pub use long_term::LongTermStore;
pub use persistence::{FileStore, InMemoryStore, MemoryStore};
pub use sanitize::sanitize;
pub use short_term::ShortTermMemory;

use crate::config::MemorySection;

/// 记忆运行参数（由配置 `[memory]` 派生）
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub short_term_capacity: usize,
    pub long_term_capacity: usize,
    pub episodic_capacity: usize,
    pub half_life: Duration,
    pub promotion_threshold: f64,
    pub pattern_min_support: usize,
    pub retention: Duration,
    /// 每写入多少条自动 consolidate 一次；0 表示只手动触发
    pub consolidate_every: usize,
    pub recency_weight: f64,
}

impl From<&MemorySection> for MemoryConfig {
    fn from(s: &MemorySection) -> Self {
        Self {
            short_term_capacity: s.short_term_capacity,
            long_term_capacity: s.long_term_capacity,
            episodic_capacity: s.episodic_capacity,
            half_life: Duration::from_secs(s.half_life_secs),
            promotion_threshold: s.promotion_threshold,
            pattern_min_support: s.pattern_min_support,
            retention: Duration::from_secs(s.retention_secs),
            consolidate_every: s.consolidate_every,
            recency_weight: s.recency_weight,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::from(&MemorySection::default())
    }
}
