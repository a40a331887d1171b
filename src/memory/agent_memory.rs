//! 单个 agent 的记忆：短期环形缓冲 + 长期 KV + 共享情景日志
//!
//! 写入前统一脱敏；`consolidate` 把短期中超过阈值的条目晋升到长期（按语义键幂等），
//! 并从情景日志挖掘模式写入长期。检索按关键词覆盖率排序，同分按时间新近排序，过期条目永不返回。

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::HiveError;
use crate::memory::long_term::LongTermEntry;
use crate::memory::tokenizer::{coverage, semantic_key, tokenize_to_set};
use crate::memory::{
    sanitize, Episode, EpisodicLog, ImportanceScorer, LongTermStore, MemoryConfig, MemoryItem,
    MemoryKind, MemoryStore, MemoryTier, Outcome, ShortTermMemory,
};

const SNAPSHOT_KEY: &str = "memory";
const EPISODIC_SCOPE: &str = "shared";
const EPISODIC_KEY: &str = "episodic";
const PATTERN_IMPORTANCE: f64 = 0.8;

/// 一次 consolidate 的结果（只统计新增的键）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationReport {
    pub promoted: usize,
    pub patterns: usize,
}

/// remember 的结果：写入的条目，以及是否顺带触发了 consolidate
#[derive(Debug, Clone)]
pub struct MemoryUpdate {
    pub item: MemoryItem,
    pub consolidation: Option<ConsolidationReport>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MemorySnapshot {
    agent_id: String,
    short_term: Vec<MemoryItem>,
    long_term: Vec<LongTermEntry>,
    promoted: Vec<String>,
}

pub struct AgentMemory {
    agent_id: String,
    config: MemoryConfig,
    scorer: ImportanceScorer,
    short_term: ShortTermMemory,
    long_term: LongTermStore,
    episodic: Arc<EpisodicLog>,
    /// 已晋升的短期条目 id
    promoted: HashSet<String>,
    since_consolidation: usize,
}

impl AgentMemory {
    pub fn new(agent_id: impl Into<String>, config: MemoryConfig, episodic: Arc<EpisodicLog>) -> Self {
        Self {
            agent_id: agent_id.into(),
            scorer: ImportanceScorer::new(config.half_life),
            short_term: ShortTermMemory::new(config.short_term_capacity),
            long_term: LongTermStore::new(config.long_term_capacity, config.recency_weight),
            episodic,
            promoted: HashSet::new(),
            since_consolidation: 0,
            config,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn short_term(&self) -> &ShortTermMemory {
        &self.short_term
    }

    pub fn long_term(&self) -> &LongTermStore {
        &self.long_term
    }

    pub fn episodic(&self) -> &Arc<EpisodicLog> {
        &self.episodic
    }

    fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(3650));
        now + retention
    }

    pub fn remember(&mut self, content: &str, kind: MemoryKind, outcome: Option<Outcome>) -> MemoryUpdate {
        self.remember_at(content, kind, outcome, Utc::now())
    }

    /// 计算重要性并写入短期；被挤出的条目若达到阈值则直接晋升，否则记录后修剪
    pub fn remember_at(
        &mut self,
        content: &str,
        kind: MemoryKind,
        outcome: Option<Outcome>,
        now: DateTime<Utc>,
    ) -> MemoryUpdate {
        let content = sanitize(content);
        let item = MemoryItem {
            id: format!("mem_{}", uuid::Uuid::new_v4()),
            key: semantic_key(&content),
            importance: self.scorer.score(&content, now, outcome, now),
            timestamp: now,
            expires_at: self.expiry(now),
            tier: MemoryTier::Short,
            kind,
            outcome,
            content,
        };

        if let Some(evicted) = self.short_term.push(item.clone()) {
            let score = self.scorer.score(&evicted.content, evicted.timestamp, evicted.outcome, now);
            let already_promoted = self.promoted.remove(&evicted.id);
            if !already_promoted
                && !evicted.is_expired(now)
                && score >= self.config.promotion_threshold
            {
                let mut promoted = evicted;
                promoted.importance = score;
                self.long_term.upsert(promoted);
            } else {
                tracing::debug!(agent = %self.agent_id, item = %evicted.id, "short-term item pruned");
            }
        }

        self.since_consolidation += 1;
        let consolidation = if self.config.consolidate_every > 0
            && self.since_consolidation >= self.config.consolidate_every
        {
            Some(self.consolidate_at(now))
        } else {
            None
        };
        MemoryUpdate { item, consolidation }
    }

    /// 追加一条情景记录到共享日志
    pub fn record_episode(
        &self,
        task_id: &str,
        task_type: &str,
        role: &str,
        summary: &str,
        outcome: Outcome,
        duration_ms: u64,
    ) -> Episode {
        let now = Utc::now();
        let episode = Episode {
            id: format!("ep_{}", uuid::Uuid::new_v4()),
            task_id: task_id.to_string(),
            task_type: task_type.to_string(),
            agent_id: self.agent_id.clone(),
            role: role.to_string(),
            summary: sanitize(summary),
            outcome,
            duration_ms,
            timestamp: now,
            expires_at: self.expiry(now),
        };
        self.episodic.append(episode.clone());
        episode
    }

    pub fn consolidate(&mut self) -> ConsolidationReport {
        self.consolidate_at(Utc::now())
    }

    pub fn consolidate_at(&mut self, now: DateTime<Utc>) -> ConsolidationReport {
        self.since_consolidation = 0;
        let mut report = ConsolidationReport::default();

        let candidates: Vec<(f64, MemoryItem)> = self
            .short_term
            .iter()
            .filter(|i| !self.promoted.contains(&i.id) && !i.is_expired(now))
            .map(|i| (self.scorer.score(&i.content, i.timestamp, i.outcome, now), i.clone()))
            .filter(|(score, _)| *score >= self.config.promotion_threshold)
            .collect();
        for (score, mut item) in candidates {
            self.promoted.insert(item.id.clone());
            item.importance = score;
            if self.long_term.upsert(item) {
                report.promoted += 1;
            }
        }
        let live: HashSet<&str> = self.short_term.iter().map(|i| i.id.as_str()).collect();
        self.promoted.retain(|id| live.contains(id.as_str()));

        for pattern in self.episodic.mine_patterns(self.config.pattern_min_support, now) {
            if self.store_pattern_at(&pattern.key(), &pattern.describe(), now) {
                report.patterns += 1;
            }
        }

        if report.promoted > 0 || report.patterns > 0 {
            tracing::debug!(
                agent = %self.agent_id,
                promoted = report.promoted,
                patterns = report.patterns,
                "memory consolidated"
            );
        }
        report
    }

    /// 写入（或更新）一条长期模式条目；返回是否新增
    pub fn store_pattern(&mut self, key: &str, content: &str) -> bool {
        self.store_pattern_at(key, content, Utc::now())
    }

    fn store_pattern_at(&mut self, key: &str, content: &str, now: DateTime<Utc>) -> bool {
        let item = MemoryItem {
            id: format!("mem_{}", uuid::Uuid::new_v4()),
            content: sanitize(content),
            key: key.to_string(),
            importance: PATTERN_IMPORTANCE,
            timestamp: now,
            expires_at: self.expiry(now),
            tier: MemoryTier::Long,
            kind: MemoryKind::Pattern,
            outcome: Some(Outcome::Success),
        };
        self.long_term.upsert(item)
    }

    pub fn retrieve(&mut self, query: &str, tier: Option<MemoryTier>, k: usize) -> Vec<MemoryItem> {
        self.retrieve_at(query, tier, k, Utc::now())
    }

    /// 关键词覆盖率排序检索；tier 为 None 时检索全部层级
    pub fn retrieve_at(
        &mut self,
        query: &str,
        tier: Option<MemoryTier>,
        k: usize,
        now: DateTime<Utc>,
    ) -> Vec<MemoryItem> {
        let q = tokenize_to_set(query);
        if q.is_empty() || k == 0 {
            return Vec::new();
        }
        let wants = |t: MemoryTier| tier.map_or(true, |want| want == t);
        let mut scored: Vec<(f64, MemoryItem)> = Vec::new();

        if wants(MemoryTier::Short) {
            for item in self.short_term.iter().filter(|i| !i.is_expired(now)) {
                let s = coverage(&q, &tokenize_to_set(&item.content));
                if s > 0.0 {
                    scored.push((s, item.clone()));
                }
            }
        }
        if wants(MemoryTier::Long) {
            scored.extend(self.long_term.search(&q, now));
        }
        if wants(MemoryTier::Episodic) {
            for ep in self.episodic.snapshot().into_iter().filter(|e| !e.is_expired(now)) {
                let s = coverage(&q, &tokenize_to_set(&ep.summary));
                if s > 0.0 {
                    scored.push((s, ep.as_item()));
                }
            }
        }

        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| b.1.timestamp.cmp(&a.1.timestamp))
        });
        let mut seen = HashSet::new();
        scored
            .into_iter()
            .filter(|(_, item)| seen.insert(item.key.clone()))
            .take(k)
            .map(|(_, item)| item)
            .collect()
    }

    pub fn purge_expired(&mut self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    /// 删除所有层级的过期条目（情景日志为共享日志，同样清理）
    pub fn purge_expired_at(&mut self, now: DateTime<Utc>) -> usize {
        let removed = self.short_term.purge_expired(now)
            + self.long_term.purge_expired(now)
            + self.episodic.purge_expired(now);
        if removed > 0 {
            tracing::info!(agent = %self.agent_id, removed, "expired memory purged");
        }
        removed
    }

    fn scope(&self) -> String {
        format!("agent:{}", self.agent_id)
    }

    /// 持久化短期与长期层（内容已在写入时脱敏）
    pub async fn persist(&self, store: &dyn MemoryStore) -> Result<(), HiveError> {
        let snapshot = MemorySnapshot {
            agent_id: self.agent_id.clone(),
            short_term: self.short_term.iter().cloned().collect(),
            long_term: self.long_term.entries(),
            promoted: self.promoted.iter().cloned().collect(),
        };
        let blob = serde_json::to_vec(&snapshot)?;
        store.save(&self.scope(), SNAPSHOT_KEY, blob).await
    }

    /// 从存储恢复；无快照时返回 Ok(false)，过期条目不恢复
    pub async fn restore(&mut self, store: &dyn MemoryStore) -> Result<bool, HiveError> {
        let Some(blob) = store.load(&self.scope(), SNAPSHOT_KEY).await? else {
            return Ok(false);
        };
        let snapshot: MemorySnapshot = serde_json::from_slice(&blob)?;
        let now = Utc::now();
        self.short_term.clear();
        for item in snapshot.short_term.into_iter().filter(|i| !i.is_expired(now)) {
            self.short_term.push(item);
        }
        self.long_term.restore(snapshot.long_term, now);
        self.promoted = snapshot.promoted.into_iter().collect();
        tracing::info!(agent = %self.agent_id, short = self.short_term.len(), long = self.long_term.len(), "memory restored");
        Ok(true)
    }
}

/// 持久化共享情景日志
pub async fn persist_episodic(log: &EpisodicLog, store: &dyn MemoryStore) -> Result<(), HiveError> {
    let blob = serde_json::to_vec(&log.snapshot())?;
    store.save(EPISODIC_SCOPE, EPISODIC_KEY, blob).await
}

pub async fn restore_episodic(log: &EpisodicLog, store: &dyn MemoryStore) -> Result<bool, HiveError> {
    let Some(blob) = store.load(EPISODIC_SCOPE, EPISODIC_KEY).await? else {
        return Ok(false);
    };
    let episodes: Vec<Episode> = serde_json::from_slice(&blob)?;
    log.restore(episodes, Utc::now());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use std::time::Duration;

    fn config() -> MemoryConfig {
        MemoryConfig {
            short_term_capacity: 4,
            long_term_capacity: 16,
            episodic_capacity: 16,
            half_life: Duration::from_secs(3600),
            promotion_threshold: 0.6,
            pattern_min_support: 2,
            retention: Duration::from_secs(3600),
            consolidate_every: 0,
            recency_weight: 0.5,
        }
    }

    fn memory() -> AgentMemory {
        AgentMemory::new("writer-1", config(), Arc::new(EpisodicLog::new(16)))
    }

    #[test]
    fn test_consolidate_is_idempotent() {
        let mut mem = memory();
        mem.remember("we decided to use a formal tone", MemoryKind::Action, Some(Outcome::Success));
        mem.remember("weather was cloudy", MemoryKind::Observation, None);

        let first = mem.consolidate();
        assert_eq!(first.promoted, 1);
        let len = mem.long_term().len();

        let second = mem.consolidate();
        assert_eq!(second, ConsolidationReport::default());
        assert_eq!(mem.long_term().len(), len);

        // 同义改写落到同一语义键，不产生重复
        mem.remember("formal tone: we decided to use", MemoryKind::Action, Some(Outcome::Success));
        assert_eq!(mem.consolidate().promoted, 0);
        assert_eq!(mem.long_term().len(), len);
    }

    #[test]
    fn test_patterns_written_once_support_reached() {
        let mut mem = memory();
        mem.record_episode("t1", "blog", "writer", "drafted launch post", Outcome::Success, 10);
        assert_eq!(mem.consolidate().patterns, 0);
        mem.record_episode("t2", "blog", "writer", "drafted launch recap", Outcome::Success, 12);
        assert_eq!(mem.consolidate().patterns, 1);
        assert_eq!(mem.consolidate().patterns, 0);
        let hits = mem.retrieve("pattern blog", Some(MemoryTier::Long), 5);
        assert_eq!(hits[0].kind, MemoryKind::Pattern);
    }

    #[test]
    fn test_retrieve_ranks_by_similarity_then_recency() {
        let mut mem = memory();
        let now = Utc::now();
        mem.remember_at("rust async runtime notes", MemoryKind::Observation, None, now - chrono::Duration::seconds(20));
        mem.remember_at("rust notes", MemoryKind::Observation, None, now - chrono::Duration::seconds(10));
        mem.remember_at("rust notes again", MemoryKind::Observation, None, now);

        let hits = mem.retrieve_at("rust async runtime", Some(MemoryTier::Short), 3, now);
        assert_eq!(hits[0].content, "rust async runtime notes");
        // 两条覆盖率相同，较新的排前
        assert_eq!(hits[1].content, "rust notes again");
        assert_eq!(hits[2].content, "rust notes");
    }

    #[test]
    fn test_expired_items_never_served() {
        let mut mem = memory();
        let now = Utc::now();
        mem.remember_at("quarterly budget draft", MemoryKind::Observation, None, now);
        let later = now + chrono::Duration::hours(2);
        assert!(mem.retrieve_at("budget", None, 5, later).is_empty());
        assert_eq!(mem.purge_expired_at(later), 1);
        assert!(mem.short_term().is_empty());
    }

    #[test]
    fn test_content_sanitized_on_ingest() {
        let mut mem = memory();
        let update = mem.remember("client email is bob@corp.io", MemoryKind::Observation, None);
        assert_eq!(update.item.content, "client email is [EMAIL]");
    }

    #[test]
    fn test_evicted_important_item_is_promoted() {
        let mut mem = memory();
        mem.remember("we decided the launch date", MemoryKind::Action, Some(Outcome::Success));
        for n in 0..4 {
            mem.remember(&format!("filler {n}"), MemoryKind::Observation, None);
        }
        assert_eq!(mem.short_term().len(), 4);
        assert_eq!(mem.long_term().len(), 1);
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let store = InMemoryStore::new();
        let mut mem = memory();
        mem.remember("we decided to ship on friday", MemoryKind::Action, Some(Outcome::Success));
        mem.consolidate();
        mem.persist(&store).await.unwrap();

        let mut restored = memory();
        assert!(restored.restore(&store).await.unwrap());
        assert_eq!(restored.short_term().len(), 1);
        assert_eq!(restored.long_term().len(), 1);
        assert_eq!(restored.consolidate().promoted, 0);

        let mut fresh = AgentMemory::new("other", config(), Arc::new(EpisodicLog::new(4)));
        assert!(!fresh.restore(&store).await.unwrap());
    }

    #[tokio::test]
    async fn test_episodic_log_round_trip() {
        let store = InMemoryStore::new();
        let mem = memory();
        mem.record_episode("t1", "blog", "writer", "wrote intro", Outcome::Success, 5);
        persist_episodic(mem.episodic(), &store).await.unwrap();

        let log = EpisodicLog::new(8);
        assert!(restore_episodic(&log, &store).await.unwrap());
        assert_eq!(log.len(), 1);
    }
}
