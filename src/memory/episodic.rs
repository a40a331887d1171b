//! 情景记忆：完整任务执行的追加日志，多 agent 共享
//!
//! 追加在锁内完成，条目写入后不再修改；超过容量 M 时 FIFO 淘汰。
//! `mine_patterns` 按任务类型分组，支持度达到下限时产出模式。

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::tokenizer::tokenize_to_set;
use crate::memory::{Episode, Outcome};

/// 从情景日志中归纳出的模式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub task_type: String,
    pub support: usize,
    pub success_rate: f64,
    /// 至少一半情景中出现的词（最多 8 个，按出现次数排序）
    pub common_terms: Vec<String>,
}

impl Pattern {
    pub fn key(&self) -> String {
        format!("pattern:{}", self.task_type)
    }

    pub fn describe(&self) -> String {
        format!(
            "pattern for {}: support={} success_rate={:.2} terms=[{}]",
            self.task_type,
            self.support,
            self.success_rate,
            self.common_terms.join(", ")
        )
    }
}

#[derive(Debug)]
pub struct EpisodicLog {
    capacity: usize,
    entries: Mutex<VecDeque<Episode>>,
}

impl EpisodicLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Episode>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, episode: Episode) {
        let mut entries = self.lock();
        if entries.len() == self.capacity {
            if let Some(old) = entries.pop_front() {
                tracing::debug!(episode = %old.id, "episodic log full, oldest episode evicted");
            }
        }
        entries.push_back(episode);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Episode> {
        self.lock().iter().cloned().collect()
    }

    /// 某 agent 参与的情景
    pub fn by_agent(&self, agent_id: &str) -> Vec<Episode> {
        self.lock()
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| !e.is_expired(now));
        before - entries.len()
    }

    /// 按任务类型分组挖掘模式（只统计未过期情景）
    pub fn mine_patterns(&self, min_support: usize, now: DateTime<Utc>) -> Vec<Pattern> {
        let entries = self.lock();
        let mut groups: BTreeMap<&str, Vec<&Episode>> = BTreeMap::new();
        for e in entries.iter().filter(|e| !e.is_expired(now)) {
            groups.entry(e.task_type.as_str()).or_default().push(e);
        }

        groups
            .into_iter()
            .filter(|(_, eps)| eps.len() >= min_support.max(1))
            .map(|(task_type, eps)| {
                let support = eps.len();
                let successes = eps.iter().filter(|e| e.outcome == Outcome::Success).count();
                let mut term_counts: HashMap<String, usize> = HashMap::new();
                for e in &eps {
                    let terms: HashSet<String> = tokenize_to_set(&e.summary);
                    for t in terms {
                        *term_counts.entry(t).or_default() += 1;
                    }
                }
                let mut common: Vec<(String, usize)> = term_counts
                    .into_iter()
                    .filter(|(_, n)| n * 2 >= support)
                    .collect();
                common.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                Pattern {
                    task_type: task_type.to_string(),
                    support,
                    success_rate: successes as f64 / support as f64,
                    common_terms: common.into_iter().take(8).map(|(t, _)| t).collect(),
                }
            })
            .collect()
    }

    /// 从持久化快照恢复（过期与超出容量的旧条目丢弃）
    pub fn restore(&self, episodes: Vec<Episode>, now: DateTime<Utc>) {
        let mut entries = self.lock();
        entries.clear();
        for e in episodes.into_iter().filter(|e| !e.is_expired(now)) {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn episode(n: usize, task_type: &str, outcome: Outcome) -> Episode {
        let now = Utc::now();
        Episode {
            id: format!("ep{n}"),
            task_id: format!("task{n}"),
            task_type: task_type.to_string(),
            agent_id: "writer-1".into(),
            role: "writer".into(),
            summary: format!("drafted blog post about rust release {n}"),
            outcome,
            duration_ms: 10,
            timestamp: now,
            expires_at: now + chrono::Duration::hours(1),
        }
    }

    #[test]
    fn test_fifo_cap() {
        let log = EpisodicLog::new(2);
        for n in 0..3 {
            log.append(episode(n, "blog", Outcome::Success));
        }
        let ids: Vec<_> = log.snapshot().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["ep1", "ep2"]);
    }

    #[test]
    fn test_mine_patterns_respects_min_support() {
        let log = EpisodicLog::new(16);
        log.append(episode(1, "blog", Outcome::Success));
        log.append(episode(2, "blog", Outcome::Success));
        log.append(episode(3, "blog", Outcome::Failure));
        log.append(episode(4, "video", Outcome::Success));

        let patterns = log.mine_patterns(3, Utc::now());
        assert_eq!(patterns.len(), 1);
        let p = &patterns[0];
        assert_eq!(p.task_type, "blog");
        assert_eq!(p.support, 3);
        assert!((p.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(p.common_terms.contains(&"rust".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_all_kept() {
        let log = Arc::new(EpisodicLog::new(128));
        let mut handles = Vec::new();
        for n in 0..32 {
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                log.append(episode(n, "blog", Outcome::Success));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(log.len(), 32);
    }
}
