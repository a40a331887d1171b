//! 长期记忆：按语义键存储的有界 KV，混合 LRU/LFU 淘汰
//!
//! 同一语义键重复写入只更新已有条目（幂等）；容量满时淘汰
//! `recency_weight × 新近度 + (1 - recency_weight) × 频度` 最低的条目。

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::tokenizer::{coverage, tokenize_to_set};
use crate::memory::{MemoryItem, MemoryTier};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongTermEntry {
    pub item: MemoryItem,
    pub hits: u64,
    /// 最近一次访问的逻辑时钟
    pub last_access: u64,
}

#[derive(Debug, Clone)]
pub struct LongTermStore {
    capacity: usize,
    recency_weight: f64,
    entries: HashMap<String, LongTermEntry>,
    clock: u64,
}

impl LongTermStore {
    pub fn new(capacity: usize, recency_weight: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            recency_weight: recency_weight.clamp(0.0, 1.0),
            entries: HashMap::new(),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// 写入或更新；返回 true 表示新增了键
    pub fn upsert(&mut self, mut item: MemoryItem) -> bool {
        item.tier = MemoryTier::Long;
        let now = self.tick();
        if let Some(entry) = self.entries.get_mut(&item.key) {
            if item.timestamp >= entry.item.timestamp {
                entry.item.content = item.content;
                entry.item.timestamp = item.timestamp;
                entry.item.expires_at = item.expires_at;
                entry.item.outcome = item.outcome.or(entry.item.outcome);
            }
            entry.item.importance = entry.item.importance.max(item.importance);
            entry.last_access = now;
            return false;
        }
        if self.entries.len() >= self.capacity {
            self.evict_one();
        }
        self.entries.insert(
            item.key.clone(),
            LongTermEntry {
                item,
                hits: 0,
                last_access: now,
            },
        );
        true
    }

    fn evict_one(&mut self) {
        let max_hits = self.entries.values().map(|e| e.hits).max().unwrap_or(0).max(1) as f64;
        let clock = self.clock.max(1) as f64;
        let w = self.recency_weight;
        let victim = self
            .entries
            .iter()
            .map(|(k, e)| {
                let score = w * (e.last_access as f64 / clock) + (1.0 - w) * (e.hits as f64 / max_hits);
                (k.clone(), score, e.last_access)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.2.cmp(&b.2)));
        if let Some((key, _, _)) = victim {
            tracing::debug!(key = %key, "long-term memory evicted");
            self.entries.remove(&key);
        }
    }

    /// 读取并记一次访问
    pub fn get(&mut self, key: &str) -> Option<&MemoryItem> {
        let now = self.tick();
        self.entries.get_mut(key).map(|e| {
            e.hits += 1;
            e.last_access = now;
            &e.item
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// 按关键词覆盖率检索未过期条目，命中条目计一次访问
    pub fn search(
        &mut self,
        query: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Vec<(f64, MemoryItem)> {
        let tick = self.tick();
        let mut hits = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.item.is_expired(now) {
                continue;
            }
            let score = coverage(query, &tokenize_to_set(&entry.item.content));
            if score > 0.0 {
                entry.hits += 1;
                entry.last_access = tick;
                hits.push((score, entry.item.clone()));
            }
        }
        hits
    }

    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.item.is_expired(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn items(&self) -> Vec<MemoryItem> {
        let mut items: Vec<MemoryItem> = self.entries.values().map(|e| e.item.clone()).collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        items
    }

    pub fn entries(&self) -> Vec<LongTermEntry> {
        let mut entries: Vec<LongTermEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.item.key.cmp(&b.item.key));
        entries
    }

    /// 从快照恢复（跳过已过期条目）
    pub fn restore(&mut self, entries: Vec<LongTermEntry>, now: DateTime<Utc>) {
        self.entries.clear();
        for entry in entries {
            if entry.item.is_expired(now) {
                continue;
            }
            self.clock = self.clock.max(entry.last_access);
            self.entries.insert(entry.item.key.clone(), entry);
        }
        while self.entries.len() > self.capacity {
            self.evict_one();
        }
    }
}
