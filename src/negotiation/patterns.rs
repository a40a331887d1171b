//! 成功协商模式库
//!
//! 每次达成共识的会话记录一条特征（提案属性、轮数、各参与者灵活度）。
//! `suggested_flexibility` 以 1/轮数 为权重汇总同类任务的历史灵活度，轮数越少的会话权重越高。

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub task_type: String,
    pub strategy: String,
    pub proposal_length: usize,
    pub concerns_resolved: usize,
    pub rounds: usize,
    pub final_score: f64,
    /// 参与者 → 协商时的灵活度
    pub flexibility: BTreeMap<String, f64>,
    pub recorded_at: DateTime<Utc>,
}

impl FeatureRecord {
    pub fn mean_flexibility(&self) -> f64 {
        if self.flexibility.is_empty() {
            return 0.5;
        }
        self.flexibility.values().sum::<f64>() / self.flexibility.len() as f64
    }

    /// 写入参与者长期记忆的描述
    pub fn describe(&self) -> String {
        format!(
            "negotiation pattern for {}: strategy={} rounds={} score={:.2} concerns_resolved={} mean_flexibility={:.2}",
            self.task_type,
            self.strategy,
            self.rounds,
            self.final_score,
            self.concerns_resolved,
            self.mean_flexibility()
        )
    }

    pub fn memory_key(&self) -> String {
        format!("negotiation:{}", self.task_type)
    }
}

#[derive(Debug)]
pub struct SuccessPatternStore {
    capacity: usize,
    records: Mutex<Vec<FeatureRecord>>,
}

impl Default for SuccessPatternStore {
    fn default() -> Self {
        Self::new(512)
    }
}

impl SuccessPatternStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, record: FeatureRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() == self.capacity {
            records.remove(0);
        }
        records.push(record);
    }

    pub fn records_for(&self, task_type: &str) -> Vec<FeatureRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.task_type == task_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 同类任务历史上的推荐灵活度；无记录时返回 None
    pub fn suggested_flexibility(&self, task_type: &str) -> Option<f64> {
        let records = self.records_for(task_type);
        if records.is_empty() {
            return None;
        }
        let (weighted, total) = records.iter().fold((0.0, 0.0), |(acc, w), r| {
            let weight = 1.0 / r.rounds.max(1) as f64;
            (acc + weight * r.mean_flexibility(), w + weight)
        });
        Some((weighted / total).clamp(0.0, 1.0))
    }
}
