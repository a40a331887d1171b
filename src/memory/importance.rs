//! 重要性评分
//!
//! importance = base × 0.5^(age / half_life) × 关键词乘子 × 结果权重，截断到 [0,1]。
//! 身份类标记 ×1.5，决策/动作类标记 ×1.3（两者可叠加）；成功 ×1.0，失败 ×0.7，无结果 ×0.85。

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::memory::Outcome;

const BASE: f64 = 0.5;
const IDENTITY_MULTIPLIER: f64 = 1.5;
const DECISION_MULTIPLIER: f64 = 1.3;

const IDENTITY_MARKERS: &[&str] = &[
    "my name", "i am", "identity", "prefer", "preference", "always", "never", "我是", "我叫", "名字",
    "偏好", "喜欢",
];

const DECISION_MARKERS: &[&str] = &[
    "decide", "decision", "chose", "choose", "selected", "approved", "will use", "agreed",
    "决定", "选择", "采用", "同意",
];

#[derive(Debug, Clone)]
pub struct ImportanceScorer {
    half_life: Duration,
}

impl ImportanceScorer {
    pub fn new(half_life: Duration) -> Self {
        Self { half_life }
    }

    /// 关键词乘子（不含衰减）
    pub fn marker_multiplier(content: &str) -> f64 {
        let lower = content.to_lowercase();
        let mut m = 1.0;
        if IDENTITY_MARKERS.iter().any(|k| lower.contains(k)) {
            m *= IDENTITY_MULTIPLIER;
        }
        if DECISION_MARKERS.iter().any(|k| lower.contains(k)) {
            m *= DECISION_MULTIPLIER;
        }
        m
    }

    pub fn outcome_weight(outcome: Option<Outcome>) -> f64 {
        match outcome {
            Some(Outcome::Success) => 1.0,
            Some(Outcome::Failure) => 0.7,
            None => 0.85,
        }
    }

    /// 指数衰减因子；未来时间戳按 age=0 处理
    pub fn decay(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age = (now - timestamp).num_milliseconds().max(0) as f64 / 1000.0;
        let half_life = self.half_life.as_secs_f64();
        if half_life <= 0.0 {
            return 1.0;
        }
        0.5_f64.powf(age / half_life)
    }

    pub fn score(
        &self,
        content: &str,
        timestamp: DateTime<Utc>,
        outcome: Option<Outcome>,
        now: DateTime<Utc>,
    ) -> f64 {
        let raw = BASE
            * self.decay(timestamp, now)
            * Self::marker_multiplier(content)
            * Self::outcome_weight(outcome);
        raw.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> ImportanceScorer {
        ImportanceScorer::new(Duration::from_secs(3600))
    }

    #[test]
    fn test_half_life_halves_score() {
        let now = Utc::now();
        let s = scorer();
        let fresh = s.score("plain note", now, Some(Outcome::Success), now);
        let hour_old = s.score(
            "plain note",
            now - chrono::Duration::hours(1),
            Some(Outcome::Success),
            now,
        );
        assert!((fresh - 0.5).abs() < 1e-9);
        assert!((hour_old - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_markers_and_outcome_ordering() {
        let now = Utc::now();
        let s = scorer();
        let decision = s.score("we decided to use tokio", now, Some(Outcome::Success), now);
        let identity = s.score("my name is Ada", now, None, now);
        let failed = s.score("we decided to use tokio", now, Some(Outcome::Failure), now);
        assert!((decision - 0.65).abs() < 1e-9);
        assert!(identity > 0.6);
        assert!(failed < decision);
        let both = s.score("I am the one who decided", now, Some(Outcome::Success), now);
        assert!(both <= 1.0);
    }
}
