//! 质量维度评估器：纯函数 content → [0,1]

use std::collections::HashSet;

use crate::memory::tokenizer::{tokenize, tokenize_to_set};

pub trait DimensionEvaluator: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, content: &str) -> f64;

    /// 不达标时给修订方的建议
    fn suggestion(&self, content: &str) -> String;
}

/// 相关性：brief 关键词在内容中的覆盖率；没有关键词时视为满分
#[derive(Debug, Clone)]
pub struct Relevance {
    keywords: Vec<String>,
}

impl Relevance {
    pub fn new(keywords: Vec<String>) -> Self {
        Self { keywords }
    }

    fn missing(&self, content: &str) -> Vec<&str> {
        let tokens = tokenize_to_set(content);
        self.keywords
            .iter()
            .filter(|k| {
                let parts = tokenize(k);
                !parts.is_empty() && !parts.iter().all(|p| tokens.contains(p))
            })
            .map(String::as_str)
            .collect()
    }

    fn counted(&self) -> usize {
        self.keywords.iter().filter(|k| !tokenize(k).is_empty()).count()
    }
}

impl DimensionEvaluator for Relevance {
    fn name(&self) -> &str {
        "relevance"
    }

    fn score(&self, content: &str) -> f64 {
        let total = self.counted();
        if total == 0 {
            return 1.0;
        }
        1.0 - self.missing(content).len() as f64 / total as f64
    }

    fn suggestion(&self, content: &str) -> String {
        format!("address the brief keywords: {}", self.missing(content).join(", "))
    }
}

/// 可读性：平均句长（词数）落在区间内得满分，区间外按比例衰减
#[derive(Debug, Clone)]
pub struct Readability {
    min_words: f64,
    max_words: f64,
}

impl Default for Readability {
    fn default() -> Self {
        Self {
            min_words: 8.0,
            max_words: 25.0,
        }
    }
}

impl Readability {
    pub fn new(min_words: f64, max_words: f64) -> Self {
        Self {
            min_words: min_words.max(1.0),
            max_words: max_words.max(min_words.max(1.0)),
        }
    }

    fn mean_sentence_length(content: &str) -> Option<f64> {
        let lengths: Vec<usize> = content
            .split(['.', '!', '?', '。', '！', '？', '\n'])
            .map(|s| s.split_whitespace().count())
            .filter(|&n| n > 0)
            .collect();
        if lengths.is_empty() {
            return None;
        }
        Some(lengths.iter().sum::<usize>() as f64 / lengths.len() as f64)
    }
}

impl DimensionEvaluator for Readability {
    fn name(&self) -> &str {
        "readability"
    }

    fn score(&self, content: &str) -> f64 {
        match Self::mean_sentence_length(content) {
            None => 0.0,
            Some(m) if m < self.min_words => m / self.min_words,
            Some(m) if m > self.max_words => self.max_words / m,
            Some(_) => 1.0,
        }
    }

    fn suggestion(&self, content: &str) -> String {
        match Self::mean_sentence_length(content) {
            Some(m) if m > self.max_words => {
                format!("split long sentences (mean {m:.0} words, aim for at most {:.0})", self.max_words)
            }
            Some(m) => format!("develop fragments into full sentences (mean {m:.0} words)"),
            None => "write complete sentences".to_string(),
        }
    }
}

/// 完整性：字符数相对目标长度
#[derive(Debug, Clone)]
pub struct Completeness {
    target_length: usize,
}

impl Completeness {
    pub fn new(target_length: usize) -> Self {
        Self {
            target_length: target_length.max(1),
        }
    }
}

impl DimensionEvaluator for Completeness {
    fn name(&self) -> &str {
        "completeness"
    }

    fn score(&self, content: &str) -> f64 {
        (content.chars().count() as f64 / self.target_length as f64).min(1.0)
    }

    fn suggestion(&self, content: &str) -> String {
        format!(
            "expand the draft from {} to about {} characters",
            content.chars().count(),
            self.target_length
        )
    }
}

type ScoreFn = Box<dyn Fn(&str) -> f64 + Send + Sync>;

/// 闭包评估器，用于自定义维度
pub struct FnEvaluator {
    name: String,
    fix: String,
    f: ScoreFn,
}

impl FnEvaluator {
    pub fn new(
        name: impl Into<String>,
        fix: impl Into<String>,
        f: impl Fn(&str) -> f64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            fix: fix.into(),
            f: Box::new(f),
        }
    }

    /// 固定分数
    pub fn constant(name: impl Into<String>, score: f64) -> Self {
        let name = name.into();
        let fix = format!("improve {name}");
        Self::new(name, fix, move |_| score)
    }
}

impl DimensionEvaluator for FnEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, content: &str) -> f64 {
        (self.f)(content).clamp(0.0, 1.0)
    }

    fn suggestion(&self, _content: &str) -> String {
        self.fix.clone()
    }
}

/// 关键词去重（小写）
pub(crate) fn dedup_keywords(keywords: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    keywords
        .iter()
        .filter(|k| seen.insert(k.to_lowercase()))
        .cloned()
        .collect()
}
