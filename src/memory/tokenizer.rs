//! 分词与关键词相似度
//!
//! 中英文混合分词：包含 CJK 字符时用 jieba（搜索引擎模式），否则按非字母数字切分。
//! 记忆的语义键、检索打分、质量门的相关性评估都基于这里的词集合。

use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;

use jieba_rs::Jieba;

/// 全局 Jieba 实例（延迟初始化）
static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "are", "was", "were", "into", "of", "to",
    "in", "on", "an", "is", "it", "be", "as", "at", "by", "or", "的", "了", "和", "是", "在",
];

/// 判断字符是否为 CJK（中日韩）字符
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

fn keep(token: &str) -> bool {
    let first = token.chars().next().unwrap_or(' ');
    let meaningful = token.chars().count() > 1 || is_cjk(first);
    meaningful
        && token.chars().any(|c| c.is_alphanumeric())
        && !STOPWORDS.contains(&token)
}

/// 分词（小写、去停用词、去标点）
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| keep(s))
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric() && c != '_')
            .map(|s| s.to_lowercase())
            .filter(|s| keep(s))
            .collect()
    }
}

pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// 语义键：排序去重后的前 8 个词，用 `|` 连接；同义改写的文本落到同一键上
pub fn semantic_key(text: &str) -> String {
    let terms: BTreeSet<String> = tokenize(text).into_iter().collect();
    if terms.is_empty() {
        return text.trim().to_lowercase();
    }
    terms.into_iter().take(8).collect::<Vec<_>>().join("|")
}

/// 查询覆盖率：query 中有多少比例的词出现在文档里，[0,1]
pub fn coverage(query: &HashSet<String>, doc: &HashSet<String>) -> f64 {
    if query.is_empty() || doc.is_empty() {
        return 0.0;
    }
    query.intersection(doc).count() as f64 / query.len() as f64
}

/// Jaccard 相似度
pub fn jaccard_similarity(set1: &HashSet<String>, set2: &HashSet<String>) -> f64 {
    if set1.is_empty() || set2.is_empty() {
        return 0.0;
    }
    let intersection = set1.intersection(set2).count() as f64;
    let union = set1.union(set2).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_chinese() {
        let tokens = tokenize("我喜欢编程和人工智能");
        assert!(tokens.iter().any(|t| t.contains("编程") || t.contains("人工") || t.contains("智能")));
    }

    #[test]
    fn test_tokenize_english_strips_punctuation_and_stopwords() {
        let tokens = tokenize("The launch-plan, for Q3!");
        assert_eq!(tokens, vec!["launch", "plan", "q3"]);
    }

    #[test]
    fn test_semantic_key_is_order_insensitive() {
        assert_eq!(
            semantic_key("user prefers dark mode"),
            semantic_key("Dark mode: user prefers")
        );
        assert_ne!(semantic_key("dark mode"), semantic_key("light mode"));
    }

    #[test]
    fn test_coverage_and_jaccard() {
        let q = tokenize_to_set("rust async runtime");
        let d = tokenize_to_set("the tokio runtime for async rust code");
        assert!((coverage(&q, &d) - 1.0).abs() < 1e-9);
        assert!(jaccard_similarity(&q, &d) < 1.0);
        assert_eq!(coverage(&q, &HashSet::new()), 0.0);
    }

    #[test]
    fn test_contains_cjk() {
        assert!(contains_cjk("Hello 世界"));
        assert!(!contains_cjk("Hello World"));
    }
}
