//! 隐私脱敏：持久化之前屏蔽结构化身份标识
//!
//! 邮箱 → `[EMAIL]`；18 位身份证号 → `[ID]`；13-19 位卡号 → `[CARD]`；10-12 位电话 → `[PHONE]`。
//! 数字串先整体匹配（允许空格与连字符分隔），再按位数分类。

use std::sync::OnceLock;

use regex::{Captures, Regex};

static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
static NUMBER_RUN_RE: OnceLock<Regex> = OnceLock::new();
static DATE_RE: OnceLock<Regex> = OnceLock::new();

fn email_re() -> &'static Regex {
    EMAIL_RE.get_or_init(|| Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap())
}

fn number_run_re() -> &'static Regex {
    NUMBER_RUN_RE.get_or_init(|| Regex::new(r"\+?\(?\d[\d\s\-()]{5,}[\dXx]").unwrap())
}

fn date_re() -> &'static Regex {
    DATE_RE.get_or_init(|| Regex::new(r"^\d{4}-\d{1,2}-\d{1,2}$").unwrap())
}

pub fn sanitize(text: &str) -> String {
    let masked = email_re().replace_all(text, "[EMAIL]");
    number_run_re()
        .replace_all(&masked, |caps: &Captures| classify_run(&caps[0]))
        .into_owned()
}

fn classify_run(run: &str) -> String {
    let trimmed = run.trim();
    if date_re().is_match(trimmed) {
        return run.to_string();
    }
    let digits = trimmed.chars().filter(char::is_ascii_digit).count();
    let ends_with_x = trimmed.ends_with(['X', 'x']);
    let separated = trimmed.chars().any(|c| !c.is_ascii_alphanumeric());

    if !separated && digits + usize::from(ends_with_x) == 18 && looks_like_id(trimmed) {
        return "[ID]".to_string();
    }
    if ends_with_x {
        return run.to_string();
    }
    match digits {
        13..=19 => "[CARD]".to_string(),
        10..=12 => "[PHONE]".to_string(),
        _ => run.to_string(),
    }
}

/// 18 位身份证：第 7-10 位为 19xx / 20xx 出生年份
fn looks_like_id(s: &str) -> bool {
    matches!(s.get(6..8), Some("19") | Some("20"))
}
