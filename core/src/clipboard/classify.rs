//! Content classification and change significance.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)(https?://|ftp://|www\.)[^\s/$.?#][^\s]*$").expect("url regex")
});

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").expect("email regex")
});

static CODE_KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)(\b(function|const|let|var|class|def|import|return|fn|impl|struct|enum|public|private|async|await)\b|#include|=>|::)",
    )
    .expect("code regex")
});

const LONG_TEXT_THRESHOLD: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    Text,
    Url,
    Email,
    Code,
    ShortText,
    LongText,
    Empty,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Url => "url",
            Self::Email => "email",
            Self::Code => "code",
            Self::ShortText => "short-text",
            Self::LongText => "long-text",
            Self::Empty => "empty",
        }
    }
}

/// Fixed-order heuristic: url, email, code, long text, short text.
pub fn classify(text: &str) -> ContentType {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ContentType::Empty;
    }
    if URL_RE.is_match(trimmed) {
        return ContentType::Url;
    }
    if EMAIL_RE.is_match(trimmed) {
        return ContentType::Email;
    }
    if looks_like_code(trimmed) {
        return ContentType::Code;
    }
    let len = trimmed.chars().count();
    if len > LONG_TEXT_THRESHOLD {
        if trimmed.contains('.') {
            ContentType::LongText
        } else {
            ContentType::Text
        }
    } else {
        ContentType::ShortText
    }
}

fn looks_like_code(text: &str) -> bool {
    if CODE_KEYWORD_RE.is_match(text) {
        return true;
    }
    let balanced_braces = text.contains('{') && text.contains('}');
    let statement_ends = text.lines().filter(|l| l.trim_end().ends_with(';')).count();
    balanced_braces || statement_ends >= 2
}

/// How the monitor decides whether a change deserves AI processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignificancePolicy {
    /// Every accepted change is significant.
    #[default]
    Always,
    /// Only empty-previous, large length swings or a type change count.
    Heuristic,
}

pub fn is_significant(previous: &str, new: &str, policy: SignificancePolicy) -> bool {
    match policy {
        SignificancePolicy::Always => true,
        SignificancePolicy::Heuristic => heuristic_significance(previous, new),
    }
}

fn heuristic_significance(previous: &str, new: &str) -> bool {
    if previous.is_empty() {
        return true;
    }
    let old_len = previous.chars().count() as f64;
    let new_len = new.chars().count() as f64;
    let average = (old_len + new_len) / 2.0;
    if average > 0.0 && (new_len - old_len).abs() > average * 0.5 {
        return true;
    }
    classify(previous) != classify(new)
}
