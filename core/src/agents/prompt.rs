//! Clipboard text clean-up and prompt templates.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::clipboard::ContentType;

static PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(?:[A-Za-z]:[\\/]|\\\\|~?/)[^\s<>|"]*$"#).expect("path regex")
});

/// Lines longer than this count as abnormal.
const LONG_LINE_CHARS: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContentRejection {
    #[error("clipboard text is empty after clean-up")]
    Empty,
    #[error("clipboard holds binary data")]
    BinaryContent,
    #[error("clipboard holds a filesystem path")]
    FilesystemPath,
    #[error("clipboard text is dominated by abnormally long lines")]
    OverlongLines,
}

/// Normalise raw clipboard text, or refuse it.
///
/// Strips NUL bytes, converts line endings to `\n`, trims every line and
/// collapses runs of blank lines to a single one.
pub fn sanitize(raw: &str) -> Result<String, ContentRejection> {
    let text = raw.replace('\0', "").replace("\r\n", "\n").replace('\r', "\n");
    if has_binary_markers(&text) {
        return Err(ContentRejection::BinaryContent);
    }

    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    let out = out.trim().to_string();

    if out.is_empty() {
        return Err(ContentRejection::Empty);
    }
    if !out.contains('\n') && PATH_RE.is_match(&out) {
        return Err(ContentRejection::FilesystemPath);
    }
    if dominated_by_long_lines(&out) {
        return Err(ContentRejection::OverlongLines);
    }
    Ok(out)
}

fn has_binary_markers(text: &str) -> bool {
    text.chars()
        .any(|c| c == '\u{FFFD}' || (c.is_control() && !matches!(c, '\n' | '\t')))
}

fn dominated_by_long_lines(text: &str) -> bool {
    let total = text.chars().count();
    let long: usize = text
        .lines()
        .map(|line| line.chars().count())
        .filter(|len| *len > LONG_LINE_CHARS)
        .sum();
    long * 2 > total
}

/// Template chosen purely by content type.
pub fn build_prompt(content_type: ContentType, text: &str) -> String {
    let instruction = match content_type {
        ContentType::Code => "Analyze the following code and suggest improvements:",
        ContentType::Url => "Describe what this link might contain:",
        ContentType::Email => "Give a brief analysis of this email address:",
        _ => "Summarize the following text:",
    };
    format!("{instruction}\n\n{text}")
}
