//! Log scraping of worker transcripts.
//!
//! Recognizes file-modification and error lines so the status record can
//! show what a worker touched. Purely informational; unmatched lines are
//! ignored.

use std::sync::LazyLock;

use regex::Regex;

const MAX_ERROR_LEN: usize = 200;

static FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)^\s*(?:[-*>]\s*)?(?:modified|created|edited|updated|wrote|writing|deleted)(?:\s+file)?:?\s+[`'"]?([\w./-]+\.\w+)[`'"]?"#,
    )
    .expect("file pattern should compile")
});

static ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:error|fatal|panic(?:ked)?)(?:\[\w+\])?[:\s]")
        .expect("error pattern should compile")
});

/// Something recognizable in a transcript line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    FileModified(String),
    Error(String),
}

pub fn scan_line(line: &str) -> Option<Finding> {
    if let Some(caps) = FILE_RE.captures(line)
        && let Some(path) = caps.get(1)
    {
        return Some(Finding::FileModified(path.as_str().to_string()));
    }
    if ERROR_RE.is_match(line) {
        return Some(Finding::Error(truncate(line.trim(), MAX_ERROR_LEN)));
    }
    None
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
