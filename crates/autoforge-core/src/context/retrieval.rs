//! Retrieval result types and goal-analysis helpers.

use serde::{Deserialize, Serialize};

/// Rough token estimate: one token per four characters of content.
pub fn estimate_tokens(content: &str) -> u64 {
    (content.len() / 4) as u64
}

/// A file emitted in a retrieval bundle.
///
/// Files above the budget cut carry full `content`; the first overflowing
/// file carries only its hit `ranges`; everything after that is path + hash
/// only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedFile {
    pub path: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// 1-based inclusive line ranges containing goal-term hits.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<(usize, usize)>,
    /// Estimated token cost of the emitted content (0 for path-only entries).
    pub estimated_tokens: u64,
}

/// A symbol surfaced because its name matched a goal term.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolHit {
    pub name: String,
    pub kind: String,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// A budget-bounded context bundle for one goal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub files: Vec<RetrievedFile>,
    pub symbols: Vec<SymbolHit>,
    pub imports: Vec<String>,
    pub tests: Vec<String>,
    pub configs: Vec<String>,
    pub guides: Vec<String>,
    /// Sum of the estimated costs of emitted file contents.
    pub token_count: u64,
}

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "been",
];

/// Lower-cased goal tokens of length >= 3 minus a small stop-word set.
pub fn extract_key_terms(goal: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut current = String::new();
    for ch in goal.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            current.push(ch.to_ascii_lowercase());
        } else if !current.is_empty() {
            terms.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        terms.push(current);
    }
    terms
        .into_iter()
        .filter(|t| t.len() > 2 && !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// File-like tokens mentioned in the goal: quoted filenames, dotted names,
/// and `file/module/class X` references.
pub fn extract_file_mentions(goal: &str) -> Vec<String> {
    let patterns = [
        r#"['"`]([^'"`]+\.\w+)['"`]"#,
        r"\b(\w+\.\w+)\b",
        r"(?:file|module|class)\s+(\w+)",
    ];
    let mut mentions = Vec::new();
    for pattern in patterns {
        let re = regex::Regex::new(pattern).unwrap();
        for caps in re.captures_iter(goal) {
            let m = caps[1].to_string();
            if !mentions.contains(&m) {
                mentions.push(m);
            }
        }
    }
    mentions
}

/// 1-based line ranges containing any of the terms, expanded by two lines of
/// context and merged when neighbourhoods are within one line of each other.
pub fn relevant_ranges(content: &str, terms: &[String]) -> Vec<(usize, usize)> {
    let lines: Vec<&str> = content.lines().collect();
    let mut ranges: Vec<(usize, usize)> = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let lower = line.to_lowercase();
        if terms.iter().any(|t| lower.contains(t.as_str())) {
            let line_no = idx + 1;
            let start = line_no.saturating_sub(2).max(1);
            let end = (line_no + 2).min(lines.len());
            ranges.push((start, end));
        }
    }

    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if last.1 + 1 >= start => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}
