//! Unified-diff model: hunks, per-file patches, parsing, and canonical
//! rendering.
//!
//! The hunk model is deliberately simple: one change block per hunk, with
//! context split into the lines before and after the change. Parsing a diff
//! and re-rendering it yields byte-equivalent hunks (headers may normalize
//! omitted counts).

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Sentinel path denoting file creation (as the original) or deletion (as
/// the modified side).
pub const DEV_NULL: &str = "/dev/null";

/// A contiguous change block in a unified diff.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Hunk {
    /// 1-based first line of the hunk in the original file.
    pub original_start: usize,
    pub original_count: usize,
    /// 1-based first line of the hunk in the modified file.
    pub modified_start: usize,
    pub modified_count: usize,
    pub context_before: Vec<String>,
    pub removals: Vec<String>,
    pub additions: Vec<String>,
    pub context_after: Vec<String>,
}

impl Hunk {
    /// The lines this hunk expects to find in the original file.
    pub fn expected_lines(&self) -> Vec<String> {
        let mut lines =
            Vec::with_capacity(self.context_before.len() + self.removals.len() + self.context_after.len());
        lines.extend(self.context_before.iter().cloned());
        lines.extend(self.removals.iter().cloned());
        lines.extend(self.context_after.iter().cloned());
        lines
    }

    /// The lines that replace [`Hunk::expected_lines`] after application.
    pub fn replacement_lines(&self) -> Vec<String> {
        let mut lines =
            Vec::with_capacity(self.context_before.len() + self.additions.len() + self.context_after.len());
        lines.extend(self.context_before.iter().cloned());
        lines.extend(self.additions.iter().cloned());
        lines.extend(self.context_after.iter().cloned());
        lines
    }
}

/// All hunks targeting a single file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilePatch {
    pub original_file: String,
    pub modified_file: String,
    /// Short content hash of the expected original, when the producer
    /// stamped one into the `---` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_hash: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    pub fn is_creation(&self) -> bool {
        self.original_file == DEV_NULL
    }

    pub fn is_deletion(&self) -> bool {
        self.modified_file == DEV_NULL
    }

    pub fn additions(&self) -> usize {
        self.hunks.iter().map(|h| h.additions.len()).sum()
    }

    pub fn deletions(&self) -> usize {
        self.hunks.iter().map(|h| h.removals.len()).sum()
    }

    /// The path the patch applies to on disk: the modified side for
    /// creations, the original side otherwise.
    pub fn target_path(&self) -> &str {
        if self.is_creation() {
            &self.modified_file
        } else {
            &self.original_file
        }
    }
}

/// Parse a unified diff into structured per-file patches.
///
/// Header lines may carry a tab-separated annotation after the path; a
/// 16-plus-char hex annotation on the `---` line is interpreted as the
/// original content hash, anything else (timestamps) is discarded.
pub fn parse_unified_diff(diff: &str) -> Vec<FilePatch> {
    let hunk_header = Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap();

    let mut patches: Vec<FilePatch> = Vec::new();
    let mut current_patch: Option<FilePatch> = None;
    let mut current_hunk: Option<Hunk> = None;
    let mut in_hunk = false;

    let flush_hunk = |patch: &mut Option<FilePatch>, hunk: &mut Option<Hunk>| {
        if let (Some(patch), Some(hunk)) = (patch.as_mut(), hunk.take()) {
            patch.hunks.push(hunk);
        }
    };

    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("--- ") {
            flush_hunk(&mut current_patch, &mut current_hunk);
            if let Some(patch) = current_patch.take() {
                patches.push(patch);
            }
            let mut parts = rest.splitn(2, '\t');
            let path = parts.next().unwrap_or_default().to_string();
            let original_hash = parts
                .next()
                .map(str::trim)
                .filter(|s| s.len() >= 16 && s.chars().all(|c| c.is_ascii_hexdigit()))
                .map(str::to_string);
            current_patch = Some(FilePatch {
                original_file: path,
                modified_file: String::new(),
                original_hash,
                hunks: Vec::new(),
            });
            in_hunk = false;
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            if let Some(patch) = current_patch.as_mut() {
                patch.modified_file = rest
                    .splitn(2, '\t')
                    .next()
                    .unwrap_or_default()
                    .to_string();
            }
        } else if line.starts_with("@@") {
            flush_hunk(&mut current_patch, &mut current_hunk);
            if let Some(caps) = hunk_header.captures(line) {
                let num = |i: usize, default: usize| {
                    caps.get(i)
                        .map(|m| m.as_str().parse().unwrap_or(default))
                        .unwrap_or(default)
                };
                current_hunk = Some(Hunk {
                    original_start: num(1, 1),
                    original_count: num(2, 1),
                    modified_start: num(3, 1),
                    modified_count: num(4, 1),
                    ..Hunk::default()
                });
                in_hunk = true;
            }
        } else if in_hunk {
            let Some(hunk) = current_hunk.as_mut() else {
                continue;
            };
            if let Some(rest) = line.strip_prefix('-') {
                hunk.removals.push(rest.to_string());
            } else if let Some(rest) = line.strip_prefix('+') {
                hunk.additions.push(rest.to_string());
            } else if let Some(rest) = line.strip_prefix(' ') {
                if hunk.removals.is_empty() && hunk.additions.is_empty() {
                    hunk.context_before.push(rest.to_string());
                } else {
                    hunk.context_after.push(rest.to_string());
                }
            } else if line.starts_with('\\') {
                // "\ No newline at end of file"
            } else if line.is_empty() {
                // Blank context line with the leading space trimmed by the
                // producer; treat as context.
                if hunk.removals.is_empty() && hunk.additions.is_empty() {
                    hunk.context_before.push(String::new());
                } else {
                    hunk.context_after.push(String::new());
                }
            } else {
                in_hunk = false;
            }
        }
    }

    flush_hunk(&mut current_patch, &mut current_hunk);
    if let Some(patch) = current_patch.take() {
        patches.push(patch);
    }

    patches
}

/// Render patches back to canonical unified-diff text.
pub fn render_unified_diff(patches: &[FilePatch]) -> String {
    let mut out = String::new();
    for patch in patches {
        match &patch.original_hash {
            Some(hash) => {
                out.push_str(&format!("--- {}\t{}\n", patch.original_file, hash));
            }
            None => out.push_str(&format!("--- {}\n", patch.original_file)),
        }
        out.push_str(&format!("+++ {}\n", patch.modified_file));
        for hunk in &patch.hunks {
            out.push_str(&format!(
                "@@ -{},{} +{},{} @@\n",
                hunk.original_start, hunk.original_count, hunk.modified_start, hunk.modified_count
            ));
            for line in &hunk.context_before {
                out.push_str(&format!(" {line}\n"));
            }
            for line in &hunk.removals {
                out.push_str(&format!("-{line}\n"));
            }
            for line in &hunk.additions {
                out.push_str(&format!("+{line}\n"));
            }
            for line in &hunk.context_after {
                out.push_str(&format!(" {line}\n"));
            }
        }
    }
    out
}

/// Per-file added lines, as needed by policy checks.
#[derive(Debug, Clone, PartialEq)]
pub struct FileChanges {
    pub path: String,
    pub additions: Vec<String>,
    pub deletions: Vec<String>,
}

/// Light-weight diff scan that collects added/removed lines per file without
/// building the full hunk model.
pub fn collect_file_changes(diff: &str) -> Vec<FileChanges> {
    let mut changes: Vec<FileChanges> = Vec::new();

    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("--- ") {
            let path = rest.splitn(2, '\t').next().unwrap_or_default().to_string();
            changes.push(FileChanges {
                path,
                additions: Vec::new(),
                deletions: Vec::new(),
            });
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            let path = rest.splitn(2, '\t').next().unwrap_or_default();
            if let Some(current) = changes.last_mut() {
                // Prefer the modified side; it names the file for creations.
                if path != DEV_NULL {
                    current.path = path.to_string();
                }
            }
        } else if let Some(rest) = line.strip_prefix('+') {
            if let Some(current) = changes.last_mut() {
                current.additions.push(rest.to_string());
            }
        } else if let Some(rest) = line.strip_prefix('-') {
            if let Some(current) = changes.last_mut() {
                current.deletions.push(rest.to_string());
            }
        }
    }

    changes
}
