//! Patch Engine: the sole mutator of the working directory.
//!
//! Validates unified diffs, applies them with exact-then-fuzzy hunk
//! matching, snapshots originals for rollback, and reports formatter drift.
//! Application is atomic per file: when any hunk of a file fails to place,
//! that file is left byte-identical to its pre-apply content and no
//! snapshot is retained for it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use similar::TextDiff;
use tracing::{debug, info, warn};

use crate::diff::{parse_unified_diff, FilePatch, Hunk};
use crate::domain::{short_hash, Result};

/// Lines searched on each side of a hunk's expected position during fuzzy
/// matching.
const FUZZY_WINDOW: usize = 20;
/// Minimum fraction of whitespace-stripped line matches for a fuzzy hit.
const FUZZY_THRESHOLD: f64 = 0.80;

/// Aggregate counters for a validated diff.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchStats {
    pub total_files: usize,
    pub total_hunks: usize,
    pub total_additions: usize,
    pub total_deletions: usize,
}

/// A hunk (or file) that could not be validated or placed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectInfo {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hunk_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_context: Vec<String>,
    pub reason: String,
}

/// Outcome of [`PatchEngine::validate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchValidation {
    pub is_valid: bool,
    pub stats: PatchStats,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub rejects: Vec<RejectInfo>,
}

/// Record of a hunk that placed via fuzzy matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FuzzyNote {
    pub file: String,
    pub hunk_index: usize,
    /// 1-based line where the hunk was placed.
    pub matched_line: usize,
    pub similarity: f64,
}

/// Outcome of [`PatchEngine::apply`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyResult {
    pub success: bool,
    pub applied_hunks: usize,
    pub failed_hunks: usize,
    pub rejects: Vec<RejectInfo>,
    /// Working-dir-relative paths written, deleted, or created.
    pub modified_files: Vec<String>,
    pub fuzzy_matches: Vec<FuzzyNote>,
}

/// Validates and applies unified diffs against a working directory.
pub struct PatchEngine {
    working_dir: PathBuf,
    original_contents: BTreeMap<PathBuf, String>,
    /// Content as last written by this engine, the baseline for
    /// formatter-drift detection.
    applied_contents: BTreeMap<PathBuf, String>,
}

impl PatchEngine {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            original_contents: BTreeMap::new(),
            applied_contents: BTreeMap::new(),
        }
    }

    /// Paths currently held as rollback snapshots.
    pub fn snapshot_paths(&self) -> Vec<PathBuf> {
        self.original_contents.keys().cloned().collect()
    }

    /// Parse and sanity-check a diff without touching the filesystem.
    pub async fn validate(&self, diff: &str) -> PatchValidation {
        let mut validation = PatchValidation {
            is_valid: true,
            ..PatchValidation::default()
        };

        let patches = parse_unified_diff(diff);
        if patches.is_empty() {
            validation.is_valid = false;
            validation
                .errors
                .push("No valid patches found in diff".to_string());
            return validation;
        }

        validation.stats.total_files = patches.len();
        validation.stats.total_hunks = patches.iter().map(|p| p.hunks.len()).sum();

        for patch in &patches {
            let file_path = self.working_dir.join(&patch.original_file);
            let exists = file_path.exists();

            if !exists && !patch.is_creation() {
                validation
                    .warnings
                    .push(format!("File {} does not exist", patch.original_file));
            }

            if let Some(expected_hash) = &patch.original_hash {
                if exists {
                    if let Ok(content) = std::fs::read_to_string(&file_path) {
                        let current = short_hash(&content);
                        if &current != expected_hash {
                            validation.is_valid = false;
                            validation.errors.push(format!(
                                "File {} hash mismatch: expected {}, got {}",
                                patch.original_file, expected_hash, current
                            ));
                        }
                    }
                }
            }

            let file_lines = if exists {
                std::fs::read_to_string(&file_path)
                    .map(|c| c.lines().count())
                    .unwrap_or(0)
            } else {
                0
            };

            for hunk in &patch.hunks {
                validation.stats.total_additions += hunk.additions.len();
                validation.stats.total_deletions += hunk.removals.len();

                if exists {
                    let changed = hunk.additions.len() + hunk.removals.len();
                    let ratio = changed as f64 / file_lines.max(1) as f64;
                    if ratio > 0.8 {
                        validation.warnings.push(format!(
                            "Hunk in {} changes {:.0}% of file",
                            patch.original_file,
                            ratio * 100.0
                        ));
                    }
                }
            }
        }

        if validation.stats.total_additions > 1000 {
            validation.warnings.push(format!(
                "Large patch: {} additions",
                validation.stats.total_additions
            ));
        }
        if validation.stats.total_deletions > 500 {
            validation.warnings.push(format!(
                "Large deletion: {} deletions",
                validation.stats.total_deletions
            ));
        }

        validation
    }

    /// Apply a diff to the working directory, patch by patch in input order.
    pub async fn apply(&mut self, diff: &str) -> Result<ApplyResult> {
        let mut result = ApplyResult {
            success: true,
            ..ApplyResult::default()
        };

        for patch in parse_unified_diff(diff) {
            if patch.is_creation() {
                self.apply_creation(&patch, &mut result)?;
            } else if patch.is_deletion() {
                self.apply_deletion(&patch, &mut result)?;
            } else {
                self.apply_modification(&patch, &mut result)?;
            }
        }

        Ok(result)
    }

    fn apply_creation(&mut self, patch: &FilePatch, result: &mut ApplyResult) -> Result<()> {
        let path = self.working_dir.join(&patch.modified_file);
        let content: Vec<&str> = patch
            .hunks
            .iter()
            .flat_map(|h| h.additions.iter().map(String::as_str))
            .collect();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let joined = content.join("\n");
        std::fs::write(&path, &joined)?;
        self.applied_contents.insert(path.clone(), joined);
        info!("created {}", path.display());
        result.modified_files.push(self.rel(&path));
        result.applied_hunks += patch.hunks.len();
        Ok(())
    }

    fn apply_deletion(&mut self, patch: &FilePatch, result: &mut ApplyResult) -> Result<()> {
        let path = self.working_dir.join(&patch.original_file);
        if path.exists() {
            if let Ok(original) = std::fs::read_to_string(&path) {
                self.original_contents.entry(path.clone()).or_insert(original);
            }
            std::fs::remove_file(&path)?;
            info!("deleted {}", path.display());
            result.modified_files.push(self.rel(&path));
            result.applied_hunks += patch.hunks.len();
        }
        Ok(())
    }

    fn apply_modification(&mut self, patch: &FilePatch, result: &mut ApplyResult) -> Result<()> {
        let path = self.working_dir.join(&patch.original_file);
        if !path.exists() {
            result.success = false;
            result.rejects.push(RejectInfo {
                file: patch.original_file.clone(),
                hunk_index: None,
                expected_context: Vec::new(),
                reason: "File not found".to_string(),
            });
            return Ok(());
        }

        let original = std::fs::read_to_string(&path)?;
        let mut lines: Vec<String> = original.split('\n').map(str::to_string).collect();

        // Bottom-up: descending original_start keeps earlier hunks' line
        // numbers valid while later ones are already applied.
        let mut sorted: Vec<&Hunk> = patch.hunks.iter().collect();
        sorted.sort_by(|a, b| b.original_start.cmp(&a.original_start));

        let mut file_failed = 0usize;
        let mut file_applied = 0usize;
        let mut fuzzy_notes = Vec::new();

        for (hunk_idx, hunk) in sorted.iter().enumerate() {
            if apply_hunk_exact(&mut lines, hunk) {
                file_applied += 1;
                continue;
            }
            match apply_hunk_fuzzy(&mut lines, hunk) {
                Some((matched_line, similarity)) => {
                    file_applied += 1;
                    debug!(
                        "applied hunk {hunk_idx} of {} with fuzzy match at line {matched_line} \
                         (similarity {similarity:.2})",
                        patch.original_file
                    );
                    fuzzy_notes.push(FuzzyNote {
                        file: patch.original_file.clone(),
                        hunk_index: hunk_idx,
                        matched_line,
                        similarity,
                    });
                }
                None => {
                    file_failed += 1;
                    result.rejects.push(RejectInfo {
                        file: patch.original_file.clone(),
                        hunk_index: Some(hunk_idx),
                        expected_context: hunk.expected_lines(),
                        reason: "Could not find matching context".to_string(),
                    });
                }
            }
        }

        if file_failed > 0 {
            // Atomic per file: leave it untouched.
            warn!(
                "{} of {} hunks rejected for {}, file left unmodified",
                file_failed,
                patch.hunks.len(),
                patch.original_file
            );
            result.success = false;
            result.failed_hunks += file_failed;
            return Ok(());
        }

        self.original_contents
            .entry(path.clone())
            .or_insert(original);
        let joined = lines.join("\n");
        std::fs::write(&path, &joined)?;
        self.applied_contents.insert(path.clone(), joined);
        result.applied_hunks += file_applied;
        result.fuzzy_matches.extend(fuzzy_notes);
        result.modified_files.push(self.rel(&path));
        Ok(())
    }

    /// Restore every snapshotted path to its pre-mutation content.
    /// Idempotent: a second call finds the snapshot map empty.
    pub async fn rollback(&mut self) -> Result<()> {
        for (path, original) in std::mem::take(&mut self.original_contents) {
            std::fs::write(&path, original)?;
            info!("rolled back {}", path.display());
        }
        Ok(())
    }

    /// Unified diff of any drift between the content this engine last wrote
    /// and the files now on disk (e.g. from an out-of-band formatter run).
    /// `None` when nothing drifted.
    pub async fn get_formatter_diff(&self) -> Option<String> {
        if self.applied_contents.is_empty() {
            return None;
        }

        let mut out = String::new();
        for (path, written) in &self.applied_contents {
            let Ok(current) = std::fs::read_to_string(path) else {
                continue;
            };
            if &current == written {
                continue;
            }
            let rel = self.rel(path);
            let diff = TextDiff::from_lines(written.as_str(), current.as_str());
            out.push_str(
                &diff
                    .unified_diff()
                    .context_radius(3)
                    .header(&rel, &rel)
                    .to_string(),
            );
        }

        (!out.is_empty()).then_some(out)
    }

    fn rel(&self, path: &Path) -> String {
        path.strip_prefix(&self.working_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }
}

/// Try to place the hunk at exactly `original_start`, comparing
/// right-stripped lines.
fn apply_hunk_exact(lines: &mut Vec<String>, hunk: &Hunk) -> bool {
    let expected = hunk.expected_lines();
    if expected.is_empty() {
        return false;
    }
    let start = hunk.original_start.saturating_sub(1);
    if start + expected.len() > lines.len() {
        return false;
    }

    let matches = expected
        .iter()
        .zip(&lines[start..start + expected.len()])
        .all(|(e, a)| e.trim_end() == a.trim_end());
    if !matches {
        return false;
    }

    lines.splice(start..start + expected.len(), hunk.replacement_lines());
    true
}

/// Search within +/- [`FUZZY_WINDOW`] lines of the expected position for the
/// window with the highest fraction of whitespace-stripped matches; apply
/// there when the best fraction reaches [`FUZZY_THRESHOLD`]. Returns the
/// 1-based match line and its similarity.
fn apply_hunk_fuzzy(lines: &mut Vec<String>, hunk: &Hunk) -> Option<(usize, f64)> {
    let pattern = hunk.expected_lines();
    if pattern.is_empty() {
        return None;
    }

    let start = hunk.original_start.saturating_sub(FUZZY_WINDOW);
    let end = (hunk.original_start + FUZZY_WINDOW).min(lines.len());
    if end < pattern.len() {
        return None;
    }

    let mut best: Option<(usize, f64)> = None;
    for i in start..=(end - pattern.len()) {
        let window = &lines[i..i + pattern.len()];
        let matched = pattern
            .iter()
            .zip(window)
            .filter(|(p, w)| p.trim() == w.trim())
            .count();
        let score = matched as f64 / pattern.len() as f64;
        if score >= FUZZY_THRESHOLD && best.map_or(true, |(_, b)| score > b) {
            best = Some((i, score));
        }
    }

    let (index, score) = best?;
    lines.splice(index..index + pattern.len(), hunk.replacement_lines());
    Some((index + 1, score))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const FILE_CONTENT: &str = "\
def handler(event):
    return 4
# end
";

    const CHANGE_DIFF: &str = "\
--- app.py
+++ app.py
@@ -1,3 +1,3 @@
 def handler(event):
-    return 4
+    return 5
 # end
";

    fn fixture() -> (tempfile::TempDir, PatchEngine) {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("app.py"), FILE_CONTENT).unwrap();
        let engine = PatchEngine::new(dir.path());
        (dir, engine)
    }

    #[tokio::test]
    async fn test_validate_empty_diff_fails() {
        let (_dir, engine) = fixture();
        let validation = engine.validate("").await;
        assert!(!validation.is_valid);
        assert!(validation.errors[0].contains("No valid patches"));
    }

    #[tokio::test]
    async fn test_validate_counts_stats() {
        let (_dir, engine) = fixture();
        let validation = engine.validate(CHANGE_DIFF).await;
        assert!(validation.is_valid);
        assert_eq!(validation.stats.total_files, 1);
        assert_eq!(validation.stats.total_hunks, 1);
        assert_eq!(validation.stats.total_additions, 1);
        assert_eq!(validation.stats.total_deletions, 1);
    }

    #[tokio::test]
    async fn test_validate_missing_file_warns() {
        let (_dir, engine) = fixture();
        let diff = "--- ghost.py\n+++ ghost.py\n@@ -1,1 +1,1 @@\n-x\n+y\n";
        let validation = engine.validate(diff).await;
        assert!(validation
            .warnings
            .iter()
            .any(|w| w.contains("ghost.py does not exist")));
    }

    #[tokio::test]
    async fn test_validate_hash_mismatch_rejects() {
        let (_dir, engine) = fixture();
        let diff = "--- app.py\t0000000000000000\n+++ app.py\n@@ -1,1 +1,1 @@\n-x\n+y\n";
        let validation = engine.validate(diff).await;
        assert!(!validation.is_valid);
        assert!(validation.errors[0].contains("hash mismatch"));
    }

    #[tokio::test]
    async fn test_validate_matching_hash_passes() {
        let (_dir, engine) = fixture();
        let hash = short_hash(FILE_CONTENT);
        let diff = format!(
            "--- app.py\t{hash}\n+++ app.py\n@@ -1,3 +1,3 @@\n def handler(event):\n-    return 4\n+    return 5\n # end\n"
        );
        let validation = engine.validate(&diff).await;
        assert!(validation.is_valid, "errors: {:?}", validation.errors);
    }

    #[tokio::test]
    async fn test_validate_whole_file_rewrite_warns() {
        let (_dir, engine) = fixture();
        let diff = "\
--- app.py
+++ app.py
@@ -1,3 +1,3 @@
-def handler(event):
-    return 4
-# end
+def handler(event):
+    return 5
+# done
";
        let validation = engine.validate(diff).await;
        assert!(validation.is_valid, "warning, not violation");
        assert!(validation.warnings.iter().any(|w| w.contains("% of file")));
    }

    #[tokio::test]
    async fn test_apply_exact_match() {
        let (dir, mut engine) = fixture();
        let result = engine.apply(CHANGE_DIFF).await.unwrap();
        assert!(result.success);
        assert_eq!(result.applied_hunks, 1);
        assert!(result.fuzzy_matches.is_empty());
        assert_eq!(result.modified_files, vec!["app.py".to_string()]);

        let content = fs::read_to_string(dir.path().join("app.py")).unwrap();
        assert!(content.contains("return 5"));
        assert!(!content.contains("return 4"));
    }

    #[tokio::test]
    async fn test_apply_creation_and_deletion() {
        let (dir, mut engine) = fixture();
        let diff = "\
--- /dev/null
+++ pkg/new.py
@@ -0,0 +1,2 @@
+def fresh():
+    return 1
--- app.py
+++ /dev/null
@@ -1,3 +0,0 @@
-def handler(event):
-    return 4
-# end
";
        let result = engine.apply(diff).await.unwrap();
        assert!(result.success);
        let created = fs::read_to_string(dir.path().join("pkg/new.py")).unwrap();
        assert_eq!(created, "def fresh():\n    return 1");
        assert!(!dir.path().join("app.py").exists());
    }

    #[tokio::test]
    async fn test_apply_missing_file_rejects() {
        let (_dir, mut engine) = fixture();
        let diff = "--- ghost.py\n+++ ghost.py\n@@ -1,1 +1,1 @@\n-x\n+y\n";
        let result = engine.apply(diff).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.rejects[0].reason, "File not found");
    }

    #[tokio::test]
    async fn test_apply_fuzzy_match_on_reindented_file() {
        let dir = tempdir().expect("tempdir");
        // Same logical content, re-indented, with one line genuinely
        // different so similarity lands below 1.0 but above the threshold.
        let reindented = "\
def handler(event):
        value = compute(event)
        check(value)
        log(value)
        audit(value)  # extra detail
        return 4
# end
";
        fs::write(dir.path().join("app.py"), reindented).unwrap();
        let mut engine = PatchEngine::new(dir.path());

        let diff = "\
--- app.py
+++ app.py
@@ -1,6 +1,6 @@
 def handler(event):
     value = compute(event)
     check(value)
     log(value)
     audit(value)
-    return 4
+    return 5
";
        let result = engine.apply(diff).await.unwrap();
        assert!(result.success, "rejects: {:?}", result.rejects);
        assert_eq!(result.failed_hunks, 0);
        assert_eq!(result.fuzzy_matches.len(), 1);
        let note = &result.fuzzy_matches[0];
        assert_eq!(note.matched_line, 1);
        assert!((note.similarity - 5.0 / 6.0).abs() < 1e-9);

        let content = fs::read_to_string(dir.path().join("app.py")).unwrap();
        assert!(content.contains("return 5"));
    }

    #[tokio::test]
    async fn test_apply_unplaceable_hunk_leaves_file_untouched() {
        let (dir, mut engine) = fixture();
        let diff = "\
--- app.py
+++ app.py
@@ -1,3 +1,3 @@
 something completely
-different
+unrelated
 entirely
";
        let result = engine.apply(diff).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failed_hunks, 1);
        assert_eq!(result.rejects[0].file, "app.py");

        let content = fs::read_to_string(dir.path().join("app.py")).unwrap();
        assert_eq!(content, FILE_CONTENT);
        assert!(engine.snapshot_paths().is_empty());
    }

    #[tokio::test]
    async fn test_reapply_is_content_noop() {
        let (dir, mut engine) = fixture();
        engine.apply(CHANGE_DIFF).await.unwrap();
        let after_first = fs::read_to_string(dir.path().join("app.py")).unwrap();

        let second = engine.apply(CHANGE_DIFF).await.unwrap();
        assert!(!second.success);
        let after_second = fs::read_to_string(dir.path().join("app.py")).unwrap();
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshots() {
        let (dir, mut engine) = fixture();
        engine.apply(CHANGE_DIFF).await.unwrap();
        engine.rollback().await.unwrap();

        let content = fs::read_to_string(dir.path().join("app.py")).unwrap();
        assert_eq!(content, FILE_CONTENT);
        assert!(engine.snapshot_paths().is_empty());

        // Idempotent second call.
        engine.rollback().await.unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("app.py")).unwrap(),
            FILE_CONTENT
        );
    }

    #[tokio::test]
    async fn test_formatter_diff_detects_drift() {
        let (dir, mut engine) = fixture();
        engine.apply(CHANGE_DIFF).await.unwrap();

        // Out-of-band edit after the engine's own write.
        let path = dir.path().join("app.py");
        let drifted = fs::read_to_string(&path).unwrap().replace("return 5", "return  5");
        fs::write(&path, drifted).unwrap();

        let diff = engine.get_formatter_diff().await.expect("drift expected");
        assert!(diff.contains("app.py"));
        assert!(diff.contains("return  5"));
    }

    #[tokio::test]
    async fn test_formatter_diff_none_without_drift() {
        let (_dir, mut engine) = fixture();
        engine.apply(CHANGE_DIFF).await.unwrap();
        assert!(engine.get_formatter_diff().await.is_none());
    }
}
