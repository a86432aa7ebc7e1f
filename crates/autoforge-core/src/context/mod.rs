//! Context Engine: repository indexing, budgeted retrieval, and change
//! impact analysis.
//!
//! Owns four Path-keyed indices for a task's lifetime: the file index, the
//! symbol index, the import graph, and the test-to-source mapping. Entities
//! live in the file index; relationships are path-keyed sets, never shared
//! pointers, so the whole index is cheap to snapshot in tests.

pub mod language;
pub mod retrieval;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::diff::parse_unified_diff;
use crate::domain::{short_hash, FileContext, Result, Symbol};

pub use retrieval::{RetrievalResult, RetrievedFile, SymbolHit};

const SKIP_DIRS: &[&str] = &["node_modules", "venv", "env", "__pycache__", "dist", "build"];
const SKIP_EXTENSIONS: &[&str] = &[
    "pyc", "pyo", "so", "dylib", "dll", "exe", "jpg", "jpeg", "png", "gif",
];

const CONFIG_PATTERNS: &[&str] = &[
    "setup.py",
    "pyproject.toml",
    "requirements*.txt",
    "package.json",
    "tsconfig.json",
    "*.config.js",
    "Cargo.toml",
    "go.mod",
    "go.sum",
];

const GUIDE_PATTERNS: &[&str] = &["README*", "CONTRIBUTING*", "AGENT.md", "DEVELOPMENT*"];

/// Files, symbols, and tests impacted by a diff.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeImpact {
    /// Working-dir-relative paths of modified files known to the index.
    pub files: Vec<String>,
    pub symbols: Vec<SymbolHit>,
    /// Working-dir-relative paths of tests covering the modified files.
    pub tests: Vec<String>,
}

/// Summary counters for an indexed repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_files: usize,
    pub total_symbols: usize,
    pub total_imports: usize,
    pub test_files: usize,
    pub languages: Vec<String>,
    pub indexed: bool,
}

/// In-memory semantic index of a working directory.
pub struct ContextEngine {
    root: PathBuf,
    file_index: BTreeMap<PathBuf, FileContext>,
    symbol_index: BTreeMap<String, Vec<Symbol>>,
    import_graph: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    test_mapping: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
}

impl ContextEngine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file_index: BTreeMap::new(),
            symbol_index: BTreeMap::new(),
            import_graph: BTreeMap::new(),
            test_mapping: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_index(&self) -> &BTreeMap<PathBuf, FileContext> {
        &self.file_index
    }

    /// Tests mapped to a source file, as working-dir-relative paths.
    pub fn tests_for(&self, path: &Path) -> Vec<String> {
        self.test_mapping
            .get(path)
            .map(|tests| tests.iter().map(|t| self.rel(t)).collect())
            .unwrap_or_default()
    }

    /// Walk the working directory and (re)build all indices.
    pub async fn index_repository(&mut self) -> Result<()> {
        info!("indexing repository at {}", self.root.display());
        self.file_index.clear();
        self.symbol_index.clear();
        self.import_graph.clear();
        self.test_mapping.clear();

        let mut files = Vec::new();
        collect_files(&self.root, &mut files);
        for path in files {
            self.index_file(&path);
        }

        self.build_import_graph();
        self.map_tests_to_sources();

        info!(
            "indexed {} files, {} symbol names",
            self.file_index.len(),
            self.symbol_index.len()
        );
        Ok(())
    }

    fn index_file(&mut self, path: &Path) {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                // Unreadable (binary, permissions) files are skipped outright.
                debug!("skipping unreadable file {}: {e}", path.display());
                return;
            }
        };

        let language = language::detect_language(path).to_string();
        let extraction = language::extract(&language, path, &content);
        let exports = extraction.symbols.iter().map(|s| s.name.clone()).collect();

        for symbol in &extraction.symbols {
            self.symbol_index
                .entry(symbol.name.clone())
                .or_default()
                .push(symbol.clone());
        }

        self.file_index.insert(
            path.to_path_buf(),
            FileContext {
                path: path.to_path_buf(),
                hash: short_hash(&content),
                content,
                language,
                imports: extraction.imports,
                exports,
                symbols: extraction.symbols,
                test_refs: Vec::new(),
            },
        );
    }

    fn build_import_graph(&mut self) {
        let mut graph: BTreeMap<PathBuf, BTreeSet<PathBuf>> = BTreeMap::new();
        for (path, ctx) in &self.file_index {
            for import in &ctx.imports {
                if let Some(resolved) = self.resolve_import(path, import) {
                    if self.file_index.contains_key(&resolved) {
                        graph.entry(path.clone()).or_default().insert(resolved);
                    }
                }
            }
        }
        self.import_graph = graph;
    }

    fn map_tests_to_sources(&mut self) {
        let mut mapping: BTreeMap<PathBuf, BTreeSet<PathBuf>> = BTreeMap::new();
        for (path, ctx) in &self.file_index {
            if !is_test_file(path) {
                continue;
            }
            for import in &ctx.imports {
                if let Some(resolved) = self.resolve_import(path, import) {
                    if self.file_index.contains_key(&resolved) && !is_test_file(&resolved) {
                        mapping.entry(resolved).or_default().insert(path.clone());
                    }
                }
            }
        }

        for (source, tests) in &mapping {
            let refs: Vec<String> = tests.iter().map(|t| self.rel(t)).collect();
            if let Some(ctx) = self.file_index.get_mut(source) {
                ctx.test_refs = refs;
            }
        }
        self.test_mapping = mapping;
    }

    /// Resolve an import string to an indexed file, where possible.
    fn resolve_import(&self, from_file: &Path, import: &str) -> Option<PathBuf> {
        let mut candidates = Vec::new();
        match from_file.extension().and_then(|e| e.to_str()) {
            Some("py") => {
                let joined = import.split('.').collect::<Vec<_>>().join("/");
                candidates.push(self.root.join(format!("{joined}.py")));
                candidates.push(self.root.join(&joined).join("__init__.py"));
                if let (Some(parent), Some(last)) = (from_file.parent(), import.split('.').next_back())
                {
                    candidates.push(parent.join(format!("{last}.py")));
                    // `from module import name` resolves to module.py one
                    // level up from the trailing name.
                    let parts: Vec<&str> = import.split('.').collect();
                    if parts.len() > 1 {
                        let module = parts[..parts.len() - 1].join("/");
                        candidates.push(self.root.join(format!("{module}.py")));
                        candidates.push(parent.join(format!("{}.py", parts[parts.len() - 2])));
                    }
                }
            }
            Some("js") | Some("jsx") | Some("ts") | Some("tsx") => {
                if import.starts_with('.') {
                    let base = from_file.parent()?;
                    for suffix in ["js", "ts"] {
                        candidates.push(base.join(format!("{import}.{suffix}")));
                        candidates.push(base.join(import).join(format!("index.{suffix}")));
                    }
                } else {
                    return None;
                }
            }
            _ => return None,
        }

        candidates.into_iter().find(|c| self.file_index.contains_key(c) || c.exists())
    }

    /// Rank files against the goal and emit a budget-bounded bundle.
    pub async fn retrieve(&self, goal: &str, budget_tokens: u64) -> RetrievalResult {
        debug!("retrieving context for goal: {:.100}", goal);

        let terms = retrieval::extract_key_terms(goal);
        let mentions = retrieval::extract_file_mentions(goal);

        let mut scored: Vec<(&PathBuf, f64)> = self
            .file_index
            .iter()
            .filter_map(|(path, ctx)| {
                let score = self.score_file(ctx, &terms, &mentions);
                (score > 0.0).then_some((path, score))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });

        let mut result = RetrievalResult::default();
        let mut over_budget = false;

        for (path, _score) in scored {
            let ctx = &self.file_index[path];
            let rel = self.rel(path);

            if over_budget {
                result.files.push(RetrievedFile {
                    path: rel,
                    hash: ctx.hash.clone(),
                    language: None,
                    content: None,
                    ranges: Vec::new(),
                    estimated_tokens: 0,
                });
                continue;
            }

            let cost = retrieval::estimate_tokens(&ctx.content);
            if result.token_count + cost > budget_tokens {
                // First overflow: emit the hit neighbourhoods, no content.
                over_budget = true;
                result.files.push(RetrievedFile {
                    path: rel,
                    hash: ctx.hash.clone(),
                    language: None,
                    content: None,
                    ranges: retrieval::relevant_ranges(&ctx.content, &terms),
                    estimated_tokens: 0,
                });
                continue;
            }

            result.files.push(RetrievedFile {
                path: rel,
                hash: ctx.hash.clone(),
                language: Some(ctx.language.clone()),
                content: Some(ctx.content.clone()),
                ranges: retrieval::relevant_ranges(&ctx.content, &terms),
                estimated_tokens: cost,
            });
            result.token_count += cost;

            for symbol in &ctx.symbols {
                let name_lower = symbol.name.to_lowercase();
                if terms.iter().any(|t| name_lower.contains(t.as_str())) {
                    result.symbols.push(SymbolHit {
                        name: symbol.name.clone(),
                        kind: format!("{:?}", symbol.kind).to_lowercase(),
                        file: self.rel(&symbol.file),
                        signature: symbol.signature.clone(),
                    });
                }
            }

            for import in &ctx.imports {
                if !result.imports.contains(import) {
                    result.imports.push(import.clone());
                }
            }

            for test in self.tests_for(path) {
                if !result.tests.contains(&test) {
                    result.tests.push(test);
                }
            }
        }

        result.configs = self.find_by_patterns(CONFIG_PATTERNS);
        result.guides = self.find_by_patterns(GUIDE_PATTERNS);
        result
    }

    fn score_file(&self, ctx: &FileContext, terms: &[String], mentions: &[String]) -> f64 {
        let mut score = 0.0;
        let file_name = ctx
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if mentions.iter().any(|m| file_name.contains(m.as_str())) {
            score += 10.0;
        }

        let name_lower = file_name.to_lowercase();
        for term in terms {
            if name_lower.contains(term.as_str()) {
                score += 2.0;
            }
        }

        let content_lower = ctx.content.to_lowercase();
        for term in terms {
            let count = content_lower.matches(term.as_str()).count();
            if count > 0 {
                score += (count as f64 * 0.5).min(5.0);
            }
        }

        for symbol in &ctx.symbols {
            let symbol_lower = symbol.name.to_lowercase();
            for term in terms {
                if symbol_lower.contains(term.as_str()) {
                    score += 3.0;
                }
                if let Some(doc) = &symbol.docstring {
                    if doc.to_lowercase().contains(term.as_str()) {
                        score += 1.0;
                    }
                }
            }
        }

        if let Some(neighbours) = self.import_graph.get(&ctx.path) {
            for imported in neighbours {
                let imported_name = imported
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if mentions.iter().any(|m| imported_name.contains(m.as_str())) {
                    score += 1.5;
                }
            }
        }

        score
    }

    /// Parse a diff's hunk headers and report the impacted files, symbols,
    /// and covering tests.
    pub async fn analyze_changes(&self, diff: &str) -> ChangeImpact {
        let mut impact = ChangeImpact::default();

        for patch in parse_unified_diff(diff) {
            let target = patch.target_path().to_string();
            let abs = self.root.join(&target);
            let Some(ctx) = self.file_index.get(&abs) else {
                continue;
            };

            let rel = self.rel(&abs);
            if !impact.files.contains(&rel) {
                impact.files.push(rel.clone());
            }

            for hunk in &patch.hunks {
                let start = hunk.modified_start.max(1);
                let end = start + hunk.modified_count.max(1) - 1;
                for symbol in &ctx.symbols {
                    if symbol.intersects_lines(start, end) {
                        let hit = SymbolHit {
                            name: symbol.name.clone(),
                            kind: format!("{:?}", symbol.kind).to_lowercase(),
                            file: rel.clone(),
                            signature: symbol.signature.clone(),
                        };
                        if !impact.symbols.contains(&hit) {
                            impact.symbols.push(hit);
                        }
                    }
                }
            }

            for test in self.tests_for(&abs) {
                if !impact.tests.contains(&test) {
                    impact.tests.push(test);
                }
            }
        }

        impact
    }

    pub fn stats(&self) -> IndexStats {
        let mut languages: Vec<String> = self
            .file_index
            .values()
            .map(|ctx| ctx.language.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        languages.sort();

        IndexStats {
            total_files: self.file_index.len(),
            total_symbols: self.symbol_index.len(),
            total_imports: self.import_graph.len(),
            test_files: self.file_index.keys().filter(|p| is_test_file(p)).count(),
            languages,
            indexed: !self.file_index.is_empty(),
        }
    }

    fn find_by_patterns(&self, patterns: &[&str]) -> Vec<String> {
        let compiled: Vec<Pattern> = patterns.iter().filter_map(|p| Pattern::new(p).ok()).collect();
        let mut found = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return found;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if compiled.iter().any(|p| p.matches(&name)) {
                found.push(self.rel(&path));
            }
        }
        found.sort();
        found
    }

    fn rel(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }
}

/// Whether a path names a test file: the basename contains `test` or `spec`,
/// or the parent directory is `test`/`tests`.
pub fn is_test_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.contains("test") || name.contains("spec") {
        return true;
    }
    matches!(
        path.parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_lowercase())
            .as_deref(),
        Some("test") | Some("tests")
    )
}

fn should_skip_dir(name: &str) -> bool {
    name.starts_with('.') || SKIP_DIRS.contains(&name)
}

fn should_index(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if name.starts_with('.') {
        return false;
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();
    !SKIP_EXTENSIONS.contains(&ext.as_str())
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if !should_skip_dir(&name) {
                collect_files(&path, out);
            }
        } else if should_index(&path) {
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    async fn indexed_fixture() -> (tempfile::TempDir, ContextEngine) {
        let dir = tempdir().expect("tempdir");
        let root = dir.path();

        fs::write(
            root.join("mathlib.py"),
            "def add(a, b):\n    \"\"\"Add two numbers.\"\"\"\n    return a + b\n\n\ndef sub(a, b):\n    return a - b\n",
        )
        .unwrap();
        fs::write(
            root.join("test_mathlib.py"),
            "import mathlib\n\ndef test_add():\n    assert mathlib.add(2, 2) == 4\n",
        )
        .unwrap();
        fs::write(root.join("README.md"), "# fixture\n").unwrap();
        fs::write(root.join("pyproject.toml"), "[tool.pytest.ini_options]\n").unwrap();

        fs::create_dir(root.join("node_modules")).unwrap();
        fs::write(root.join("node_modules/skipme.js"), "var x = 1;\n").unwrap();
        fs::write(root.join(".hidden"), "secret\n").unwrap();

        let mut engine = ContextEngine::new(root);
        engine.index_repository().await.unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn test_index_skips_hidden_and_vendored() {
        let (_dir, engine) = indexed_fixture().await;
        let paths: Vec<String> = engine.file_index().keys().map(|p| p.display().to_string()).collect();
        assert!(!paths.iter().any(|p| p.contains("node_modules")));
        assert!(!paths.iter().any(|p| p.contains(".hidden")));
        assert_eq!(engine.file_index().len(), 4);
    }

    #[tokio::test]
    async fn test_test_mapping_links_tests_to_sources() {
        let (dir, engine) = indexed_fixture().await;
        let source = dir.path().join("mathlib.py");
        let tests = engine.tests_for(&source);
        assert_eq!(tests, vec!["test_mathlib.py".to_string()]);

        let ctx = engine.file_index().get(&source).unwrap();
        assert_eq!(ctx.test_refs, vec!["test_mathlib.py".to_string()]);
    }

    #[tokio::test]
    async fn test_retrieve_scores_goal_terms() {
        let (_dir, engine) = indexed_fixture().await;
        let result = engine.retrieve("fix the add function in mathlib", 10_000).await;

        assert!(!result.files.is_empty());
        assert_eq!(result.files[0].path, "mathlib.py");
        assert!(result.files[0].content.is_some());
        assert!(result.symbols.iter().any(|s| s.name == "add"));
        assert!(result.tests.contains(&"test_mathlib.py".to_string()));
        assert!(result.configs.contains(&"pyproject.toml".to_string()));
        assert!(result.guides.contains(&"README.md".to_string()));
    }

    #[tokio::test]
    async fn test_retrieve_token_count_matches_emitted_costs() {
        let (_dir, engine) = indexed_fixture().await;
        let result = engine.retrieve("add mathlib test", 10_000).await;
        let sum: u64 = result.files.iter().map(|f| f.estimated_tokens).sum();
        assert_eq!(result.token_count, sum);
    }

    #[tokio::test]
    async fn test_retrieve_respects_zero_budget() {
        let (_dir, engine) = indexed_fixture().await;
        let result = engine.retrieve("add mathlib", 0).await;
        assert_eq!(result.token_count, 0);
        // Everything emitted must be content-free.
        assert!(result.files.iter().all(|f| f.content.is_none()));
        // The first cut-off entry still carries hit ranges.
        assert!(!result.files.is_empty());
        assert!(!result.files[0].ranges.is_empty());
        // Entries after the cut carry no ranges.
        for file in &result.files[1..] {
            assert!(file.ranges.is_empty());
        }
    }

    #[tokio::test]
    async fn test_analyze_changes_finds_impacted_symbols_and_tests() {
        let (_dir, engine) = indexed_fixture().await;
        let diff = "\
--- mathlib.py
+++ mathlib.py
@@ -1,3 +1,3 @@
 def add(a, b):
-    \"\"\"Add two numbers.\"\"\"
+    \"\"\"Add two integers.\"\"\"
     return a + b
";
        let impact = engine.analyze_changes(diff).await;
        assert_eq!(impact.files, vec!["mathlib.py".to_string()]);
        assert!(impact.symbols.iter().any(|s| s.name == "add"));
        assert!(!impact.symbols.iter().any(|s| s.name == "sub"));
        assert_eq!(impact.tests, vec!["test_mathlib.py".to_string()]);
    }

    #[tokio::test]
    async fn test_analyze_changes_ignores_unknown_files() {
        let (_dir, engine) = indexed_fixture().await;
        let diff = "--- nowhere.py\n+++ nowhere.py\n@@ -1,1 +1,1 @@\n-x\n+y\n";
        let impact = engine.analyze_changes(diff).await;
        assert!(impact.files.is_empty());
        assert!(impact.tests.is_empty());
    }

    #[tokio::test]
    async fn test_stats() {
        let (_dir, engine) = indexed_fixture().await;
        let stats = engine.stats();
        assert_eq!(stats.total_files, 4);
        assert_eq!(stats.test_files, 1);
        assert!(stats.indexed);
        assert!(stats.languages.contains(&"python".to_string()));
    }

    #[test]
    fn test_is_test_file_predicate() {
        assert!(is_test_file(Path::new("test_app.py")));
        assert!(is_test_file(Path::new("app.spec.js")));
        assert!(is_test_file(Path::new("tests/helpers.py")));
        assert!(!is_test_file(Path::new("src/app.py")));
    }
}
