//! Indexed source entities: files and the symbols declared in them.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Kind of a declared symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Class,
    Method,
    Variable,
}

/// A code symbol with its declaration span.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub file: PathBuf,
    /// 1-based, inclusive.
    pub line_start: usize,
    /// 1-based, inclusive.
    pub line_end: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
}

impl Symbol {
    /// Whether the declaration span intersects `[start, end]` (1-based,
    /// inclusive).
    pub fn intersects_lines(&self, start: usize, end: usize) -> bool {
        self.line_start <= end && start <= self.line_end
    }
}

/// Per-file index record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContext {
    pub path: PathBuf,
    pub content: String,
    /// First 16 hex chars of the SHA-256 of the content.
    pub hash: String,
    pub language: String,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub exports: Vec<String>,
    #[serde(default)]
    pub symbols: Vec<Symbol>,
    /// Tests known to exercise this file (working-dir-relative paths).
    #[serde(default)]
    pub test_refs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(start: usize, end: usize) -> Symbol {
        Symbol {
            name: "f".to_string(),
            kind: SymbolKind::Function,
            file: PathBuf::from("a.py"),
            line_start: start,
            line_end: end,
            signature: None,
            docstring: None,
        }
    }

    #[test]
    fn test_intersects_lines() {
        let s = sym(10, 20);
        assert!(s.intersects_lines(20, 25));
        assert!(s.intersects_lines(5, 10));
        assert!(s.intersects_lines(12, 14));
        assert!(!s.intersects_lines(21, 30));
        assert!(!s.intersects_lines(1, 9));
    }

    #[test]
    fn test_symbol_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SymbolKind::Method).unwrap(),
            "\"method\""
        );
    }
}
