//! Per-language import and symbol extraction.
//!
//! Python gets an indentation-aware scan that recovers full declaration
//! spans, nested methods, and docstrings. The other languages use
//! line-anchored regexes; their symbol spans collapse to the declaration
//! line, which is enough for impact analysis on hunk granularity.

use std::path::Path;

use regex::Regex;

use crate::domain::{Symbol, SymbolKind};

/// Map a file extension to a language tag.
pub fn detect_language(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "rs" => "rust",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "hpp" => "cpp",
        "md" => "markdown",
        "yml" | "yaml" => "yaml",
        "json" => "json",
        "toml" => "toml",
        _ => "unknown",
    }
}

/// Extraction output for a single file.
#[derive(Debug, Default)]
pub struct Extraction {
    pub imports: Vec<String>,
    pub symbols: Vec<Symbol>,
}

pub fn extract(language: &str, path: &Path, content: &str) -> Extraction {
    match language {
        "python" => extract_python(path, content),
        "javascript" | "typescript" => extract_javascript(path, content),
        "rust" => extract_rust(path, content),
        "go" => extract_go(path, content),
        _ => Extraction::default(),
    }
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Last line (1-based) of the block introduced at `decl_idx` (0-based):
/// scans forward until a non-blank line at or below the declaration indent.
fn block_end(lines: &[&str], decl_idx: usize, decl_indent: usize) -> usize {
    let mut end = decl_idx;
    for (idx, line) in lines.iter().enumerate().skip(decl_idx + 1) {
        if line.trim().is_empty() {
            continue;
        }
        if indent_of(line) <= decl_indent {
            break;
        }
        end = idx;
    }
    end + 1
}

/// First docstring line of the block starting after `decl_idx`, if any.
fn python_docstring(lines: &[&str], decl_idx: usize) -> Option<String> {
    for line in lines.iter().skip(decl_idx + 1) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        for quote in ["\"\"\"", "'''"] {
            if let Some(rest) = trimmed.strip_prefix(quote) {
                let text = rest.strip_suffix(quote).unwrap_or(rest).trim();
                if text.is_empty() {
                    return None;
                }
                return Some(text.to_string());
            }
        }
        return None;
    }
    None
}

fn extract_python(path: &Path, content: &str) -> Extraction {
    let import_re = Regex::new(r"^import\s+([\w.]+)").unwrap();
    let from_re = Regex::new(r"^from\s+([\w.]+)\s+import\s+(.+)").unwrap();
    let def_re = Regex::new(r"^(\s*)(?:async\s+)?def\s+(\w+)\s*\(([^)]*)").unwrap();
    let class_re = Regex::new(r"^class\s+(\w+)").unwrap();

    let lines: Vec<&str> = content.lines().collect();
    let mut out = Extraction::default();

    for line in &lines {
        if let Some(caps) = import_re.captures(line) {
            out.imports.push(caps[1].to_string());
        } else if let Some(caps) = from_re.captures(line) {
            let module = caps[1].to_string();
            for name in caps[2].split(',') {
                let name = name.trim().split_whitespace().next().unwrap_or("");
                if !name.is_empty() && name != "(" {
                    out.imports.push(format!("{module}.{name}"));
                }
            }
        }
    }

    let mut idx = 0;
    while idx < lines.len() {
        let line = lines[idx];

        if let Some(caps) = class_re.captures(line) {
            let class_name = caps[1].to_string();
            let end = block_end(&lines, idx, 0);
            out.symbols.push(Symbol {
                name: class_name.clone(),
                kind: SymbolKind::Class,
                file: path.to_path_buf(),
                line_start: idx + 1,
                line_end: end,
                signature: None,
                docstring: python_docstring(&lines, idx),
            });

            // Methods: defs indented inside the class body.
            let mut inner = idx + 1;
            while inner < end {
                if let Some(mcaps) = def_re.captures(lines[inner]) {
                    let indent = mcaps[1].len();
                    if indent > 0 {
                        let method = mcaps[2].to_string();
                        let args = mcaps[3].trim().to_string();
                        let m_end = block_end(&lines, inner, indent);
                        out.symbols.push(Symbol {
                            name: format!("{class_name}.{method}"),
                            kind: SymbolKind::Method,
                            file: path.to_path_buf(),
                            line_start: inner + 1,
                            line_end: m_end,
                            signature: Some(format!("{method}({args})")),
                            docstring: python_docstring(&lines, inner),
                        });
                    }
                }
                inner += 1;
            }
            idx = end;
            continue;
        }

        if let Some(caps) = def_re.captures(line) {
            if caps[1].is_empty() {
                let name = caps[2].to_string();
                let args = caps[3].trim().to_string();
                let end = block_end(&lines, idx, 0);
                out.symbols.push(Symbol {
                    name: name.clone(),
                    kind: SymbolKind::Function,
                    file: path.to_path_buf(),
                    line_start: idx + 1,
                    line_end: end,
                    signature: Some(format!("{name}({args})")),
                    docstring: python_docstring(&lines, idx),
                });
                idx = end;
                continue;
            }
        }

        idx += 1;
    }

    out
}

fn extract_javascript(path: &Path, content: &str) -> Extraction {
    let import_re =
        Regex::new(r#"import\s+(?:\{[^}]+\}|\*\s+as\s+\w+|\w+)\s+from\s+['"]([^'"]+)['"]"#)
            .unwrap();
    let func_re = Regex::new(r"(?:export\s+)?(?:async\s+)?function\s+(\w+)").unwrap();
    let class_re = Regex::new(r"(?:export\s+)?class\s+(\w+)").unwrap();

    let mut out = Extraction::default();
    for caps in import_re.captures_iter(content) {
        out.imports.push(caps[1].to_string());
    }
    for (idx, line) in content.lines().enumerate() {
        if let Some(caps) = func_re.captures(line) {
            out.symbols.push(line_symbol(path, &caps[1], SymbolKind::Function, idx + 1));
        }
        if let Some(caps) = class_re.captures(line) {
            out.symbols.push(line_symbol(path, &caps[1], SymbolKind::Class, idx + 1));
        }
    }
    out
}

fn extract_rust(path: &Path, content: &str) -> Extraction {
    let use_re = Regex::new(r"^use\s+([\w:]+)").unwrap();
    let fn_re = Regex::new(r"^(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?fn\s+(\w+)").unwrap();
    let type_re = Regex::new(r"^(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum|trait)\s+(\w+)").unwrap();

    let mut out = Extraction::default();
    for (idx, line) in content.lines().enumerate() {
        if let Some(caps) = use_re.captures(line) {
            out.imports.push(caps[1].to_string());
        } else if let Some(caps) = fn_re.captures(line) {
            out.symbols.push(line_symbol(path, &caps[1], SymbolKind::Function, idx + 1));
        } else if let Some(caps) = type_re.captures(line) {
            out.symbols.push(line_symbol(path, &caps[1], SymbolKind::Class, idx + 1));
        }
    }
    out
}

fn extract_go(path: &Path, content: &str) -> Extraction {
    let import_re = Regex::new(r#""([\w./-]+)""#).unwrap();
    let func_re = Regex::new(r"^func\s+(?:\([^)]*\)\s*)?(\w+)").unwrap();
    let type_re = Regex::new(r"^type\s+(\w+)\s+(?:struct|interface)").unwrap();

    let mut out = Extraction::default();
    let mut in_import_block = false;
    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("import (") {
            in_import_block = true;
            continue;
        }
        if in_import_block {
            if trimmed == ")" {
                in_import_block = false;
            } else if let Some(caps) = import_re.captures(trimmed) {
                out.imports.push(caps[1].to_string());
            }
            continue;
        }
        if trimmed.starts_with("import ") {
            if let Some(caps) = import_re.captures(trimmed) {
                out.imports.push(caps[1].to_string());
            }
        } else if let Some(caps) = func_re.captures(line) {
            out.symbols.push(line_symbol(path, &caps[1], SymbolKind::Function, idx + 1));
        } else if let Some(caps) = type_re.captures(line) {
            out.symbols.push(line_symbol(path, &caps[1], SymbolKind::Class, idx + 1));
        }
    }
    out
}

fn line_symbol(path: &Path, name: &str, kind: SymbolKind, line: usize) -> Symbol {
    Symbol {
        name: name.to_string(),
        kind,
        file: path.to_path_buf(),
        line_start: line,
        line_end: line,
        signature: None,
        docstring: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const PY_SAMPLE: &str = r#"import os
from collections import defaultdict, OrderedDict

def top(a, b):
    """Adds things."""
    return a + b


class Greeter:
    """Says hello."""

    def greet(self, name):
        return f"hi {name}"

    async def farewell(self, name):
        return f"bye {name}"

CONSTANT = 1
"#;

    #[test]
    fn test_python_imports() {
        let out = extract("python", &PathBuf::from("m.py"), PY_SAMPLE);
        assert!(out.imports.contains(&"os".to_string()));
        assert!(out.imports.contains(&"collections.defaultdict".to_string()));
        assert!(out.imports.contains(&"collections.OrderedDict".to_string()));
    }

    #[test]
    fn test_python_symbols_and_spans() {
        let out = extract("python", &PathBuf::from("m.py"), PY_SAMPLE);
        let names: Vec<_> = out.symbols.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"top"));
        assert!(names.contains(&"Greeter"));
        assert!(names.contains(&"Greeter.greet"));
        assert!(names.contains(&"Greeter.farewell"));

        let top = out.symbols.iter().find(|s| s.name == "top").unwrap();
        assert_eq!(top.kind, SymbolKind::Function);
        assert_eq!(top.line_start, 4);
        assert_eq!(top.line_end, 6);
        assert_eq!(top.signature.as_deref(), Some("top(a, b)"));
        assert_eq!(top.docstring.as_deref(), Some("Adds things."));

        let greet = out.symbols.iter().find(|s| s.name == "Greeter.greet").unwrap();
        assert_eq!(greet.kind, SymbolKind::Method);
        assert_eq!(greet.line_start, 12);
        assert_eq!(greet.line_end, 13);
    }

    #[test]
    fn test_python_class_span_covers_methods() {
        let out = extract("python", &PathBuf::from("m.py"), PY_SAMPLE);
        let class = out.symbols.iter().find(|s| s.name == "Greeter").unwrap();
        assert_eq!(class.kind, SymbolKind::Class);
        assert!(class.line_end >= 16, "class span should include methods");
    }

    #[test]
    fn test_javascript_extraction() {
        let js = "import { thing } from './lib';\nexport function doWork() {}\nclass Widget {}\n";
        let out = extract("javascript", &PathBuf::from("a.js"), js);
        assert_eq!(out.imports, vec!["./lib"]);
        assert_eq!(out.symbols.len(), 2);
        assert_eq!(out.symbols[0].name, "doWork");
        assert_eq!(out.symbols[0].line_start, 2);
        assert_eq!(out.symbols[1].kind, SymbolKind::Class);
    }

    #[test]
    fn test_rust_extraction() {
        let rs = "use std::fmt;\npub struct Engine;\npub async fn run() {}\n";
        let out = extract("rust", &PathBuf::from("a.rs"), rs);
        assert_eq!(out.imports, vec!["std"]);
        let names: Vec<_> = out.symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Engine", "run"]);
    }

    #[test]
    fn test_go_extraction() {
        let go = "package main\n\nimport (\n\t\"fmt\"\n\t\"os\"\n)\n\nfunc main() {}\ntype Server struct {}\n";
        let out = extract("go", &PathBuf::from("main.go"), go);
        assert_eq!(out.imports, vec!["fmt", "os"]);
        let names: Vec<_> = out.symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["main", "Server"]);
    }

    #[test]
    fn test_unknown_language_extracts_nothing() {
        let out = extract("markdown", &PathBuf::from("README.md"), "# title\n");
        assert!(out.imports.is_empty());
        assert!(out.symbols.is_empty());
    }
}
