//! Test Runner: framework detection, targeted selection, and structured
//! reports.
//!
//! Framework detection probes config files first and falls back to glob
//! heuristics. Targeted selection unions the impact analysis' tests,
//! conventional-name matches, and a literal symbol-mention scan over known
//! test files; an empty target set falls back to the full suite. Output
//! parsing prefers a JSON report file and degrades to per-framework text
//! regexes.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::ChangeImpact;
use crate::sandbox::{ExecResult, Sandbox};

/// Wall-clock cap for a test suite run.
pub const SUITE_TIMEOUT: Duration = Duration::from_secs(300);

const JSON_REPORT_FILE: &str = ".test_report.json";

/// Supported test frameworks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameworkKind {
    Pytest,
    Jest,
    Mocha,
    Cargo,
    Go,
}

/// A detected framework with its command template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Framework {
    pub language: String,
    pub kind: FrameworkKind,
    pub command: String,
    pub args: Vec<String>,
}

/// Result of a single test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestResult {
    pub name: String,
    /// `passed`, `failed`, `skipped`, or `error`.
    pub status: String,
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

/// A recorded failure; fields are filled as far as the framework reports
/// them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TestFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Complete execution report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: bool,
    pub total: usize,
    pub passed_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub duration: f64,
    pub test_results: Vec<TestResult>,
    pub failures: Vec<TestFailure>,
    pub stdout: String,
    pub stderr: String,
    pub command: String,
}

impl TestReport {
    fn failing(reason: &str, command: impl Into<String>, duration: f64) -> Self {
        Self {
            passed: false,
            duration,
            failures: vec![TestFailure {
                reason: Some(reason.to_string()),
                ..TestFailure::default()
            }],
            command: command.into(),
            ..Self::default()
        }
    }
}

/// Minimal failure bundle handed to the repair prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinimalFailure {
    pub test_name: String,
    pub message: String,
    pub file: String,
    pub context: String,
    pub total_failures: usize,
}

/// Executes targeted or full test runs through the sandbox.
pub struct TestRunner {
    working_dir: PathBuf,
    sandbox: Arc<dyn Sandbox>,
}

impl TestRunner {
    pub fn new(working_dir: impl Into<PathBuf>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            working_dir: working_dir.into(),
            sandbox,
        }
    }

    /// Probe config files, then glob heuristics.
    pub fn detect_framework(&self) -> Option<Framework> {
        let config_probes: &[(&[&str], FrameworkKind, &str, &str, &[&str])] = &[
            (
                &["pytest.ini", "pyproject.toml", "setup.cfg"],
                FrameworkKind::Pytest,
                "python",
                "pytest",
                &["-v", "--json-report", "--json-report-file=.test_report.json"],
            ),
            (
                &["jest.config.js", "jest.config.json", "jest.config.ts"],
                FrameworkKind::Jest,
                "javascript",
                "jest",
                &["--json", "--outputFile=.test_report.json"],
            ),
            (
                &[".mocharc.js", ".mocharc.json", ".mocharc.yml"],
                FrameworkKind::Mocha,
                "javascript",
                "mocha",
                &["--reporter", "json"],
            ),
            (&["Cargo.toml"], FrameworkKind::Cargo, "rust", "cargo test", &[]),
            (&["go.mod"], FrameworkKind::Go, "go", "go test", &["-json", "./..."]),
        ];

        for (configs, kind, language, command, args) in config_probes {
            if configs.iter().any(|c| self.working_dir.join(c).exists()) {
                return Some(Framework {
                    language: language.to_string(),
                    kind: *kind,
                    command: command.to_string(),
                    args: args.iter().map(|a| a.to_string()).collect(),
                });
            }
        }

        // Glob fallbacks.
        if self.any_file_matches(|name| name.starts_with("test_") && name.ends_with(".py")) {
            return Some(Framework {
                language: "python".to_string(),
                kind: FrameworkKind::Pytest,
                command: "pytest".to_string(),
                args: vec!["-v".to_string()],
            });
        }
        if self.any_file_matches(|name| name.ends_with(".test.js")) {
            return Some(Framework {
                language: "javascript".to_string(),
                kind: FrameworkKind::Jest,
                command: "jest".to_string(),
                args: Vec::new(),
            });
        }

        None
    }

    /// Run the tests selected for the impacted files/symbols; falls back to
    /// the full suite when nothing is selected.
    pub async fn run_targeted(&self, impact: &ChangeImpact) -> TestReport {
        let Some(framework) = self.detect_framework() else {
            warn!("could not detect test framework");
            return TestReport::failing("No test framework detected", "", 0.0);
        };

        let targeted = self.find_targeted_tests(impact);
        if targeted.is_empty() {
            info!("no targeted tests found, running full suite");
            return self.run_full().await;
        }

        info!("running {} targeted tests", targeted.len());
        let command = build_test_command(&framework, Some(&targeted));
        self.execute(&framework, &command).await
    }

    /// Run the whole suite.
    pub async fn run_full(&self) -> TestReport {
        let Some(framework) = self.detect_framework() else {
            return TestReport::failing("No test framework detected", "", 0.0);
        };
        let command = build_test_command(&framework, None);
        self.execute(&framework, &command).await
    }

    /// Union of mapped tests, conventional-name matches, and symbol-mention
    /// scans. Always a superset of `impact.tests`.
    pub fn find_targeted_tests(&self, impact: &ChangeImpact) -> Vec<String> {
        let mut targeted: BTreeSet<String> = impact.tests.iter().cloned().collect();

        let all_files = self.walk();

        for file in &impact.files {
            let stem = Path::new(file)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            if stem.is_empty() {
                continue;
            }
            let conventions = [
                format!("test_{stem}.py"),
                format!("{stem}_test.py"),
                format!("{stem}.test.js"),
                format!("{stem}.spec.js"),
                format!("{stem}_test.go"),
            ];
            for path in &all_files {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if conventions.contains(&name) {
                    targeted.insert(self.rel(path));
                }
            }
        }

        // Literal symbol-name scan over known test files.
        if !impact.symbols.is_empty() {
            for path in &all_files {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if !(name.starts_with("test_") && name.ends_with(".py")) {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(path) else {
                    continue;
                };
                if impact.symbols.iter().any(|s| {
                    let last = s.name.rsplit('.').next().unwrap_or(&s.name);
                    content.contains(last)
                }) {
                    targeted.insert(self.rel(path));
                }
            }
        }

        targeted.into_iter().collect()
    }

    async fn execute(&self, framework: &Framework, command: &str) -> TestReport {
        let result = self
            .sandbox
            .exec(command, &self.working_dir, SUITE_TIMEOUT)
            .await;

        if result.exit_code == -1 && result.stderr.contains("timed out") {
            return TestReport::failing("Test execution timeout", command, SUITE_TIMEOUT.as_secs_f64());
        }

        let mut report = self.parse_output(framework, &result);
        report.command = command.to_string();
        report
    }

    fn parse_output(&self, framework: &Framework, result: &ExecResult) -> TestReport {
        let mut report = TestReport {
            passed: result.exit_code == 0,
            duration: result.duration,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            ..TestReport::default()
        };

        // Prefer the JSON report file when a framework produced one.
        let json_path = self.working_dir.join(JSON_REPORT_FILE);
        if json_path.exists() {
            let parsed = std::fs::read_to_string(&json_path)
                .ok()
                .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok());
            let _ = std::fs::remove_file(&json_path);
            if let Some(json) = parsed {
                parse_json_report(&json, &mut report);
                return report;
            }
            debug!("ignoring unreadable JSON test report");
        }

        match framework.kind {
            FrameworkKind::Pytest => parse_pytest_output(&result.stdout, &mut report),
            FrameworkKind::Jest => parse_jest_output(&result.stdout, &mut report),
            FrameworkKind::Go => parse_go_output(&result.stdout, &mut report),
            FrameworkKind::Cargo => parse_cargo_output(&result.stdout, &mut report),
            FrameworkKind::Mocha => parse_generic_output(result, &mut report),
        }
        report
    }

    /// Minimal failure bundle: first failure plus the surrounding output.
    pub fn extract_minimal_failure(&self, report: &TestReport) -> Option<MinimalFailure> {
        let first = report.failures.first()?;

        let mut context_lines: Vec<String> = Vec::new();
        if let Some(test_name) = &first.test {
            for output in [&report.stdout, &report.stderr] {
                let lines: Vec<&str> = output.lines().collect();
                if let Some(i) = lines.iter().position(|l| l.contains(test_name.as_str())) {
                    let start = i.saturating_sub(3);
                    let end = (i + 10).min(lines.len());
                    context_lines = lines[start..end].iter().map(|l| l.to_string()).collect();
                    break;
                }
            }
        }

        let context = if context_lines.is_empty() {
            report.stderr.chars().take(500).collect()
        } else {
            context_lines.join("\n")
        };

        Some(MinimalFailure {
            test_name: first
                .test
                .clone()
                .or_else(|| first.reason.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            message: first.message.clone().unwrap_or_default(),
            file: first.file.clone().unwrap_or_default(),
            context,
            total_failures: report.failures.len(),
        })
    }

    fn walk(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        walk_dir(&self.working_dir, &mut out);
        out
    }

    fn any_file_matches(&self, pred: impl Fn(&str) -> bool) -> bool {
        self.walk().iter().any(|p| {
            p.file_name()
                .map(|n| pred(&n.to_string_lossy()))
                .unwrap_or(false)
        })
    }

    fn rel(&self, path: &Path) -> String {
        path.strip_prefix(&self.working_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }
}

fn walk_dir(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if !name.starts_with('.') && name != "node_modules" && name != "__pycache__" {
                walk_dir(&path, out);
            }
        } else {
            out.push(path);
        }
    }
}

/// Build the framework-specific command, appending targets where supported.
pub fn build_test_command(framework: &Framework, targeted: Option<&[String]>) -> String {
    let mut parts: Vec<String> = vec![framework.command.clone()];

    match targeted {
        None => {
            parts.extend(framework.args.iter().cloned());
        }
        Some(tests) => match framework.kind {
            FrameworkKind::Pytest => {
                parts.extend(framework.args.iter().cloned());
                parts.extend(tests.iter().cloned());
            }
            FrameworkKind::Jest => {
                parts.extend(framework.args.iter().cloned());
                let pattern = tests
                    .iter()
                    .map(|t| regex::escape(t))
                    .collect::<Vec<_>>()
                    .join("|");
                parts.push(format!("--testPathPattern=\"{pattern}\""));
            }
            FrameworkKind::Go => {
                // Per-package selection; keep -json, drop the ./... catch-all.
                parts.extend(
                    framework
                        .args
                        .iter()
                        .filter(|a| a.as_str() != "./...")
                        .cloned(),
                );
                let packages: BTreeSet<String> = tests
                    .iter()
                    .map(|t| {
                        let parent = Path::new(t)
                            .parent()
                            .map(|p| p.to_string_lossy().to_string())
                            .unwrap_or_default();
                        if parent.is_empty() {
                            "./".to_string()
                        } else {
                            format!("./{parent}")
                        }
                    })
                    .collect();
                parts.extend(packages);
            }
            _ => {
                parts.extend(framework.args.iter().cloned());
                parts.extend(tests.iter().cloned());
            }
        },
    }

    parts.join(" ")
}

fn count_in_summary(line: &str, word: &str) -> Option<usize> {
    Regex::new(&format!(r"(\d+)\s+{word}"))
        .ok()?
        .captures(line)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

fn parse_pytest_output(output: &str, report: &mut TestReport) {
    let failed_line = Regex::new(r"^FAILED (\S+?)(?:\[[^\]]*\])? - (.*)$").unwrap();

    for line in output.lines() {
        if line.starts_with('=') && (line.contains("passed") || line.contains("failed")) {
            report.passed_count = count_in_summary(line, "passed").unwrap_or(0);
            report.failed_count = count_in_summary(line, "failed").unwrap_or(0);
            report.skipped_count = count_in_summary(line, "skipped").unwrap_or(0);
            report.total = report.passed_count + report.failed_count + report.skipped_count;
        }
        if let Some(caps) = failed_line.captures(line) {
            report.failures.push(TestFailure {
                test: Some(caps[1].to_string()),
                message: Some(caps[2].to_string()),
                ..TestFailure::default()
            });
        }
    }
}

fn parse_jest_output(output: &str, report: &mut TestReport) {
    // Jest sometimes prints the JSON report inline.
    if let Some(start) = output.find('{') {
        if output.contains("\"testResults\"") {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(output[start..].trim()) {
                parse_json_report(&json, report);
                return;
            }
        }
    }

    for line in output.lines() {
        if line.contains("Tests:") {
            report.passed_count = count_in_summary(line, "passed").unwrap_or(0);
            report.failed_count = count_in_summary(line, "failed").unwrap_or(0);
            report.skipped_count = count_in_summary(line, "skipped").unwrap_or(0);
            report.total = report.passed_count + report.failed_count + report.skipped_count;
        }
    }
}

fn parse_go_output(output: &str, report: &mut TestReport) {
    for line in output.lines() {
        let Ok(event) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
            continue;
        };
        let Some(test) = event.get("Test").and_then(|t| t.as_str()) else {
            continue;
        };
        let action = event.get("Action").and_then(|a| a.as_str()).unwrap_or("");
        let elapsed = event.get("Elapsed").and_then(|e| e.as_f64()).unwrap_or(0.0);

        match action {
            "pass" => {
                report.passed_count += 1;
                report.test_results.push(TestResult {
                    name: test.to_string(),
                    status: "passed".to_string(),
                    duration: elapsed,
                    file: None,
                    line: None,
                    failure_message: None,
                });
            }
            "fail" => {
                report.failed_count += 1;
                report.test_results.push(TestResult {
                    name: test.to_string(),
                    status: "failed".to_string(),
                    duration: elapsed,
                    file: None,
                    line: None,
                    failure_message: None,
                });
                report.failures.push(TestFailure {
                    test: Some(test.to_string()),
                    file: event
                        .get("Package")
                        .and_then(|p| p.as_str())
                        .map(str::to_string),
                    ..TestFailure::default()
                });
            }
            _ => {}
        }
    }
    report.total = report.passed_count + report.failed_count;
}

fn parse_cargo_output(output: &str, report: &mut TestReport) {
    let summary =
        Regex::new(r"test result: (?:ok|FAILED)\. (\d+) passed; (\d+) failed;").unwrap();
    let failed_test = Regex::new(r"^test (\S+) \.\.\. FAILED$").unwrap();

    for line in output.lines() {
        if let Some(caps) = summary.captures(line) {
            report.passed_count += caps[1].parse::<usize>().unwrap_or(0);
            report.failed_count += caps[2].parse::<usize>().unwrap_or(0);
        }
        if let Some(caps) = failed_test.captures(line) {
            report.failures.push(TestFailure {
                test: Some(caps[1].to_string()),
                ..TestFailure::default()
            });
        }
    }
    report.total = report.passed_count + report.failed_count;
}

fn parse_json_report(json: &serde_json::Value, report: &mut TestReport) {
    // Jest shape.
    if let Some(test_files) = json.get("testResults").and_then(|t| t.as_array()) {
        for test_file in test_files {
            let file_name = test_file.get("name").and_then(|n| n.as_str()).unwrap_or("");
            let assertions = test_file
                .get("assertionResults")
                .and_then(|a| a.as_array())
                .cloned()
                .unwrap_or_default();
            for test in assertions {
                let title = test.get("title").and_then(|t| t.as_str()).unwrap_or("");
                let status = test.get("status").and_then(|s| s.as_str()).unwrap_or("");
                let passed = status == "passed";
                report.test_results.push(TestResult {
                    name: title.to_string(),
                    status: if passed { "passed" } else { "failed" }.to_string(),
                    duration: 0.0,
                    file: Some(file_name.to_string()),
                    line: None,
                    failure_message: None,
                });
                if passed {
                    report.passed_count += 1;
                } else {
                    report.failed_count += 1;
                    let messages = test
                        .get("failureMessages")
                        .and_then(|m| m.as_array())
                        .map(|msgs| {
                            msgs.iter()
                                .filter_map(|m| m.as_str())
                                .collect::<Vec<_>>()
                                .join(" ")
                        })
                        .unwrap_or_default();
                    report.failures.push(TestFailure {
                        test: Some(title.to_string()),
                        file: Some(file_name.to_string()),
                        message: Some(messages),
                        ..TestFailure::default()
                    });
                }
            }
        }
    }
    // pytest-json-report shape.
    else if let Some(tests) = json.get("tests").and_then(|t| t.as_array()) {
        for test in tests {
            let nodeid = test.get("nodeid").and_then(|n| n.as_str()).unwrap_or("");
            let outcome = test.get("outcome").and_then(|o| o.as_str()).unwrap_or("");
            let duration = test.get("duration").and_then(|d| d.as_f64()).unwrap_or(0.0);
            let passed = outcome == "passed";
            report.test_results.push(TestResult {
                name: nodeid.to_string(),
                status: if passed { "passed" } else { "failed" }.to_string(),
                duration,
                file: None,
                line: None,
                failure_message: None,
            });
            if passed {
                report.passed_count += 1;
            } else {
                report.failed_count += 1;
                report.failures.push(TestFailure {
                    test: Some(nodeid.to_string()),
                    message: test
                        .get("call")
                        .and_then(|c| c.get("longrepr"))
                        .and_then(|l| l.as_str())
                        .map(str::to_string),
                    ..TestFailure::default()
                });
            }
        }
    }

    report.total = report.passed_count + report.failed_count + report.skipped_count;
}

fn parse_generic_output(result: &ExecResult, report: &mut TestReport) {
    if result.exit_code == 0 {
        report.passed = true;
        if let Some(caps) = Regex::new(r"(\d+) tests? passed")
            .unwrap()
            .captures(&result.stdout.to_lowercase())
        {
            report.passed_count = caps[1].parse().unwrap_or(0);
            report.total = report.passed_count;
        }
        return;
    }

    report.passed = false;
    let fails = result.stdout.matches("FAIL").count();
    if fails > 0 {
        report.failed_count = fails;
        report.total = fails;
    }
    if let Some(line) = result
        .stdout
        .lines()
        .find(|l| l.contains("FAILED") || l.contains("FAIL") || l.contains("Error"))
    {
        report.failures.push(TestFailure {
            message: Some(line.trim().to_string()),
            ..TestFailure::default()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::fs;
    use tempfile::tempdir;

    use crate::context::SymbolHit;
    use crate::domain::Result;
    use crate::sandbox::StackInfo;

    struct FakeSandbox {
        exit_code: i32,
        stdout: String,
        stderr: String,
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        async fn detect_stack(&self, _dir: &Path) -> Result<StackInfo> {
            Ok(StackInfo::default())
        }

        async fn exec(&self, cmd: &str, _cwd: &Path, _timeout: Duration) -> ExecResult {
            ExecResult {
                exit_code: self.exit_code,
                stdout: self.stdout.clone(),
                stderr: self.stderr.clone(),
                duration: 0.1,
                command: cmd.to_string(),
            }
        }
    }

    fn runner_with(
        dir: &Path,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
    ) -> TestRunner {
        TestRunner::new(
            dir,
            Arc::new(FakeSandbox {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
        )
    }

    #[test]
    fn test_detect_framework_by_config_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("pytest.ini"), "[pytest]\n").unwrap();
        let runner = runner_with(dir.path(), 0, "", "");
        let framework = runner.detect_framework().unwrap();
        assert_eq!(framework.kind, FrameworkKind::Pytest);
        assert_eq!(framework.command, "pytest");
    }

    #[test]
    fn test_detect_framework_by_glob_fallback() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("test_app.py"), "def test_x(): pass\n").unwrap();
        let runner = runner_with(dir.path(), 0, "", "");
        let framework = runner.detect_framework().unwrap();
        assert_eq!(framework.kind, FrameworkKind::Pytest);
        assert_eq!(framework.args, vec!["-v".to_string()]);
    }

    #[test]
    fn test_detect_framework_cargo_and_go() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("go.mod"), "module example.com/m\n").unwrap();
        let runner = runner_with(dir.path(), 0, "", "");
        assert_eq!(runner.detect_framework().unwrap().kind, FrameworkKind::Go);
    }

    #[test]
    fn test_detect_framework_none() {
        let dir = tempdir().unwrap();
        let runner = runner_with(dir.path(), 0, "", "");
        assert!(runner.detect_framework().is_none());
    }

    #[test]
    fn test_targeted_selection_is_superset_of_mapped_tests() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("test_mathlib.py"), "from mathlib import add\n").unwrap();
        fs::write(dir.path().join("test_other.py"), "def test_unrelated(): pass\n").unwrap();

        let runner = runner_with(dir.path(), 0, "", "");
        let impact = ChangeImpact {
            files: vec!["mathlib.py".to_string()],
            symbols: vec![SymbolHit {
                name: "add".to_string(),
                kind: "function".to_string(),
                file: "mathlib.py".to_string(),
                signature: None,
            }],
            tests: vec!["test_mathlib.py".to_string()],
        };

        let targeted = runner.find_targeted_tests(&impact);
        for mapped in &impact.tests {
            assert!(targeted.contains(mapped), "selection must be a superset");
        }
        // Symbol scan catches the import mention too.
        assert!(targeted.contains(&"test_mathlib.py".to_string()));
        assert!(!targeted.contains(&"test_other.py".to_string()));
    }

    #[test]
    fn test_targeted_selection_by_naming_convention() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("widget_test.go"), "package widget\n").unwrap();
        let runner = runner_with(dir.path(), 0, "", "");
        let impact = ChangeImpact {
            files: vec!["widget.go".to_string()],
            ..ChangeImpact::default()
        };
        let targeted = runner.find_targeted_tests(&impact);
        assert_eq!(targeted, vec!["widget_test.go".to_string()]);
    }

    #[test]
    fn test_build_command_pytest_appends_paths() {
        let framework = Framework {
            language: "python".to_string(),
            kind: FrameworkKind::Pytest,
            command: "pytest".to_string(),
            args: vec!["-v".to_string()],
        };
        let cmd = build_test_command(&framework, Some(&["tests/test_a.py".to_string()]));
        assert_eq!(cmd, "pytest -v tests/test_a.py");
    }

    #[test]
    fn test_build_command_jest_uses_path_pattern() {
        let framework = Framework {
            language: "javascript".to_string(),
            kind: FrameworkKind::Jest,
            command: "jest".to_string(),
            args: Vec::new(),
        };
        let cmd = build_test_command(&framework, Some(&["src/a.test.js".to_string()]));
        assert!(cmd.contains("--testPathPattern="));
        assert!(cmd.contains("src/a\\.test\\.js"));
    }

    #[test]
    fn test_build_command_go_uses_parent_packages() {
        let framework = Framework {
            language: "go".to_string(),
            kind: FrameworkKind::Go,
            command: "go test".to_string(),
            args: vec!["-json".to_string(), "./...".to_string()],
        };
        let cmd = build_test_command(
            &framework,
            Some(&["pkg/widget/widget_test.go".to_string()]),
        );
        assert_eq!(cmd, "go test -json ./pkg/widget");
    }

    #[test]
    fn test_parse_pytest_summary_and_failures() {
        let output = "\
collected 4 items

test_app.py::test_add FAILED
FAILED test_app.py::test_add - AssertionError: 4 != 5

===== 3 passed, 1 failed in 0.12s =====
";
        let mut report = TestReport::default();
        parse_pytest_output(output, &mut report);
        assert_eq!(report.passed_count, 3);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.total, 4);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(
            report.failures[0].test.as_deref(),
            Some("test_app.py::test_add")
        );
        assert_eq!(
            report.failures[0].message.as_deref(),
            Some("AssertionError: 4 != 5")
        );
    }

    #[test]
    fn test_parse_pytest_failed_first_ordering() {
        let output = "===== 1 failed, 3 passed in 0.2s =====\n";
        let mut report = TestReport::default();
        parse_pytest_output(output, &mut report);
        assert_eq!(report.passed_count, 3);
        assert_eq!(report.failed_count, 1);
    }

    #[test]
    fn test_parse_jest_summary_line() {
        let output = "Tests:       1 failed, 9 passed, 10 total\n";
        let mut report = TestReport::default();
        parse_jest_output(output, &mut report);
        assert_eq!(report.passed_count, 9);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.total, 10);
    }

    #[test]
    fn test_parse_go_event_stream() {
        let output = r#"{"Action":"run","Test":"TestAdd"}
{"Action":"pass","Test":"TestAdd","Elapsed":0.01}
{"Action":"fail","Test":"TestSub","Package":"example.com/m","Elapsed":0.02}
{"Action":"fail","Package":"example.com/m"}
"#;
        let mut report = TestReport::default();
        parse_go_output(output, &mut report);
        assert_eq!(report.passed_count, 1);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.total, 2);
        assert_eq!(report.failures[0].test.as_deref(), Some("TestSub"));
    }

    #[test]
    fn test_parse_cargo_output() {
        let output = "\
test engine::tests::test_apply ... ok
test engine::tests::test_rollback ... FAILED

test result: FAILED. 5 passed; 1 failed; 0 ignored
";
        let mut report = TestReport::default();
        parse_cargo_output(output, &mut report);
        assert_eq!(report.passed_count, 5);
        assert_eq!(report.failed_count, 1);
        assert_eq!(
            report.failures[0].test.as_deref(),
            Some("engine::tests::test_rollback")
        );
    }

    #[tokio::test]
    async fn test_json_report_file_preferred_and_cleaned_up() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("pytest.ini"), "[pytest]\n").unwrap();
        fs::write(
            dir.path().join(JSON_REPORT_FILE),
            r#"{"tests":[{"nodeid":"test_a.py::test_one","outcome":"passed","duration":0.01}]}"#,
        )
        .unwrap();

        let runner = runner_with(dir.path(), 0, "irrelevant", "");
        let report = runner.run_full().await;
        assert_eq!(report.passed_count, 1);
        assert_eq!(report.total, 1);
        assert!(!dir.path().join(JSON_REPORT_FILE).exists(), "report cleaned up");
    }

    #[tokio::test]
    async fn test_run_full_without_framework_is_single_failure() {
        let dir = tempdir().unwrap();
        let runner = runner_with(dir.path(), 0, "", "");
        let report = runner.run_full().await;
        assert!(!report.passed);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0]
            .reason
            .as_deref()
            .unwrap()
            .contains("No test framework"));
    }

    #[tokio::test]
    async fn test_timeout_becomes_synthetic_failure() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("pytest.ini"), "[pytest]\n").unwrap();
        let runner = runner_with(dir.path(), -1, "", "Command timed out after 300s");
        let report = runner.run_full().await;
        assert!(!report.passed);
        assert_eq!(
            report.failures[0].reason.as_deref(),
            Some("Test execution timeout")
        );
        assert_eq!(report.duration, 300.0);
    }

    #[tokio::test]
    async fn test_empty_targets_fall_back_to_full_run() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("pytest.ini"), "[pytest]\n").unwrap();
        let runner = runner_with(dir.path(), 0, "===== 2 passed in 0.05s =====", "");
        let report = runner.run_targeted(&ChangeImpact::default()).await;
        assert!(report.passed);
        assert_eq!(report.passed_count, 2);
        // Full-suite command: no test paths appended.
        assert!(report.command.starts_with("pytest"));
    }

    #[test]
    fn test_extract_minimal_failure_with_context() {
        let report = TestReport {
            passed: false,
            failures: vec![TestFailure {
                test: Some("test_add".to_string()),
                message: Some("AssertionError: 4 != 5".to_string()),
                ..TestFailure::default()
            }],
            stdout: "setup\nrunning test_add\nassert 4 == 5\nE AssertionError\n".to_string(),
            ..TestReport::default()
        };
        let dir = tempdir().unwrap();
        let runner = runner_with(dir.path(), 0, "", "");
        let minimal = runner.extract_minimal_failure(&report).unwrap();
        assert_eq!(minimal.test_name, "test_add");
        assert!(minimal.context.contains("running test_add"));
        assert!(minimal.context.contains("AssertionError"));
        assert_eq!(minimal.total_failures, 1);
    }

    #[test]
    fn test_extract_minimal_failure_empty_report() {
        let dir = tempdir().unwrap();
        let runner = runner_with(dir.path(), 0, "", "");
        assert!(runner.extract_minimal_failure(&TestReport::default()).is_none());
    }
}
