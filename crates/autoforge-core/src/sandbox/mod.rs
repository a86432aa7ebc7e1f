//! Sandbox seam: stack detection and child-process execution.
//!
//! The control loop only ever sees the [`Sandbox`] trait. [`LocalSandbox`]
//! is the reference implementation that runs commands in the host process
//! with per-call timeouts and no isolation; containerized implementations
//! plug in behind the same trait.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::domain::Result;

/// Timeout for cheap tool-availability probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Seconds elapsed.
    pub duration: f64,
    pub command: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Detected technology stack of a project directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackInfo {
    pub languages: Vec<String>,
    pub frameworks: Vec<String>,
    pub build_tools: Vec<String>,
    pub test_frameworks: Vec<String>,
    pub formatters: Vec<String>,
    pub linters: Vec<String>,
}

/// External collaborator that runs child processes for the control loop.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Infer languages, build tools, and available dev tools for `dir`.
    async fn detect_stack(&self, dir: &Path) -> Result<StackInfo>;

    /// Execute `cmd` in `cwd` with a wall-clock cap. Timeouts and spawn
    /// failures are reported through the exit code, never as errors.
    async fn exec(&self, cmd: &str, cwd: &Path, timeout: Duration) -> ExecResult;
}

/// Manifest files and what they imply about the stack.
const MANIFESTS: &[(&str, &[&str], &[&str])] = &[
    ("package.json", &["javascript", "typescript"], &["npm", "yarn"]),
    ("requirements.txt", &["python"], &["pip"]),
    ("pyproject.toml", &["python"], &["poetry", "pip"]),
    ("Cargo.toml", &["rust"], &["cargo"]),
    ("go.mod", &["go"], &["go"]),
    ("pom.xml", &["java"], &["maven"]),
    ("build.gradle", &["java", "kotlin"], &["gradle"]),
    ("Gemfile", &["ruby"], &["bundler"]),
];

/// (binary, probe args, StackInfo category)
const TOOL_PROBES: &[(&str, &[&str], &str)] = &[
    ("black", &["--version"], "formatters"),
    ("ruff", &["--version"], "linters"),
    ("pytest", &["--version"], "test_frameworks"),
    ("mypy", &["--version"], "linters"),
    ("prettier", &["--version"], "formatters"),
    ("eslint", &["--version"], "linters"),
    ("jest", &["--version"], "test_frameworks"),
    ("rustfmt", &["--version"], "formatters"),
    ("gofmt", &["-h"], "formatters"),
    ("golangci-lint", &["--version"], "linters"),
];

/// Runs commands directly on the host with per-call timeouts.
#[derive(Debug, Clone, Default)]
pub struct LocalSandbox;

impl LocalSandbox {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn detect_stack(&self, dir: &Path) -> Result<StackInfo> {
        let mut info = StackInfo::default();

        for (manifest, languages, build_tools) in MANIFESTS {
            if dir.join(manifest).exists() {
                info.languages.extend(languages.iter().map(|s| s.to_string()));
                info.build_tools
                    .extend(build_tools.iter().map(|s| s.to_string()));
            }
        }

        for (tool, args, category) in TOOL_PROBES {
            let cmd = format!("{tool} {}", args.join(" "));
            let result = self.exec(&cmd, dir, PROBE_TIMEOUT).await;
            if result.success() {
                let bucket = match *category {
                    "formatters" => &mut info.formatters,
                    "linters" => &mut info.linters,
                    _ => &mut info.test_frameworks,
                };
                bucket.push(tool.to_string());
            }
        }

        for bucket in [
            &mut info.languages,
            &mut info.frameworks,
            &mut info.build_tools,
            &mut info.test_frameworks,
            &mut info.formatters,
            &mut info.linters,
        ] {
            bucket.sort();
            bucket.dedup();
        }

        Ok(info)
    }

    async fn exec(&self, cmd: &str, cwd: &Path, timeout: Duration) -> ExecResult {
        let start = Instant::now();
        let mut parts = cmd.split_whitespace();
        let Some(program) = parts.next() else {
            return ExecResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: "empty command".to_string(),
                duration: 0.0,
                command: cmd.to_string(),
            };
        };

        let mut command = Command::new(program);
        command
            .args(parts)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("exec: {cmd} (cwd {})", cwd.display());

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecResult {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    duration: start.elapsed().as_secs_f64(),
                    command: cmd.to_string(),
                }
            }
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => ExecResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                duration: start.elapsed().as_secs_f64(),
                command: cmd.to_string(),
            },
            Ok(Err(e)) => ExecResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: e.to_string(),
                duration: start.elapsed().as_secs_f64(),
                command: cmd.to_string(),
            },
            // The dropped future kills the child (kill_on_drop).
            Err(_) => ExecResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("Command timed out after {}s", timeout.as_secs()),
                duration: timeout.as_secs_f64(),
                command: cmd.to_string(),
            },
        }
    }
}
