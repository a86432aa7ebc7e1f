//! Autoforge - autonomous code-modification CLI.
//!
//! ## Commands
//!
//! - `run`: drive a goal through the full plan/edit/test control loop
//! - `analyze`: index a repository and report its stack and statistics
//! - `validate`: check a diff against policy and patch validation, no apply
//! - `context`: preview the retrieval bundle for a goal

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};

use autoforge_core::context::ContextEngine;
use autoforge_core::domain::{RunStatus, Task, TaskLimits};
use autoforge_core::fsm::ControlLoop;
use autoforge_core::patch::PatchEngine;
use autoforge_core::policy::PolicyEngine;
use autoforge_core::sandbox::{LocalSandbox, Sandbox};
use autoforge_core::{init_tracing, ForgeConfig};
use autoforge_llm::http::OpenAiCompatProvider;
use autoforge_llm::LlmProvider;

#[derive(Parser)]
#[command(name = "autoforge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Autonomous code-modification orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a goal through the control loop until tests pass or limits hit
    Run {
        /// Natural-language goal
        goal: String,

        /// Working directory (default: current directory)
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Maximum failed attempts before aborting
        #[arg(long)]
        max_retries: Option<u32>,

        /// Wall-clock cap in minutes
        #[arg(long)]
        timeout_minutes: Option<u64>,

        /// Token budget for the run
        #[arg(long)]
        max_tokens: Option<u64>,

        /// Directory for trace files and plan snapshots
        #[arg(long)]
        trace_dir: Option<PathBuf>,
    },

    /// Index the repository and report stack info and statistics
    Analyze {
        /// Working directory (default: current directory)
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },

    /// Validate a unified diff without applying it
    Validate {
        /// Path to the diff file
        diff: PathBuf,

        /// Working directory (default: current directory)
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },

    /// Show the retrieval bundle the model would see for a goal
    Context {
        /// Natural-language goal
        goal: String,

        /// Working directory (default: current directory)
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Retrieval token budget
        #[arg(long, default_value = "10000")]
        budget: u64,
    },
}

/// Default endpoint and model per known provider name.
fn provider_defaults(name: &str) -> (&'static str, &'static str) {
    match name {
        "anthropic" => ("https://api.anthropic.com/v1", "claude-3-5-sonnet-latest"),
        _ => ("https://api.openai.com/v1", "gpt-4o-mini"),
    }
}

fn build_provider(config: &ForgeConfig) -> Result<(Arc<dyn LlmProvider>, String)> {
    let Some(name) = config.default_provider() else {
        bail!(
            "no API key configured; set OPENAI_API_KEY or ANTHROPIC_API_KEY, \
             or add a provider to ~/.autoforge/config.toml"
        );
    };
    let Some((api_key, model)) = config.provider_credentials(&name) else {
        bail!("provider {name} has no API key configured");
    };

    let (default_base_url, default_model) = provider_defaults(&name);
    let base_url = config
        .providers
        .get(&name)
        .and_then(|p| p.base_url.clone())
        .unwrap_or_else(|| default_base_url.to_string());
    let model = model.unwrap_or_else(|| default_model.to_string());

    let provider = OpenAiCompatProvider::new(name, base_url, api_key)?;
    Ok((Arc::new(provider), model))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            goal,
            dir,
            max_retries,
            timeout_minutes,
            max_tokens,
            trace_dir,
        } => {
            let dir = dir.canonicalize().context("working directory not found")?;
            let config = ForgeConfig::load(&dir);
            let (provider, model) = build_provider(&config)?;

            let defaults = config.task_limits();
            let limits = TaskLimits {
                max_retries: max_retries.unwrap_or(defaults.max_retries),
                max_duration: timeout_minutes
                    .map(|m| Duration::from_secs(m * 60))
                    .unwrap_or(defaults.max_duration),
                max_tokens: max_tokens.unwrap_or(defaults.max_tokens),
            };

            let task = Task::new(&dir, goal).with_limits(limits);
            info!("running task {} in {}", task.id, dir.display());

            let mut control_loop = ControlLoop::new(
                task,
                provider,
                model,
                Arc::new(LocalSandbox::new()),
                config.policy.clone(),
            );
            if let Some(trace_dir) = trace_dir {
                control_loop = control_loop.with_trace_dir(trace_dir);
            }

            let report = control_loop.run().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.status != RunStatus::Success {
                std::process::exit(1);
            }
        }

        Commands::Analyze { dir } => {
            let dir = dir.canonicalize().context("working directory not found")?;
            let sandbox = LocalSandbox::new();
            let stack = sandbox.detect_stack(&dir).await?;

            let mut engine = ContextEngine::new(&dir);
            engine.index_repository().await?;

            let output = serde_json::json!({
                "stack_info": stack,
                "stats": engine.stats(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Commands::Validate { diff, dir } => {
            let dir = dir.canonicalize().context("working directory not found")?;
            let diff_text = std::fs::read_to_string(&diff)
                .with_context(|| format!("failed to read {}", diff.display()))?;

            let config = ForgeConfig::load(&dir);
            let policy = PolicyEngine::new(config.policy.clone());
            let policy_result = policy.validate_diff(&diff_text).await;

            let patch_engine = PatchEngine::new(&dir);
            let patch_result = patch_engine.validate(&diff_text).await;

            let overall = policy_result.is_valid && patch_result.is_valid;
            let output = serde_json::json!({
                "policy_validation": policy_result,
                "patch_validation": patch_result,
                "overall_valid": overall,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            if !overall {
                std::process::exit(1);
            }
        }

        Commands::Context { goal, dir, budget } => {
            let dir = dir.canonicalize().context("working directory not found")?;
            let mut engine = ContextEngine::new(&dir);
            engine.index_repository().await?;

            let result = engine.retrieve(&goal, budget).await;
            let files: Vec<serde_json::Value> = result
                .files
                .iter()
                .map(|f| {
                    serde_json::json!({
                        "path": f.path,
                        "hash": f.hash,
                        "tokens": f.estimated_tokens,
                        "full_content": f.content.is_some(),
                    })
                })
                .collect();

            let output = serde_json::json!({
                "files": files,
                "symbols": result.symbols,
                "tests": result.tests,
                "configs": result.configs,
                "guides": result.guides,
                "token_count": result.token_count,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
