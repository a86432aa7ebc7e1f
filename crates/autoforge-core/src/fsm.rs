//! Control loop: the finite-state machine that coordinates the engines.
//!
//! States: INGEST -> PLAN -> EDIT -> TEST -> DONE, with EDIT -> DONE for
//! query-only answers, TEST -> ITERATE -> EDIT for repair loops,
//! EDIT -> ITERATE for patch rejects, and ABORT reachable from every
//! non-terminal state past INGEST. Transition predicates are evaluated in
//! order; the first satisfied one wins. The global-abort predicate (time,
//! tokens, retries) is checked at the top of every loop turn and inside the
//! transition rules that name it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{error, info, warn};

use autoforge_llm::LlmProvider;

use crate::adapter::ModelAdapter;
use crate::context::ContextEngine;
use crate::domain::{ForgeError, Plan, Result, RunStatus, Task, TaskLimits, TaskReport};
use crate::patch::PatchEngine;
use crate::policy::{PolicyConfig, PolicyEngine};
use crate::sandbox::Sandbox;
use crate::testrun::{TestReport, TestRunner};
use crate::trace::{write_plan_snapshot, TraceCollector};

/// Sentinel final diff for runs that answered a question instead of editing.
pub const QUERY_ONLY_DIFF: &str = "# No changes needed for query";

/// FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Ingest,
    Plan,
    Edit,
    Test,
    Iterate,
    Done,
    Abort,
}

impl OrchestratorState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ingest => "INGEST",
            Self::Plan => "PLAN",
            Self::Edit => "EDIT",
            Self::Test => "TEST",
            Self::Iterate => "ITERATE",
            Self::Done => "DONE",
            Self::Abort => "ABORT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Abort)
    }
}

/// Mutable state threaded through the FSM; created once per task and
/// mutated only by state handlers.
pub struct OrchestratorContext {
    pub task_id: String,
    pub working_dir: PathBuf,
    pub goal: String,
    pub constraints: serde_json::Value,
    pub limits: TaskLimits,

    pub current_state: OrchestratorState,
    pub plan: Option<Plan>,
    pub proposed_diff: Option<String>,
    pub applied_patches: Vec<String>,
    pub test_results: Option<TestReport>,

    pub start_time: Instant,
    pub state_durations: BTreeMap<String, f64>,
    pub retry_count: u32,
    pub token_usage: u64,

    pub artifacts: BTreeMap<String, serde_json::Value>,
}

impl OrchestratorContext {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            working_dir: task.working_dir.clone(),
            goal: task.goal.clone(),
            constraints: serde_json::to_value(&task.constraints).unwrap_or(json!({})),
            limits: task.limits.clone(),
            current_state: OrchestratorState::Ingest,
            plan: None,
            proposed_diff: None,
            applied_patches: Vec::new(),
            test_results: None,
            start_time: Instant::now(),
            state_durations: BTreeMap::new(),
            retry_count: 0,
            token_usage: 0,
            artifacts: BTreeMap::new(),
        }
    }

    fn query_only(&self) -> bool {
        self.artifacts
            .get("query_only")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn tests_passing(&self) -> bool {
        self.test_results.as_ref().map(|r| r.passed).unwrap_or(false)
    }

    fn patch_rejected(&self) -> bool {
        self.artifacts.contains_key("patch_rejects")
    }

    /// Wall-clock over cap, token budget blown, or retries exhausted.
    pub fn should_abort(&self) -> bool {
        self.start_time.elapsed() >= self.limits.max_duration
            || self.token_usage > self.limits.max_tokens
            || self.retry_count >= self.limits.max_retries
    }

    /// First satisfied transition, in table order.
    pub fn next_state(&self) -> Option<OrchestratorState> {
        use OrchestratorState::*;
        match self.current_state {
            Ingest => self.working_dir.exists().then_some(Plan),
            Plan => {
                if self.should_abort() {
                    Some(Abort)
                } else if self.plan.is_some() {
                    Some(Edit)
                } else {
                    None
                }
            }
            Edit => {
                if self.should_abort() {
                    Some(Abort)
                } else if self.proposed_diff.is_some() && self.query_only() {
                    Some(Done)
                } else if self.proposed_diff.is_some() {
                    Some(Test)
                } else if self.patch_rejected() {
                    Some(Iterate)
                } else {
                    None
                }
            }
            Test => {
                if self.should_abort() {
                    Some(Abort)
                } else if self.tests_passing() {
                    Some(Done)
                } else if self.retry_count < self.limits.max_retries {
                    Some(Iterate)
                } else {
                    None
                }
            }
            Iterate => {
                if self.retry_count >= self.limits.max_retries {
                    Some(Abort)
                } else {
                    Some(Edit)
                }
            }
            Done | Abort => None,
        }
    }

    fn abort_reason(&self) -> String {
        if self.start_time.elapsed() >= self.limits.max_duration {
            format!(
                "Timeout: exceeded {}s",
                self.limits.max_duration.as_secs()
            )
        } else if self.token_usage > self.limits.max_tokens {
            format!(
                "Token limit: {} > {}",
                self.token_usage, self.limits.max_tokens
            )
        } else if self.retry_count >= self.limits.max_retries {
            format!(
                "Retry limit: {} >= {}",
                self.retry_count, self.limits.max_retries
            )
        } else if let Some(error) = self.artifacts.get("error").and_then(|e| e.as_str()) {
            error.to_string()
        } else {
            "Unknown abort reason".to_string()
        }
    }
}

/// The control loop, wired to one task's working directory.
pub struct ControlLoop {
    task: Task,
    context_engine: ContextEngine,
    patch_engine: PatchEngine,
    policy: PolicyEngine,
    test_runner: TestRunner,
    adapter: ModelAdapter,
    sandbox: Arc<dyn Sandbox>,
    trace: Arc<TraceCollector>,
    trace_dir: Option<PathBuf>,
}

impl ControlLoop {
    pub fn new(
        task: Task,
        provider: Arc<dyn LlmProvider>,
        model: impl Into<String>,
        sandbox: Arc<dyn Sandbox>,
        policy_config: PolicyConfig,
    ) -> Self {
        let working_dir = task.working_dir.clone();
        let trace = Arc::new(TraceCollector::new());
        trace.set_session_id(task.id.clone());

        Self {
            context_engine: ContextEngine::new(&working_dir),
            patch_engine: PatchEngine::new(&working_dir),
            policy: PolicyEngine::new(policy_config),
            test_runner: TestRunner::new(&working_dir, Arc::clone(&sandbox)),
            adapter: ModelAdapter::new(provider, model),
            sandbox,
            trace,
            trace_dir: None,
            task,
        }
    }

    /// Emit the trace file and plan snapshots under `dir/<task_id>/`.
    pub fn with_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(dir.into().join(&self.task.id));
        self
    }

    /// Paths currently snapshotted by the patch engine (test hook).
    pub fn snapshot_paths(&self) -> Vec<PathBuf> {
        self.patch_engine.snapshot_paths()
    }

    /// Drive the task to DONE or ABORT and return the report.
    pub async fn run(mut self) -> TaskReport {
        let mut ctx = OrchestratorContext::for_task(&self.task);
        info!("starting task {}: {}", ctx.task_id, ctx.goal);

        while !ctx.current_state.is_terminal() {
            if ctx.should_abort() {
                ctx.current_state = OrchestratorState::Abort;
                break;
            }

            let state = ctx.current_state;
            let call = self
                .trace
                .start_call("fsm", state.name(), json!({"task_id": ctx.task_id}));
            let state_start = Instant::now();

            let outcome = self.run_handler(state, &mut ctx).await;

            let elapsed = state_start.elapsed().as_secs_f64();
            *ctx.state_durations.entry(state.name().to_string()).or_insert(0.0) += elapsed;

            match outcome {
                Ok(()) => self.trace.end_call(call, None, None),
                Err(e) => {
                    error!("task {}: {} failed: {e}", ctx.task_id, state.name());
                    self.trace.end_call(call, Some(e.to_string()), None);
                    ctx.artifacts
                        .insert("error".to_string(), json!(e.to_string()));
                    ctx.current_state = OrchestratorState::Abort;
                    break;
                }
            }

            match ctx.next_state() {
                Some(next) => {
                    info!(
                        "task {}: {} -> {}",
                        ctx.task_id,
                        state.name(),
                        next.name()
                    );
                    ctx.current_state = next;
                }
                None => {
                    error!("task {}: no valid transition from {}", ctx.task_id, state.name());
                    ctx.current_state = OrchestratorState::Abort;
                }
            }
        }

        match ctx.current_state {
            OrchestratorState::Done => self.handle_done(&mut ctx),
            _ => self.handle_abort(&mut ctx),
        }

        if let Some(dir) = &self.trace_dir {
            if let Err(e) = self.trace.save_to_file(&dir.join("trace.json")) {
                warn!("failed to write trace file: {e}");
            }
        }

        self.report(ctx)
    }

    async fn run_handler(
        &mut self,
        state: OrchestratorState,
        ctx: &mut OrchestratorContext,
    ) -> Result<()> {
        match state {
            OrchestratorState::Ingest => self.handle_ingest(ctx).await,
            OrchestratorState::Plan => self.handle_plan(ctx).await,
            OrchestratorState::Edit => self.handle_edit(ctx).await,
            OrchestratorState::Test => self.handle_test(ctx).await,
            OrchestratorState::Iterate => self.handle_iterate(ctx).await,
            OrchestratorState::Done | OrchestratorState::Abort => Ok(()),
        }
    }

    /// INGEST: verify the working copy, detect the stack, build the index.
    async fn handle_ingest(&mut self, ctx: &mut OrchestratorContext) -> Result<()> {
        if !ctx.working_dir.exists() {
            return Err(ForgeError::WorkingDirMissing(ctx.working_dir.clone()));
        }

        let stack = self.sandbox.detect_stack(&ctx.working_dir).await?;
        ctx.artifacts
            .insert("stack_info".to_string(), serde_json::to_value(&stack)?);

        self.context_engine.index_repository().await?;
        info!("ingested repository: {:?}", stack.languages);
        Ok(())
    }

    /// PLAN: retrieve context, ask the model for a plan, gate it, store it.
    async fn handle_plan(&mut self, ctx: &mut OrchestratorContext) -> Result<()> {
        let budget = (ctx.limits.max_tokens / 3).min(10_000);
        let retrieval = self.context_engine.retrieve(&ctx.goal, budget).await;

        let model_plan = self
            .adapter
            .create_plan(&ctx.goal, &retrieval, &ctx.constraints)
            .await?;
        ctx.token_usage = self.adapter.consumed_tokens();

        let plan = model_plan.into_plan();

        let validation = self.policy.validate_plan(&plan).await;
        if !validation.is_valid {
            return Err(ForgeError::PolicyViolation(format!(
                "plan rejected: {}",
                validation.reasons.join("; ")
            )));
        }

        ctx.artifacts
            .insert("plan".to_string(), serde_json::to_value(&plan)?);
        self.snapshot_plan(ctx, &plan);
        ctx.plan = Some(plan);
        Ok(())
    }

    /// EDIT: ask the model for a diff, gate it, validate and apply it.
    async fn handle_edit(&mut self, ctx: &mut OrchestratorContext) -> Result<()> {
        // A fresh attempt; stale results from the previous round must not
        // influence the next transition.
        ctx.proposed_diff = None;
        ctx.artifacts.remove("patch_rejects");

        let budget = (ctx.limits.max_tokens / 2).min(15_000);
        let retrieval = self.context_engine.retrieve(&ctx.goal, budget).await;

        let plan = ctx.plan.clone().unwrap_or_default();
        let diff = self
            .adapter
            .propose_patch(&plan, &retrieval, &ctx.applied_patches)
            .await?;
        ctx.token_usage = self.adapter.consumed_tokens();

        let validation = self.policy.validate_diff(&diff).await;
        if !validation.is_valid {
            return Err(ForgeError::PolicyViolation(format!(
                "diff rejected: {}",
                validation.reasons.join("; ")
            )));
        }

        // Query-only answer: no diff markers, or (almost) no content.
        if !diff.starts_with("---") || diff.lines().count() < 3 {
            ctx.proposed_diff = Some(QUERY_ONLY_DIFF.to_string());
            ctx.artifacts.insert("response".to_string(), json!(diff));
            ctx.artifacts.insert("query_only".to_string(), json!(true));
            return Ok(());
        }

        let patch_validation = self.patch_engine.validate(&diff).await;
        if !patch_validation.is_valid {
            warn!("patch validation failed: {:?}", patch_validation.errors);
            ctx.artifacts.insert(
                "patch_rejects".to_string(),
                json!({
                    "errors": patch_validation.errors,
                    "rejects": patch_validation.rejects,
                }),
            );
            return Ok(());
        }

        let apply_result = self.patch_engine.apply(&diff).await?;
        if !apply_result.success {
            warn!(
                "patch application failed: {} hunks rejected",
                apply_result.failed_hunks
            );
            ctx.artifacts.insert(
                "patch_rejects".to_string(),
                json!({
                    "errors": [],
                    "rejects": apply_result.rejects,
                }),
            );
            return Ok(());
        }

        ctx.proposed_diff = Some(diff.clone());
        ctx.applied_patches.push(diff.clone());
        ctx.artifacts
            .insert("diffs".to_string(), json!(ctx.applied_patches));

        let mut applied = ctx
            .artifacts
            .get("applied_patches")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        applied.push(json!({
            "diff": diff,
            "modified_files": apply_result.modified_files,
            "fuzzy_matches": apply_result.fuzzy_matches,
        }));
        ctx.artifacts
            .insert("applied_patches".to_string(), json!(applied));
        Ok(())
    }

    /// TEST: targeted run first, full suite on a targeted pass.
    async fn handle_test(&mut self, ctx: &mut OrchestratorContext) -> Result<()> {
        let diff = ctx.proposed_diff.clone().unwrap_or_default();
        let impact = self.context_engine.analyze_changes(&diff).await;
        ctx.artifacts
            .insert("impacted".to_string(), serde_json::to_value(&impact)?);

        let targeted = self.test_runner.run_targeted(&impact).await;
        ctx.artifacts.insert(
            "targeted_test_results".to_string(),
            serde_json::to_value(&targeted)?,
        );
        let targeted_passed = targeted.passed;
        ctx.test_results = Some(targeted);

        if targeted_passed {
            let full = self.test_runner.run_full().await;
            ctx.artifacts.insert(
                "full_test_results".to_string(),
                serde_json::to_value(&full)?,
            );
            let full_passed = full.passed;
            ctx.test_results = Some(full);

            if full_passed {
                if let Some(plan) = ctx.plan.as_mut() {
                    plan.complete_next_step(Some(json!({"tests_passed": true})), None);
                }
                let plan = ctx.plan.clone();
                if let Some(plan) = plan {
                    self.snapshot_plan(ctx, &plan);
                }
            }
        }
        Ok(())
    }

    /// ITERATE: count the failed attempt, build a minimal failure context,
    /// stash the model's repair suggestion on the plan.
    async fn handle_iterate(&mut self, ctx: &mut OrchestratorContext) -> Result<()> {
        // The single retry counter: exactly one increment per EDIT attempt
        // that did not produce a clean pass, whether it died on patch
        // rejects or on test failures.
        ctx.retry_count += 1;

        let failure_context = if let Some(report) = ctx.test_results.as_ref().filter(|r| !r.passed)
        {
            match self.test_runner.extract_minimal_failure(report) {
                Some(minimal) => serde_json::to_value(&minimal)?,
                None => json!({}),
            }
        } else if let Some(rejects) = ctx.artifacts.get("patch_rejects") {
            rejects.clone()
        } else {
            json!({})
        };

        let plan = ctx.plan.clone().unwrap_or_default();
        let repair = self
            .adapter
            .suggest_repair(&failure_context, &ctx.applied_patches, &plan)
            .await?;
        ctx.token_usage = self.adapter.consumed_tokens();

        if let Some(plan) = ctx.plan.as_mut() {
            plan.metadata
                .insert("repair_suggestion".to_string(), serde_json::to_value(&repair)?);
        }
        let plan = ctx.plan.clone();
        if let Some(plan) = plan {
            self.snapshot_plan(ctx, &plan);
        }
        Ok(())
    }

    fn handle_done(&self, ctx: &mut OrchestratorContext) {
        info!("task {}: completed successfully", ctx.task_id);
        ctx.artifacts
            .insert("status".to_string(), json!("success"));
        ctx.artifacts.insert(
            "final_diff".to_string(),
            json!(ctx.proposed_diff.clone().unwrap_or_default()),
        );
        ctx.artifacts.insert(
            "duration".to_string(),
            json!(ctx.start_time.elapsed().as_secs_f64()),
        );
    }

    fn handle_abort(&self, ctx: &mut OrchestratorContext) {
        let reason = ctx.abort_reason();
        error!("task {}: aborted: {reason}", ctx.task_id);
        ctx.current_state = OrchestratorState::Abort;
        ctx.artifacts
            .insert("status".to_string(), json!("aborted"));
        ctx.artifacts
            .insert("abort_reason".to_string(), json!(reason));
        ctx.artifacts.insert(
            "duration".to_string(),
            json!(ctx.start_time.elapsed().as_secs_f64()),
        );
    }

    fn snapshot_plan(&self, ctx: &OrchestratorContext, plan: &Plan) {
        if let Some(dir) = &self.trace_dir {
            if let Err(e) = write_plan_snapshot(dir, &ctx.goal, plan) {
                warn!("failed to write plan snapshot: {e}");
            }
        }
    }

    fn report(&self, ctx: OrchestratorContext) -> TaskReport {
        let status = match ctx.artifacts.get("status").and_then(|s| s.as_str()) {
            Some("success") => RunStatus::Success,
            _ => RunStatus::Aborted,
        };
        TaskReport {
            task_id: ctx.task_id,
            goal: ctx.goal,
            status,
            duration: ctx.start_time.elapsed().as_secs_f64(),
            state_durations: ctx.state_durations,
            retry_count: ctx.retry_count,
            token_usage: ctx.token_usage,
            final_state: ctx.current_state.name().to_string(),
            artifacts: ctx.artifacts,
        }
    }
}
