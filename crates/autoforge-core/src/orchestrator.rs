//! Multi-task orchestration: priority-ordered scheduling with dependency
//! gating and a fixed parallelism cap.
//!
//! Tasks are independent (each owns its working directory); a task becomes
//! eligible only when every task it depends on has terminated successfully.
//! Tasks whose dependencies failed are reported as aborted without running.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use autoforge_llm::LlmProvider;

use crate::domain::{RunStatus, Task, TaskReport};
use crate::fsm::ControlLoop;
use crate::policy::PolicyConfig;
use crate::sandbox::Sandbox;

/// Runs a batch of tasks through per-task control loops.
pub struct TaskOrchestrator {
    provider: Arc<dyn LlmProvider>,
    model: String,
    sandbox: Arc<dyn Sandbox>,
    policy_config: PolicyConfig,
    max_parallel: usize,
    trace_dir: Option<PathBuf>,
}

impl TaskOrchestrator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        model: impl Into<String>,
        sandbox: Arc<dyn Sandbox>,
        policy_config: PolicyConfig,
        max_parallel: usize,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            sandbox,
            policy_config,
            max_parallel: max_parallel.max(1),
            trace_dir: None,
        }
    }

    pub fn with_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(dir.into());
        self
    }

    /// Run one task to completion.
    pub async fn run_task(&self, task: Task) -> TaskReport {
        let mut control_loop = ControlLoop::new(
            task,
            Arc::clone(&self.provider),
            self.model.clone(),
            Arc::clone(&self.sandbox),
            self.policy_config.clone(),
        );
        if let Some(dir) = &self.trace_dir {
            control_loop = control_loop.with_trace_dir(dir.clone());
        }
        control_loop.run().await
    }

    /// Run all tasks, honoring priorities and dependency edges. Returns the
    /// reports keyed by task id.
    pub async fn run_all(&self, tasks: Vec<Task>) -> BTreeMap<String, TaskReport> {
        let mut reports: BTreeMap<String, TaskReport> = BTreeMap::new();
        let mut pending = tasks;
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));

        while !pending.is_empty() {
            // Tasks whose dependencies failed can never run.
            let mut still_pending = Vec::new();
            for task in pending {
                let failed_dep = task.depends_on.iter().find(|dep| {
                    reports
                        .get(dep.as_str())
                        .map(|r| r.status != RunStatus::Success)
                        .unwrap_or(false)
                });
                match failed_dep {
                    Some(dep) => {
                        warn!("task {} skipped: dependency {dep} failed", task.id);
                        reports.insert(task.id.clone(), dependency_abort(&task, dep));
                    }
                    None => still_pending.push(task),
                }
            }

            // Eligible: every dependency already succeeded.
            let (mut eligible, blocked): (Vec<Task>, Vec<Task>) =
                still_pending.into_iter().partition(|task| {
                    task.depends_on.iter().all(|dep| {
                        reports
                            .get(dep.as_str())
                            .map(|r| r.status == RunStatus::Success)
                            .unwrap_or(false)
                    })
                });

            if eligible.is_empty() {
                for task in &blocked {
                    warn!("task {} has unresolvable dependencies", task.id);
                    reports.insert(
                        task.id.clone(),
                        dependency_abort(task, &task.depends_on.join(", ")),
                    );
                }
                break;
            }

            // Higher priority first; stable on insertion order for ties.
            eligible.sort_by(|a, b| b.priority.cmp(&a.priority));
            info!("scheduling {} eligible tasks", eligible.len());

            let mut join_set: JoinSet<TaskReport> = JoinSet::new();
            for task in eligible {
                let permit_sem = Arc::clone(&semaphore);
                let provider = Arc::clone(&self.provider);
                let sandbox = Arc::clone(&self.sandbox);
                let model = self.model.clone();
                let policy_config = self.policy_config.clone();
                let trace_dir = self.trace_dir.clone();

                join_set.spawn(async move {
                    let _permit = permit_sem.acquire_owned().await.expect("semaphore open");
                    let mut control_loop =
                        ControlLoop::new(task, provider, model, sandbox, policy_config);
                    if let Some(dir) = trace_dir {
                        control_loop = control_loop.with_trace_dir(dir);
                    }
                    control_loop.run().await
                });
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(report) => {
                        reports.insert(report.task_id.clone(), report);
                    }
                    Err(e) => warn!("task join error: {e}"),
                }
            }

            pending = blocked;
        }

        reports
    }
}

fn dependency_abort(task: &Task, dep: &str) -> TaskReport {
    let mut artifacts = BTreeMap::new();
    artifacts.insert("status".to_string(), serde_json::json!("aborted"));
    artifacts.insert(
        "abort_reason".to_string(),
        serde_json::json!(format!("Dependency failed: {dep}")),
    );
    TaskReport {
        task_id: task.id.clone(),
        goal: task.goal.clone(),
        status: RunStatus::Aborted,
        duration: 0.0,
        state_durations: BTreeMap::new(),
        retry_count: 0,
        token_usage: 0,
        final_state: "ABORT".to_string(),
        artifacts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use autoforge_llm::scripted::ScriptedProvider;

    use crate::sandbox::LocalSandbox;

    fn orchestrator(responses: &[&str]) -> TaskOrchestrator {
        TaskOrchestrator::new(
            Arc::new(ScriptedProvider::from_slices(responses)),
            "test-model",
            Arc::new(LocalSandbox::new()),
            PolicyConfig::default(),
            2,
        )
    }

    #[tokio::test]
    async fn test_run_all_reports_every_task() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        // Each task consumes a plan call and an edit call; free-text edits
        // resolve as query-only answers, which is enough for scheduling
        // semantics.
        let orchestrator = orchestrator(&["prose", "prose", "prose", "prose"]);

        let task_a = Task::new(dir_a.path(), "first goal");
        let task_b = Task::new(dir_b.path(), "second goal");
        let ids = vec![task_a.id.clone(), task_b.id.clone()];

        let reports = orchestrator.run_all(vec![task_a, task_b]).await;
        assert_eq!(reports.len(), 2);
        for id in ids {
            assert!(reports.contains_key(&id));
        }
    }

    #[tokio::test]
    async fn test_dependent_task_skipped_when_dependency_fails() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        // First task aborts: its working dir is removed before the run.
        let mut failing = Task::new(dir_a.path().join("gone"), "will fail");
        failing.id = "task-a".to_string();
        let dependent = Task::new(dir_b.path(), "depends on a")
            .with_dependency("task-a");
        let dependent_id = dependent.id.clone();

        let orchestrator = orchestrator(&["prose", "prose"]);
        let reports = orchestrator.run_all(vec![failing, dependent]).await;

        assert_eq!(reports["task-a"].status, RunStatus::Aborted);
        let dependent_report = &reports[&dependent_id];
        assert_eq!(dependent_report.status, RunStatus::Aborted);
        assert!(dependent_report.artifacts["abort_reason"]
            .as_str()
            .unwrap()
            .contains("Dependency failed"));
    }

    #[tokio::test]
    async fn test_unknown_dependency_is_unresolvable() {
        let dir = tempdir().unwrap();
        let task = Task::new(dir.path(), "goal").with_dependency("no-such-task");
        let id = task.id.clone();

        let orchestrator = orchestrator(&[]);
        let reports = orchestrator.run_all(vec![task]).await;
        assert_eq!(reports[&id].status, RunStatus::Aborted);
    }

    #[tokio::test]
    async fn test_dependency_chain_runs_in_order() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let mut first = Task::new(dir_a.path(), "first");
        first.id = "first".to_string();
        let second = Task::new(dir_b.path(), "second").with_dependency("first");
        let second_id = second.id.clone();

        let orchestrator = orchestrator(&["prose", "prose", "prose", "prose"]);
        let reports = orchestrator.run_all(vec![second.clone(), first]).await;

        assert_eq!(reports["first"].status, RunStatus::Success);
        assert_eq!(reports[&second_id].status, RunStatus::Success);
    }
}
