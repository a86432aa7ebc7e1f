//! Task inputs and the final report returned by the control loop.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-run resource limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskLimits {
    /// Maximum failed edit/test attempts before aborting.
    pub max_retries: u32,
    /// Wall-clock cap for the whole run.
    #[serde(with = "duration_secs")]
    pub max_duration: Duration,
    /// Token budget for the whole run.
    pub max_tokens: u64,
}

impl Default for TaskLimits {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_duration: Duration::from_secs(30 * 60),
            max_tokens: 100_000,
        }
    }
}

/// Inputs of a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Absolute path to the working copy.
    pub working_dir: PathBuf,
    /// Natural-language goal.
    pub goal: String,
    /// Free-form constraints forwarded to the model.
    #[serde(default)]
    pub constraints: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub limits: TaskLimits,
    /// Scheduling priority for the multi-task orchestrator; higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Task ids that must terminate successfully before this task is eligible.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Task {
    pub fn new(working_dir: impl Into<PathBuf>, goal: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            working_dir: working_dir.into(),
            goal: goal.into(),
            constraints: BTreeMap::new(),
            limits: TaskLimits::default(),
            priority: 0,
            depends_on: Vec::new(),
        }
    }

    pub fn with_limits(mut self, limits: TaskLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, task_id: impl Into<String>) -> Self {
        self.depends_on.push(task_id.into());
        self
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Aborted,
}

/// Final report returned when the control loop terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub goal: String,
    pub status: RunStatus,
    /// Total wall-clock seconds.
    pub duration: f64,
    /// Seconds spent in each state, keyed by state name.
    pub state_durations: BTreeMap<String, f64>,
    pub retry_count: u32,
    pub token_usage: u64,
    pub final_state: String,
    pub artifacts: BTreeMap<String, serde_json::Value>,
}

mod duration_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_defaults() {
        let task = Task::new("/tmp/repo", "add logging");
        assert_eq!(task.limits.max_retries, 3);
        assert_eq!(task.limits.max_tokens, 100_000);
        assert_eq!(task.priority, 0);
        assert!(task.depends_on.is_empty());
        assert!(!task.id.is_empty());
    }

    #[test]
    fn test_task_builder_chain() {
        let task = Task::new("/tmp/repo", "goal")
            .with_priority(5)
            .with_dependency("other-task");
        assert_eq!(task.priority, 5);
        assert_eq!(task.depends_on, vec!["other-task".to_string()]);
    }

    #[test]
    fn test_limits_serde_roundtrip() {
        let limits = TaskLimits {
            max_retries: 2,
            max_duration: Duration::from_secs(90),
            max_tokens: 5_000,
        };
        let json = serde_json::to_string(&limits).unwrap();
        let back: TaskLimits = serde_json::from_str(&json).unwrap();
        assert_eq!(limits, back);
    }

    #[test]
    fn test_run_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Success).unwrap(),
            "\"success\""
        );
        assert_eq!(
            serde_json::to_string(&RunStatus::Aborted).unwrap(),
            "\"aborted\""
        );
    }
}
