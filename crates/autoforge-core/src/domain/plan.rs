//! Execution plans and their cache-friendly serialization.
//!
//! A [`Plan`] is an ordered partition of steps into `completed` and `todo`.
//! Serialization always emits `completed` before `todo`, so that as steps
//! move from `todo` to `completed` (without reordering inside either
//! partition) the serialized prefix is monotonically non-decreasing. Prompt
//! builders that embed the serialized plan therefore keep a stable prefix
//! across iterations, which lets the model host reuse its prompt cache.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::Result;

/// Terminal status of an executed step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StepStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
}

/// A single step in an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub tool_name: String,
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Indices of steps this one depends on.
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// `None` until the step has been executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Step {
    pub fn new(tool_name: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
            description: None,
            depends_on: Vec::new(),
            result: None,
            status: None,
            error_message: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// An ordered plan: completed steps first, pending steps after.
///
/// Field order matters: serde emits struct fields in declaration order, and
/// the prefix-stability property depends on `completed` preceding `todo`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    #[serde(default)]
    pub completed: Vec<Step>,
    #[serde(default)]
    pub todo: Vec<Step>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Plan {
    /// A plan with a single pending step.
    pub fn single_step(step: Step) -> Self {
        Self {
            completed: Vec::new(),
            todo: vec![step],
            metadata: BTreeMap::new(),
        }
    }

    /// All steps, completed first.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.completed.iter().chain(self.todo.iter())
    }

    pub fn is_complete(&self) -> bool {
        self.todo.is_empty()
    }

    pub fn has_failed(&self) -> bool {
        self.completed
            .iter()
            .any(|s| s.status == Some(StepStatus::Failure))
    }

    /// Move the next pending step to `completed`, stamping it with a result
    /// or an error. Returns the moved step, or `None` when nothing is
    /// pending.
    pub fn complete_next_step(
        &mut self,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Option<&Step> {
        if self.todo.is_empty() {
            return None;
        }
        let mut step = self.todo.remove(0);
        if let Some(result) = result {
            step.result = Some(result);
            step.status = Some(StepStatus::Success);
        }
        if let Some(error) = error {
            step.error_message = Some(error);
            step.status = Some(StepStatus::Failure);
        }
        self.completed.push(step);
        self.completed.last()
    }

    /// Pretty-printed JSON with the `completed`-before-`todo` key order.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn three_step_plan() -> Plan {
        Plan {
            completed: Vec::new(),
            todo: vec![
                Step::new("analyze", json!({"files": []})).with_description("inspect layout"),
                Step::new("edit", json!({"files": ["a.py"]})),
                Step::new("test", json!({})),
            ],
            metadata: BTreeMap::new(),
        }
    }

    fn common_prefix_len(a: &str, b: &str) -> usize {
        a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
    }

    #[test]
    fn test_complete_next_step_moves_in_order() {
        let mut plan = three_step_plan();
        let step = plan.complete_next_step(Some(json!({"ok": true})), None).unwrap();
        assert_eq!(step.tool_name, "analyze");
        assert_eq!(step.status, Some(StepStatus::Success));
        assert_eq!(plan.completed.len(), 1);
        assert_eq!(plan.todo.len(), 2);
        assert!(!plan.is_complete());
    }

    #[test]
    fn test_complete_next_step_records_failure() {
        let mut plan = three_step_plan();
        plan.complete_next_step(None, Some("boom".to_string()));
        assert!(plan.has_failed());
        assert_eq!(
            plan.completed[0].error_message.as_deref(),
            Some("boom")
        );
    }

    #[test]
    fn test_complete_next_step_on_empty_todo() {
        let mut plan = Plan::default();
        assert!(plan.complete_next_step(None, None).is_none());
    }

    #[test]
    fn test_serialization_emits_completed_before_todo() {
        let mut plan = three_step_plan();
        plan.complete_next_step(Some(json!(1)), None);
        let json = plan.to_json().unwrap();
        let completed_at = json.find("\"completed\"").unwrap();
        let todo_at = json.find("\"todo\"").unwrap();
        assert!(completed_at < todo_at);
    }

    #[test]
    fn test_serialized_prefix_is_monotone_under_completion() {
        let mut plan = three_step_plan();
        plan.complete_next_step(Some(json!(1)), None);
        let before = plan.to_json().unwrap();

        let mut advanced = plan.clone();
        advanced.complete_next_step(Some(json!(2)), None);
        let after = advanced.to_json().unwrap();

        // The shared prefix must cover everything up to the end of the last
        // previously-completed entry: the first completed step's serialized
        // body is entirely inside it.
        let prefix_len = common_prefix_len(&before, &after);
        let first_step_end = before.find("\"analyze\"").unwrap() + "\"analyze\"".len();
        assert!(prefix_len >= first_step_end);
        assert!(before[..prefix_len].contains("\"completed\""));
    }

    #[test]
    fn test_plan_serde_roundtrip() {
        let mut plan = three_step_plan();
        plan.metadata
            .insert("risk_level".to_string(), json!("low"));
        plan.complete_next_step(Some(json!({"n": 1})), None);

        let json = plan.to_json().unwrap();
        let back = Plan::from_json(&json).unwrap();
        assert_eq!(plan, back);
    }

    #[test]
    fn test_steps_iterates_completed_first() {
        let mut plan = three_step_plan();
        plan.complete_next_step(None, Some("failed".into()));
        let names: Vec<_> = plan.steps().map(|s| s.tool_name.as_str()).collect();
        assert_eq!(names, vec!["analyze", "edit", "test"]);
    }
}
