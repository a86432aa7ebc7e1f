//! Tool contract and registry.
//!
//! External collaborators invoke the system's sub-utilities through this
//! seam: every tool exposes a JSON-Schema parameter contract and returns a
//! structured [`ToolResult`]. Dispatch goes through an explicit
//! [`ToolRegistry`]; unknown names fail deterministically instead of being
//! discovered at runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{ForgeError, Result};

/// Outcome status of a tool run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
    Blocked,
}

/// Structured result of a tool run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Success,
            output: Some(output.into()),
            error: None,
            metadata: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            output: None,
            error: Some(message.into()),
            metadata: None,
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Blocked,
            output: None,
            error: Some(reason.into()),
            metadata: None,
        }
    }
}

/// A leaf utility exposed to external collaborators.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    fn use_cases(&self) -> Vec<String> {
        Vec::new()
    }

    /// JSON Schema for the tool's parameters, with a `required` list.
    fn schema(&self) -> serde_json::Value;

    /// Perform the tool's work. Implementations may assume required
    /// parameters are present; [`ToolRegistry::run`] validates first.
    async fn execute(&self, params: &serde_json::Value) -> ToolResult;
}

/// Explicit name-to-tool mapping.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Validate required parameters against the tool's schema, then run it.
    /// Unknown tool names are an error, never a silent no-op.
    pub async fn run(&self, name: &str, params: &serde_json::Value) -> Result<ToolResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ForgeError::UnknownTool(name.to_string()))?;

        if let Some(missing) = missing_required(&tool.schema(), params) {
            return Ok(ToolResult::error(format!(
                "Missing required parameter: {missing}"
            )));
        }

        Ok(tool.execute(params).await)
    }
}

fn missing_required(schema: &serde_json::Value, params: &serde_json::Value) -> Option<String> {
    let required = schema.get("required")?.as_array()?;
    for field in required.iter().filter_map(|f| f.as_str()) {
        if params.get(field).is_none() {
            return Some(field.to_string());
        }
    }
    None
}
