//! Model Adapter: turns orchestrator intents into prompts and enforces
//! output shape.
//!
//! Three operations, each deterministic modulo the model: `create_plan`,
//! `propose_patch`, `suggest_repair`. Malformed model output never
//! propagates upward; every operation has a concrete fallback value so the
//! control loop can always make forward progress.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use autoforge_llm::{ChatRequest, LlmProvider};

use crate::context::RetrievalResult;
use crate::domain::{ForgeError, Plan, Result, Step};

const SYSTEM_PROMPT: &str = "You are an expert software engineer working on an automated \
code-modification pipeline. Be precise and follow the requested output format exactly.";

/// One step of a model-produced plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelPlanStep {
    #[serde(default)]
    pub id: u64,
    pub description: String,
    /// `analyze`, `edit`, or `test`.
    pub action: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

/// The plan shape requested from the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelPlan {
    pub steps: Vec<ModelPlanStep>,
    #[serde(default)]
    pub estimated_changes: u64,
    #[serde(default)]
    pub risk_level: String,
    #[serde(default)]
    pub dependencies: serde_json::Value,
    #[serde(default)]
    pub test_strategy: String,
}

impl ModelPlan {
    /// Fallback plan used whenever the model output cannot be parsed.
    pub fn fallback() -> Self {
        Self {
            steps: vec![ModelPlanStep {
                id: 1,
                description: "Analyze project structure".to_string(),
                action: "analyze".to_string(),
                files: Vec::new(),
                rationale: "Understanding codebase before changes".to_string(),
            }],
            estimated_changes: 10,
            risk_level: "low".to_string(),
            dependencies: json!({"add": [], "remove": []}),
            test_strategy: "Run existing tests".to_string(),
        }
    }

    fn is_valid(&self) -> bool {
        !self.steps.is_empty()
            && self
                .steps
                .iter()
                .all(|s| !s.description.is_empty() && !s.action.is_empty())
    }

    /// Convert into the domain [`Plan`]: every model step becomes a pending
    /// step, the remaining fields land in plan metadata.
    pub fn into_plan(self) -> Plan {
        let mut plan = Plan::default();
        for step in &self.steps {
            plan.todo.push(
                Step::new(
                    step.action.clone(),
                    json!({"id": step.id, "files": step.files, "rationale": step.rationale}),
                )
                .with_description(step.description.clone()),
            );
        }
        plan.metadata
            .insert("estimated_changes".to_string(), json!(self.estimated_changes));
        plan.metadata
            .insert("risk_level".to_string(), json!(self.risk_level));
        plan.metadata
            .insert("dependencies".to_string(), self.dependencies);
        plan.metadata
            .insert("test_strategy".to_string(), json!(self.test_strategy));
        plan
    }
}

/// Repair suggestion produced after a failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairSuggestion {
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub repair_strategy: String,
    #[serde(default)]
    pub modified_plan: serde_json::Value,
    #[serde(default)]
    pub confidence: String,
}

/// Stateless adapter between the control loop and an [`LlmProvider`].
pub struct ModelAdapter {
    provider: Arc<dyn LlmProvider>,
    model: String,
    tokens: AtomicU64,
}

impl ModelAdapter {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            tokens: AtomicU64::new(0),
        }
    }

    /// Tokens consumed so far: provider-reported usage when present,
    /// otherwise (prompt chars + completion chars) / 4.
    pub fn consumed_tokens(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    /// One completion round trip. Transport failures that exhausted the
    /// client's retries surface as errors; malformed content does not (the
    /// per-operation fallbacks absorb it).
    async fn call(&self, user_prompt: String) -> Result<String> {
        let request = ChatRequest::new(&self.model, SYSTEM_PROMPT, user_prompt);
        let response = self
            .provider
            .complete(&request)
            .await
            .map_err(|e| ForgeError::Model(e.to_string()))?;

        let used = match response.usage {
            Some(usage) if usage.total_tokens > 0 => usage.total_tokens,
            _ => ((request.prompt_chars() + response.content.len()) / 4) as u64,
        };
        self.tokens.fetch_add(used, Ordering::Relaxed);
        Ok(response.content)
    }

    /// Ask the model for a stepwise plan. Parse failures fall back to a
    /// minimal analyze-only plan; only exhausted transport retries error.
    pub async fn create_plan(
        &self,
        goal: &str,
        retrieval: &RetrievalResult,
        constraints: &serde_json::Value,
    ) -> Result<ModelPlan> {
        let context = build_context_string(retrieval);
        let prompt = format!(
            r#"Create a detailed step-by-step plan to achieve this goal: {goal}

CONTEXT:
{context}

CONSTRAINTS:
{constraints}

REQUIREMENTS:
- Make incremental changes only, no full file rewrites
- Inspect the project structure first
- Use unified diffs for changes
- Consider test impact and coverage
- Follow existing code patterns and conventions

Provide a JSON response with this structure:
{{
    "steps": [
        {{
            "id": 1,
            "description": "Brief step description",
            "action": "analyze|edit|test",
            "files": ["file1.py", "file2.py"],
            "rationale": "Why this step is needed"
        }}
    ],
    "estimated_changes": 50,
    "risk_level": "low|medium|high",
    "dependencies": {{"add": [], "remove": []}},
    "test_strategy": "Description of testing approach"
}}"#
        );

        let response = self.call(prompt).await?;
        let plan = match extract_json(&response)
            .and_then(|value| serde_json::from_value::<ModelPlan>(value).ok())
        {
            Some(plan) if plan.is_valid() => plan,
            _ => {
                warn!("falling back to minimal plan, model response unparseable");
                ModelPlan::fallback()
            }
        };
        Ok(plan)
    }

    /// Ask the model for a unified diff. The returned text may lack diff
    /// markers; the control loop treats such output as a query-only answer.
    pub async fn propose_patch(
        &self,
        plan: &Plan,
        retrieval: &RetrievalResult,
        previous_attempts: &[String],
    ) -> Result<String> {
        let context = build_context_string(retrieval);
        let plan_json = plan.to_json().unwrap_or_default();
        let attempts = if previous_attempts.is_empty() {
            String::new()
        } else {
            format!(
                "\nPREVIOUS ATTEMPTS:\n{} previous patches were applied",
                previous_attempts.len()
            )
        };

        let prompt = format!(
            r#"Based on this plan, create a unified diff patch:

PLAN:
{plan_json}

CONTEXT:
{context}
{attempts}

REQUIREMENTS:
- Generate ONLY a unified diff format patch
- Make minimal, targeted changes
- Preserve existing code style and patterns
- Include proper context lines for reliable application
- Focus on the next logical step from the plan

Output ONLY the unified diff, starting with --- and +++.
Do not include any other text or explanations."#
        );

        let response = self.call(prompt).await?;
        Ok(extract_diff(&response))
    }

    /// Ask the model how to repair a failure. Falls back to a low-confidence
    /// suggestion that echoes the current plan.
    pub async fn suggest_repair(
        &self,
        failure_context: &serde_json::Value,
        previous_attempts: &[String],
        plan: &Plan,
    ) -> Result<RepairSuggestion> {
        let plan_json = plan.to_json().unwrap_or_default();
        let prompt = format!(
            r#"The previous change failed. Analyze the failure and suggest a repair:

FAILURE CONTEXT:
{failure_context}

ORIGINAL PLAN:
{plan_json}

PREVIOUS ATTEMPTS:
{} patches have been tried

Provide a JSON response with repair suggestions:
{{
    "analysis": "Brief analysis of why it failed",
    "repair_strategy": "What approach to take",
    "modified_plan": {{
        "steps": [],
        "changes": "Description of plan modifications"
    }},
    "confidence": "low|medium|high"
}}"#,
            previous_attempts.len()
        );

        let response = self.call(prompt).await?;
        let repair = match extract_json(&response)
            .and_then(|value| serde_json::from_value::<RepairSuggestion>(value).ok())
        {
            Some(repair) => repair,
            None => {
                debug!("repair suggestion unparseable, echoing plan");
                RepairSuggestion {
                    analysis: "Unable to analyze failure".to_string(),
                    repair_strategy: "Simplify approach and retry".to_string(),
                    modified_plan: serde_json::to_value(plan).unwrap_or(json!({})),
                    confidence: "low".to_string(),
                }
            }
        };
        Ok(repair)
    }
}

fn build_context_string(retrieval: &RetrievalResult) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !retrieval.symbols.is_empty() {
        parts.push("RELEVANT SYMBOLS:".to_string());
        for symbol in retrieval.symbols.iter().take(10) {
            parts.push(format!("- {} ({})", symbol.name, symbol.kind));
        }
    }

    if !retrieval.files.is_empty() {
        parts.push("\nRELEVANT FILES:".to_string());
        for file in retrieval.files.iter().take(5) {
            parts.push(format!("- {}", file.path));
            if let Some(content) = &file.content {
                let lines: Vec<&str> = content.lines().take(10).collect();
                parts.push(format!("  {}", lines.join("\n  ")));
                if content.lines().count() > 10 {
                    parts.push("  ...".to_string());
                }
            }
        }
    }

    if !retrieval.imports.is_empty() {
        parts.push("\nRELEVANT IMPORTS:".to_string());
        for import in retrieval.imports.iter().take(5) {
            parts.push(format!("- {import}"));
        }
    }

    if parts.is_empty() {
        "No specific context available".to_string()
    } else {
        parts.join("\n")
    }
}

/// Extract a JSON object from free-form model output: a ```json fence first,
/// then the first brace-balanced object.
pub fn extract_json(response: &str) -> Option<serde_json::Value> {
    if let Some(start) = response.find("```json") {
        let body = &response[start + 7..];
        if let Some(end) = body.find("```") {
            if let Ok(value) = serde_json::from_str(body[..end].trim()) {
                return Some(value);
            }
        }
    }

    let start = response.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in response[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &response[start..start + offset + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract a unified diff from free-form model output. Fenced blocks are
/// unwrapped; bare marker lines are collected; output without markers is
/// returned unchanged for the caller to treat as a query-only answer.
pub fn extract_diff(response: &str) -> String {
    if let Some(start) = response.find("```diff") {
        let body = &response[start + 7..];
        if let Some(end) = body.find("```") {
            return body[..end].trim().to_string();
        }
    }

    if response.contains("```") && (response.contains("---") || response.contains("+++")) {
        if let Some(start) = response.find("```") {
            let after_fence = &response[start + 3..];
            // Skip a language tag on the fence line.
            let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
            let body = &after_fence[body_start..];
            if let Some(end) = body.find("```") {
                let candidate = body[..end].trim();
                if candidate.contains("---") || candidate.contains("+++") {
                    return candidate.to_string();
                }
            }
        }
    }

    let mut diff_lines: Vec<&str> = Vec::new();
    let mut in_diff = false;
    for line in response.lines() {
        if line.starts_with("---") || line.starts_with("+++") {
            in_diff = true;
        }
        if in_diff {
            let is_diff_line = line.starts_with("---")
                || line.starts_with("+++")
                || line.starts_with("@@")
                || line.starts_with('+')
                || line.starts_with('-')
                || line.starts_with(' ')
                || line.starts_with('\\')
                || line.is_empty();
            if !is_diff_line {
                break;
            }
            diff_lines.push(line);
        }
    }
    if !diff_lines.is_empty() {
        return diff_lines.join("\n");
    }

    response.trim().to_string()
}
