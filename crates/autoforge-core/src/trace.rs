//! Per-task trace collection and artifact persistence.
//!
//! A [`TraceCollector`] records a tree of operation calls with timings and
//! errors, and serializes to a JSON trace file. One collector is created per
//! task and threaded through the context so parallel tasks never contaminate
//! each other's traces.
//!
//! Plan snapshots are written with top-level key order `goal` then `plan`
//! and carry no iteration counter or timestamp; a stable serialized prefix
//! across iterations is what lets the model host reuse its prompt cache.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::domain::{Plan, Result};

/// A recorded operation with its ordered children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceCall {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub component: String,
    pub operation: String,
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub thread_id: String,
    pub children: Vec<TraceCall>,
}

/// The persisted trace file shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceFile {
    pub session_id: Option<String>,
    pub start_time: f64,
    pub end_time: f64,
    pub total_calls: usize,
    pub call_stack: Vec<TraceCall>,
}

/// Opaque handle for an in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallId(usize);

struct Node {
    timestamp: f64,
    started: Instant,
    component: String,
    operation: String,
    details: serde_json::Value,
    duration: Option<f64>,
    error: Option<String>,
    stack_trace: Option<String>,
    thread_id: String,
    parent: Option<usize>,
    children: Vec<usize>,
}

struct Inner {
    session_id: Option<String>,
    start_time: f64,
    nodes: Vec<Node>,
    roots: Vec<usize>,
    stack: Vec<usize>,
}

/// Collector of nested operation calls for a single task.
pub struct TraceCollector {
    inner: Mutex<Inner>,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Default for TraceCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceCollector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                session_id: None,
                start_time: now_epoch(),
                nodes: Vec::new(),
                roots: Vec::new(),
                stack: Vec::new(),
            }),
        }
    }

    pub fn set_session_id(&self, session_id: impl Into<String>) {
        self.inner.lock().unwrap().session_id = Some(session_id.into());
    }

    /// Begin a call; it becomes a child of the innermost open call.
    pub fn start_call(
        &self,
        component: &str,
        operation: &str,
        details: serde_json::Value,
    ) -> CallId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.nodes.len();
        let parent = inner.stack.last().copied();

        inner.nodes.push(Node {
            timestamp: now_epoch(),
            started: Instant::now(),
            component: component.to_string(),
            operation: operation.to_string(),
            details,
            duration: None,
            error: None,
            stack_trace: None,
            thread_id: format!("{:?}", std::thread::current().id()),
            parent,
            children: Vec::new(),
        });

        match parent {
            Some(parent_id) => inner.nodes[parent_id].children.push(id),
            None => inner.roots.push(id),
        }
        inner.stack.push(id);
        CallId(id)
    }

    /// Finish a call, stamping its duration and optional error.
    pub fn end_call(&self, id: CallId, error: Option<String>, stack_trace: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(position) = inner.stack.iter().rposition(|&i| i == id.0) {
            inner.stack.truncate(position);
        }
        if let Some(node) = inner.nodes.get_mut(id.0) {
            node.duration = Some(node.started.elapsed().as_secs_f64());
            node.error = error;
            node.stack_trace = stack_trace;
        }
    }

    /// Number of recorded calls.
    pub fn total_calls(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    fn build_call(&self, inner: &Inner, id: usize) -> TraceCall {
        let node = &inner.nodes[id];
        TraceCall {
            timestamp: node.timestamp,
            component: node.component.clone(),
            operation: node.operation.clone(),
            details: node.details.clone(),
            duration: node.duration,
            error: node.error.clone(),
            stack_trace: node.stack_trace.clone(),
            thread_id: node.thread_id.clone(),
            children: node
                .children
                .iter()
                .map(|&child| self.build_call(inner, child))
                .collect(),
        }
    }

    /// Snapshot the current call tree.
    pub fn calls(&self) -> Vec<TraceCall> {
        let inner = self.inner.lock().unwrap();
        inner
            .roots
            .iter()
            .map(|&root| self.build_call(&inner, root))
            .collect()
    }

    /// Write the trace file, creating parent directories as needed.
    pub fn save_to_file(&self, path: &Path) -> Result<PathBuf> {
        let call_stack = self.calls();
        let inner = self.inner.lock().unwrap();
        let file = TraceFile {
            session_id: inner.session_id.clone(),
            start_time: inner.start_time,
            end_time: now_epoch(),
            total_calls: inner.nodes.len(),
            call_stack,
        };
        drop(inner);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&file)?)?;
        Ok(path.to_path_buf())
    }
}

/// Plan snapshot artifact: `goal` before `plan`, nothing else.
#[derive(Debug, Serialize)]
pub struct PlanSnapshot<'a> {
    pub goal: &'a str,
    pub plan: &'a Plan,
}

/// Write the current plan snapshot to `<dir>/plan_snapshot.json`,
/// overwriting the previous iteration's snapshot.
pub fn write_plan_snapshot(dir: &Path, goal: &str, plan: &Plan) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("plan_snapshot.json");
    let snapshot = PlanSnapshot { goal, plan };
    std::fs::write(&path, serde_json::to_vec_pretty(&snapshot)?)?;
    Ok(path)
}
