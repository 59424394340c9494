//! Run execution context: state map, node output cache, node statuses.
//!
//! `FlowContext` is the mutable state that flows through one pipeline run.
//! The node output cache is an arena owned by the run object and passed by
//! reference through the call chain -- never a process-wide singleton, so
//! concurrent runs cannot cross-contaminate. The context serializes to JSON
//! for checkpointing and restores for inspection after the run is terminal.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use stitchflow_types::error::NodeError;
use stitchflow_types::run::NodeRunStatus;

use crate::resolver::ResolutionContext;

/// Maximum size of a single cached node output (1 MB). Oversized outputs are
/// replaced with a truncation marker rather than failing the run.
pub const MAX_NODE_OUTPUT_SIZE: usize = 1_048_576;

/// First terminal error of a run, surfaced to the caller with the failing
/// node id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub node_id: String,
    pub error: NodeError,
}

/// Mutable execution context scoped to one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowContext {
    pub run_id: Uuid,
    pub definition_id: Uuid,
    pub user_id: String,
    /// Caller inputs (`form.*` scope).
    pub form: Map<String, Value>,
    /// Shared run state; the only executor side-effect channel.
    pub state: Map<String, Value>,
    /// Node output cache: node id -> output. Checked before every dispatch.
    pub outputs: HashMap<String, Value>,
    /// Per-node execution status.
    pub node_status: HashMap<String, NodeRunStatus>,
    /// Structured failures by node id (at-most-once also applies to failures).
    pub failures: HashMap<String, NodeError>,
    /// First terminal error observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
}

impl FlowContext {
    pub fn new(
        run_id: Uuid,
        definition_id: Uuid,
        user_id: impl Into<String>,
        form: Map<String, Value>,
    ) -> Self {
        Self {
            run_id,
            definition_id,
            user_id: user_id.into(),
            form,
            state: Map::new(),
            outputs: HashMap::new(),
            node_status: HashMap::new(),
            failures: HashMap::new(),
            first_failure: None,
            started_at: Utc::now(),
        }
    }

    /// Cache a node's output and mark it successful.
    ///
    /// Outputs above [`MAX_NODE_OUTPUT_SIZE`] are replaced with a truncation
    /// marker so one oversized provider response cannot balloon every
    /// checkpoint write.
    pub fn set_output(&mut self, node_id: &str, output: Value) {
        let serialized_len = serde_json::to_string(&output).map(|s| s.len()).unwrap_or(0);
        let stored = if serialized_len > MAX_NODE_OUTPUT_SIZE {
            tracing::warn!(
                node_id,
                size = serialized_len,
                max = MAX_NODE_OUTPUT_SIZE,
                "node output exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": serialized_len,
            })
        } else {
            output
        };
        self.outputs.insert(node_id.to_string(), stored);
        self.node_status
            .insert(node_id.to_string(), NodeRunStatus::Success);
    }

    /// Cached output of a node, if it has completed.
    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    pub fn set_status(&mut self, node_id: &str, status: NodeRunStatus) {
        self.node_status.insert(node_id.to_string(), status);
    }

    pub fn status(&self, node_id: &str) -> NodeRunStatus {
        self.node_status
            .get(node_id)
            .copied()
            .unwrap_or(NodeRunStatus::Pending)
    }

    /// Memoized failure of a node, if it failed terminally.
    pub fn failure(&self, node_id: &str) -> Option<&NodeError> {
        self.failures.get(node_id)
    }

    /// Record a terminal node failure; the first one also becomes the
    /// run-level failure.
    pub fn record_failure(&mut self, node_id: &str, error: NodeError) {
        self.node_status
            .insert(node_id.to_string(), NodeRunStatus::Failed);
        self.failures.insert(node_id.to_string(), error.clone());
        if self.first_failure.is_none() {
            self.first_failure = Some(RunFailure {
                node_id: node_id.to_string(),
                error,
            });
        }
    }

    /// Write a value into shared run state.
    pub fn set_state(&mut self, key: &str, value: Value) {
        self.state.insert(key.to_string(), value);
    }

    /// Build the resolver context: `system.*`, `form.*`, `<nodeId>.*`.
    pub fn resolution_context(&self) -> ResolutionContext {
        let mut nodes = Map::new();
        for (id, output) in &self.outputs {
            nodes.insert(id.clone(), output.clone());
        }
        ResolutionContext::new(
            json!({
                "run_id": self.run_id.to_string(),
                "definition_id": self.definition_id.to_string(),
                "user_id": self.user_id,
                "started_at": self.started_at.to_rfc3339(),
            }),
            Value::Object(self.form.clone()),
            nodes,
        )
    }

    /// Build the JSON object JEXL expressions evaluate against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "system": { "run_id": "...", "user_id": "..." },
    ///   "form": { ... },
    ///   "state": { ... },
    ///   "nodes": { "<node_id>": <output>, ... }
    /// }
    /// ```
    pub fn expression_context(&self) -> Value {
        let mut nodes = Map::new();
        for (id, output) in &self.outputs {
            nodes.insert(id.clone(), output.clone());
        }
        json!({
            "system": {
                "run_id": self.run_id.to_string(),
                "user_id": self.user_id,
            },
            "form": self.form,
            "state": self.state,
            "nodes": nodes,
        })
    }

    /// Serialize the entire context for checkpointing.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(json!({}))
    }

    /// Restore a context from a JSON checkpoint.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
