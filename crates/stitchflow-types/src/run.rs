//! Run and step execution records.
//!
//! A `TaskRecord` is the persisted row for one pipeline run; `StepRecord`
//! rows are created when the engine dispatches an async provider node and
//! are the unit the completion reconciler converges on. Both carry monotonic
//! status machines: once a record reaches a terminal status, further
//! transitions are no-ops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::pipeline::NodeKind;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal runs accept no further state transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Status of a single node within a run (in-memory, cached in run state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// Status of a persisted async step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Terminal steps are frozen; duplicate callbacks become no-ops.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Open steps still block run convergence.
    pub fn is_open(&self) -> bool {
        matches!(self, StepStatus::Pending | StepStatus::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Processing => "processing",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

// ---------------------------------------------------------------------------
// TaskRecord (persisted run row)
// ---------------------------------------------------------------------------

/// Persisted record of one pipeline run.
///
/// Owned exclusively by the execution engine while the run is active;
/// mutated by the reconciler only for steps the engine explicitly suspended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// UUIDv7 run ID. Doubles as the callback `taskId`.
    pub id: Uuid,
    /// ID of the pipeline definition being executed.
    pub definition_id: Uuid,
    /// Owner of the run.
    pub user_id: String,
    /// Current run status.
    pub status: RunStatus,
    /// Serialized run context (state map, output cache, node statuses).
    pub state: Value,
    /// Number of async provider nodes in the compiled graph.
    pub total_async_steps: u32,
    /// Set once the engine's in-process walk has finished dispatching;
    /// the reconciler only converges the run after this point.
    pub dispatch_complete: bool,
    /// First terminal error, if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// StepRecord (persisted async step row)
// ---------------------------------------------------------------------------

/// Persisted record of one dispatched async step.
///
/// Created when the engine dispatches an async provider node; terminal once
/// completed or failed. Retained for audit after the run finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Parent run ID.
    pub run_id: Uuid,
    /// Position assigned in topological order at compile time.
    pub step_index: u32,
    /// ID of the node this step executes.
    pub node_id: String,
    /// Node kind (always `provider` today; kept for audit queries).
    pub kind: NodeKind,
    /// External provider service reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<String>,
    /// Reference assigned by the provider at submission time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_task_ref: Option<String>,
    /// Current step status.
    pub status: StepStatus,
    /// Output reported by the completion callback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message reported by the completion callback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the step reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_status_terminality() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn test_step_status_terminality() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(StepStatus::Pending.is_open());
        assert!(StepStatus::Processing.is_open());
        assert!(!StepStatus::Completed.is_open());
    }

    #[test]
    fn test_status_serde() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Paused,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            let parsed: RunStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_task_record_json_roundtrip() {
        let task = TaskRecord {
            id: Uuid::now_v7(),
            definition_id: Uuid::now_v7(),
            user_id: "studio-42".to_string(),
            status: RunStatus::Running,
            state: json!({ "form": { "imageUrl": "https://cdn.example/x.jpg" } }),
            total_async_steps: 2,
            dispatch_complete: false,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json_str = serde_json::to_string(&task).unwrap();
        let parsed: TaskRecord = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.user_id, "studio-42");
        assert_eq!(parsed.status, RunStatus::Running);
        assert_eq!(parsed.total_async_steps, 2);
    }

    #[test]
    fn test_step_record_json_roundtrip() {
        let step = StepRecord {
            run_id: Uuid::now_v7(),
            step_index: 0,
            node_id: "remove-background".to_string(),
            kind: NodeKind::Provider,
            provider_ref: Some("matting-v2".to_string()),
            provider_task_ref: Some("ext-7731".to_string()),
            status: StepStatus::Processing,
            output: None,
            error_message: None,
            completed_at: None,
        };
        let json_str = serde_json::to_string(&step).unwrap();
        let parsed: StepRecord = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.node_id, "remove-background");
        assert_eq!(parsed.status, StepStatus::Processing);
        assert_eq!(parsed.provider_task_ref.as_deref(), Some("ext-7731"));
    }
}
