//! Completion-callback reconciler.
//!
//! Second, independent entry point into run state, for steps the engine
//! explicitly suspended. Each call is stateless and runs the verification
//! pipeline in order -- field presence, signature, freshness, existence,
//! idempotency -- with every stage a possible terminal rejection. A valid
//! first completion updates the step and converges the run: a failed step
//! fails the run immediately (externally-executed steps are not
//! engine-isolated branches), and a completed step either resumes the
//! in-process engine walk or closes the run by counting once dispatch is
//! complete and no open steps remain.

use std::sync::Arc;

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use stitchflow_types::callback::{CallbackStatus, StepCallback};
use stitchflow_types::error::{ErrorKind, RepositoryError};
use stitchflow_types::run::{RunStatus, StepStatus};

use crate::repository::RunRepository;

use super::signature::verify_callback;
use super::RunResumer;

/// Default callback freshness window: 5 minutes either way.
pub const DEFAULT_FRESHNESS_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Terminal rejections of a completion callback.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("missing or empty field: {0}")]
    MissingField(&'static str),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("timestamp outside freshness window (age {age_ms}ms)")]
    TimestampExpired { age_ms: i64 },

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("step not found: ({task_id}, {step_index})")]
    StepNotFound { task_id: Uuid, step_index: u32 },

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),
}

impl ReconcileError {
    /// Closed-taxonomy kind for the rejection, where one applies.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ReconcileError::SignatureInvalid => Some(ErrorKind::SignatureInvalid),
            ReconcileError::TimestampExpired { .. } => Some(ErrorKind::TimestampExpired),
            ReconcileError::TaskNotFound(_) => Some(ErrorKind::TaskNotFound),
            ReconcileError::StepNotFound { .. } => Some(ErrorKind::StepNotFound),
            ReconcileError::MissingField(_) | ReconcileError::Storage(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Accepted-callback outcome.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Run status after this callback was applied.
    pub run_status: RunStatus,
    /// Step status after this callback was applied.
    pub step_status: StepStatus,
    /// The step was already terminal; nothing was mutated.
    pub already_terminal: bool,
    /// An in-process engine resumed the run's walk.
    pub resumed: bool,
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Stateless-per-call reconciler over the run repository.
pub struct Reconciler<R> {
    repo: Arc<R>,
    secret: SecretString,
    freshness_secs: u64,
    resumer: Option<Arc<dyn RunResumer>>,
}

impl<R: RunRepository + 'static> Reconciler<R> {
    pub fn new(repo: Arc<R>, secret: SecretString) -> Self {
        Self {
            repo,
            secret,
            freshness_secs: DEFAULT_FRESHNESS_SECS,
            resumer: None,
        }
    }

    pub fn with_freshness_secs(mut self, freshness_secs: u64) -> Self {
        self.freshness_secs = freshness_secs;
        self
    }

    /// Attach an in-process engine for suspended-run resumption.
    pub fn with_resumer(mut self, resumer: Arc<dyn RunResumer>) -> Self {
        self.resumer = Some(resumer);
        self
    }

    /// Verify and apply one completion callback.
    pub async fn handle(&self, callback: &StepCallback) -> Result<ReconcileOutcome, ReconcileError> {
        // 1. Required-field presence beyond what deserialization enforces.
        if callback.signature.trim().is_empty() {
            return Err(ReconcileError::MissingField("signature"));
        }
        if callback.timestamp <= 0 {
            return Err(ReconcileError::MissingField("timestamp"));
        }

        // 2. Signature over the canonical payload.
        verify_callback(self.secret.expose_secret().as_bytes(), callback)
            .map_err(|_| ReconcileError::SignatureInvalid)?;

        // 3. Freshness bounds the replay window in both directions.
        let age_ms = (Utc::now().timestamp_millis() - callback.timestamp).abs();
        if age_ms > (self.freshness_secs as i64) * 1000 {
            return Err(ReconcileError::TimestampExpired { age_ms });
        }

        // 4. Existence of the task and the addressed step.
        let task = self
            .repo
            .get_run(&callback.task_id)
            .await?
            .ok_or(ReconcileError::TaskNotFound(callback.task_id))?;
        let step = self
            .repo
            .get_step(&callback.task_id, callback.step_index)
            .await?
            .ok_or(ReconcileError::StepNotFound {
                task_id: callback.task_id,
                step_index: callback.step_index,
            })?;

        // 5. Idempotency: a terminal step accepts duplicates without mutation.
        if step.status.is_terminal() {
            tracing::debug!(
                task_id = %callback.task_id,
                step_index = callback.step_index,
                status = step.status.as_str(),
                "duplicate callback for terminal step"
            );
            return Ok(ReconcileOutcome {
                run_status: task.status,
                step_status: step.status,
                already_terminal: true,
                resumed: false,
            });
        }

        // First valid completion: apply the step transition.
        let step_status = match callback.status {
            CallbackStatus::Completed => StepStatus::Completed,
            CallbackStatus::Failed => StepStatus::Failed,
        };
        self.repo
            .update_step_status(
                &callback.task_id,
                callback.step_index,
                step_status,
                callback.output.as_ref(),
                callback.error_message.as_deref(),
            )
            .await?;

        tracing::info!(
            task_id = %callback.task_id,
            step_index = callback.step_index,
            node_id = step.node_id.as_str(),
            status = step_status.as_str(),
            "async step reconciled"
        );

        // A terminal run accepts the step audit write but never regresses.
        if task.status.is_terminal() {
            return Ok(ReconcileOutcome {
                run_status: task.status,
                step_status,
                already_terminal: false,
                resumed: false,
            });
        }

        if step_status == StepStatus::Failed {
            // Fail-fast: an externally-executed step is not an
            // engine-tracked branch that can isolate failure.
            let message = format!(
                "async step {} ('{}') failed: {}",
                callback.step_index,
                step.node_id,
                callback.error_message.as_deref().unwrap_or("no detail")
            );
            self.repo
                .update_run_status(&callback.task_id, RunStatus::Failed, Some(&message), None)
                .await?;
            return Ok(ReconcileOutcome {
                run_status: RunStatus::Failed,
                step_status,
                already_terminal: false,
                resumed: false,
            });
        }

        // Resume the owning run when this process holds its suspension.
        if let Some(resumer) = &self.resumer {
            let output = callback.output.clone().unwrap_or(Value::Null);
            if resumer
                .resume_step(callback.task_id, &step.node_id, output)
                .await
            {
                let run_status = self
                    .repo
                    .get_run(&callback.task_id)
                    .await?
                    .map(|t| t.status)
                    .unwrap_or(RunStatus::Running);
                return Ok(ReconcileOutcome {
                    run_status,
                    step_status,
                    already_terminal: false,
                    resumed: true,
                });
            }
        }

        // Counting convergence: once the engine finished dispatching and no
        // open step remains, the run has succeeded.
        let run_status = if task.dispatch_complete && self.open_steps(&callback.task_id).await? == 0
        {
            let artifacts = self.collect_artifacts(&callback.task_id).await?;
            let mut state = task.state.clone();
            if let Value::Object(map) = &mut state {
                map.insert("artifacts".to_string(), artifacts);
            }
            self.repo
                .update_run_status(&callback.task_id, RunStatus::Succeeded, None, Some(&state))
                .await?;
            tracing::info!(task_id = %callback.task_id, "all async steps complete; run succeeded");
            RunStatus::Succeeded
        } else {
            task.status
        };

        Ok(ReconcileOutcome {
            run_status,
            step_status,
            already_terminal: false,
            resumed: false,
        })
    }

    async fn open_steps(&self, task_id: &Uuid) -> Result<u64, ReconcileError> {
        let pending = self
            .repo
            .count_steps_by_status(task_id, StepStatus::Pending)
            .await?;
        let processing = self
            .repo
            .count_steps_by_status(task_id, StepStatus::Processing)
            .await?;
        Ok(pending + processing)
    }

    /// Aggregate step outputs by node id for the run's artifact record.
    async fn collect_artifacts(&self, task_id: &Uuid) -> Result<Value, ReconcileError> {
        let steps = self.repo.list_steps(task_id).await?;
        let mut artifacts = serde_json::Map::new();
        for step in steps {
            if let Some(output) = step.output {
                artifacts.insert(step.node_id, output);
            }
        }
        Ok(json!(artifacts))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
