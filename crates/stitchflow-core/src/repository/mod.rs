//! Run repository trait definition.
//!
//! Defines the storage interface for run (task) records and dispatched step
//! records. The infrastructure layer implements this trait with SQLite
//! persistence; [`memory::InMemoryRunRepository`] backs tests and embedded
//! use. The core issues simple read-then-write calls only -- no multi-row
//! transactions.
//!
//! Status transitions are monotonic at the storage level: updating a
//! terminal run or step is a silent no-op, which is what makes duplicate
//! callback delivery safe.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

pub mod memory;

use serde_json::Value;
use uuid::Uuid;

use stitchflow_types::error::RepositoryError;
use stitchflow_types::run::{RunStatus, StepRecord, StepStatus, TaskRecord};

/// Repository trait for run and step persistence.
pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a new run record.
    fn create_run(
        &self,
        run: &TaskRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<TaskRecord>, RepositoryError>> + Send;

    /// Update a run's status (and optionally error message / state snapshot).
    ///
    /// A no-op when the run is already terminal.
    fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
        state: Option<&Value>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Mark that the engine's in-process walk finished dispatching.
    fn mark_dispatch_complete(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Create a dispatched step record.
    fn create_step(
        &self,
        step: &StepRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a step by `(run_id, step_index)`.
    fn get_step(
        &self,
        run_id: &Uuid,
        step_index: u32,
    ) -> impl std::future::Future<Output = Result<Option<StepRecord>, RepositoryError>> + Send;

    /// Update a step's status and optionally its output/error.
    ///
    /// A no-op when the step is already terminal.
    fn update_step_status(
        &self,
        run_id: &Uuid,
        step_index: u32,
        status: StepStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List all steps for a run, ordered by step index.
    fn list_steps(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRecord>, RepositoryError>> + Send;

    /// Count a run's steps with the given status.
    fn count_steps_by_status(
        &self,
        run_id: &Uuid,
        status: StepStatus,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
