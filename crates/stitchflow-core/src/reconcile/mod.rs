//! Async completion reconciliation.
//!
//! External compute workers report step completion through a signed HTTP
//! callback. [`signature`] builds and verifies the canonical HMAC-SHA256
//! signature; [`reconciler`] runs the verification pipeline and converges
//! run state idempotently under at-least-once delivery.

pub mod reconciler;
pub mod signature;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

pub use reconciler::{ReconcileError, ReconcileOutcome, Reconciler};
pub use signature::{canonical_string, sign_callback, verify_callback};

/// Hook back into an engine holding a suspended run in this process.
///
/// `resume_step` returns `true` when the engine took over run convergence;
/// `false` sends the reconciler down the counting path (other process, or
/// the suspension was inside a fork branch).
#[async_trait]
pub trait RunResumer: Send + Sync {
    async fn resume_step(&self, run_id: Uuid, node_id: &str, output: Value) -> bool;
}
