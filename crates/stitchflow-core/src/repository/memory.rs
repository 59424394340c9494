//! In-memory run repository.
//!
//! DashMap-backed implementation of [`RunRepository`] for tests and
//! embedded single-process deployments. Enforces the same monotonic status
//! guards as the SQLite implementation.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use stitchflow_types::error::RepositoryError;
use stitchflow_types::run::{RunStatus, StepRecord, StepStatus, TaskRecord};

use super::RunRepository;

/// In-memory [`RunRepository`].
#[derive(Default)]
pub struct InMemoryRunRepository {
    runs: DashMap<Uuid, TaskRecord>,
    steps: DashMap<(Uuid, u32), StepRecord>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunRepository for InMemoryRunRepository {
    async fn create_run(&self, run: &TaskRecord) -> Result<(), RepositoryError> {
        if self.runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!("run {} exists", run.id)));
        }
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<TaskRecord>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|r| r.value().clone()))
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
        state: Option<&Value>,
    ) -> Result<(), RepositoryError> {
        let Some(mut run) = self.runs.get_mut(run_id) else {
            return Err(RepositoryError::NotFound);
        };
        // Terminal runs are frozen.
        if run.status.is_terminal() {
            return Ok(());
        }
        run.status = status;
        if let Some(error) = error {
            run.error = Some(error.to_string());
        }
        if let Some(state) = state {
            run.state = state.clone();
        }
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_dispatch_complete(&self, run_id: &Uuid) -> Result<(), RepositoryError> {
        let Some(mut run) = self.runs.get_mut(run_id) else {
            return Err(RepositoryError::NotFound);
        };
        run.dispatch_complete = true;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn create_step(&self, step: &StepRecord) -> Result<(), RepositoryError> {
        let key = (step.run_id, step.step_index);
        if self.steps.contains_key(&key) {
            return Err(RepositoryError::Conflict(format!(
                "step ({}, {}) exists",
                step.run_id, step.step_index
            )));
        }
        self.steps.insert(key, step.clone());
        Ok(())
    }

    async fn get_step(
        &self,
        run_id: &Uuid,
        step_index: u32,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        Ok(self
            .steps
            .get(&(*run_id, step_index))
            .map(|s| s.value().clone()))
    }

    async fn update_step_status(
        &self,
        run_id: &Uuid,
        step_index: u32,
        status: StepStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let Some(mut step) = self.steps.get_mut(&(*run_id, step_index)) else {
            return Err(RepositoryError::NotFound);
        };
        // Terminal steps are frozen: the idempotency guarantee.
        if step.status.is_terminal() {
            return Ok(());
        }
        step.status = status;
        if let Some(output) = output {
            step.output = Some(output.clone());
        }
        if let Some(error) = error {
            step.error_message = Some(error.to_string());
        }
        if status.is_terminal() {
            step.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let mut steps: Vec<StepRecord> = self
            .steps
            .iter()
            .filter(|entry| entry.key().0 == *run_id)
            .map(|entry| entry.value().clone())
            .collect();
        steps.sort_by_key(|s| s.step_index);
        Ok(steps)
    }

    async fn count_steps_by_status(
        &self,
        run_id: &Uuid,
        status: StepStatus,
    ) -> Result<u64, RepositoryError> {
        Ok(self
            .steps
            .iter()
            .filter(|entry| entry.key().0 == *run_id && entry.value().status == status)
            .count() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stitchflow_types::pipeline::NodeKind;

    fn task(id: Uuid) -> TaskRecord {
        TaskRecord {
            id,
            definition_id: Uuid::now_v7(),
            user_id: "studio-42".to_string(),
            status: RunStatus::Running,
            state: json!({}),
            total_async_steps: 1,
            dispatch_complete: false,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn step(run_id: Uuid, index: u32) -> StepRecord {
        StepRecord {
            run_id,
            step_index: index,
            node_id: format!("node-{index}"),
            kind: NodeKind::Provider,
            provider_ref: Some("matting-v2".to_string()),
            provider_task_ref: None,
            status: StepStatus::Processing,
            output: None,
            error_message: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_run_roundtrip() {
        let repo = InMemoryRunRepository::new();
        let id = Uuid::now_v7();
        repo.create_run(&task(id)).await.unwrap();
        assert!(repo.get_run(&id).await.unwrap().is_some());
        assert!(repo.get_run(&Uuid::now_v7()).await.unwrap().is_none());
        assert!(repo.create_run(&task(id)).await.is_err(), "duplicate id");
    }

    #[tokio::test]
    async fn test_terminal_run_is_frozen() {
        let repo = InMemoryRunRepository::new();
        let id = Uuid::now_v7();
        repo.create_run(&task(id)).await.unwrap();
        repo.update_run_status(&id, RunStatus::Failed, Some("node 'x' failed"), None)
            .await
            .unwrap();
        // Later transition is a silent no-op.
        repo.update_run_status(&id, RunStatus::Succeeded, None, None)
            .await
            .unwrap();
        let run = repo.get_run(&id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("node 'x' failed"));
    }

    #[tokio::test]
    async fn test_terminal_step_is_frozen() {
        let repo = InMemoryRunRepository::new();
        let run_id = Uuid::now_v7();
        repo.create_step(&step(run_id, 0)).await.unwrap();
        repo.update_step_status(&run_id, 0, StepStatus::Completed, Some(&json!({"ok": 1})), None)
            .await
            .unwrap();
        let completed_at = repo
            .get_step(&run_id, 0)
            .await
            .unwrap()
            .unwrap()
            .completed_at;
        assert!(completed_at.is_some());

        repo.update_step_status(&run_id, 0, StepStatus::Failed, None, Some("late duplicate"))
            .await
            .unwrap();
        let after = repo.get_step(&run_id, 0).await.unwrap().unwrap();
        assert_eq!(after.status, StepStatus::Completed);
        assert!(after.error_message.is_none());
        assert_eq!(after.completed_at, completed_at, "no timestamp change");
    }

    #[tokio::test]
    async fn test_list_and_count() {
        let repo = InMemoryRunRepository::new();
        let run_id = Uuid::now_v7();
        repo.create_step(&step(run_id, 1)).await.unwrap();
        repo.create_step(&step(run_id, 0)).await.unwrap();
        repo.create_step(&step(Uuid::now_v7(), 0)).await.unwrap();

        let steps = repo.list_steps(&run_id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_index, 0, "ordered by index");

        repo.update_step_status(&run_id, 0, StepStatus::Completed, None, None)
            .await
            .unwrap();
        assert_eq!(
            repo.count_steps_by_status(&run_id, StepStatus::Processing)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            repo.count_steps_by_status(&run_id, StepStatus::Completed)
                .await
                .unwrap(),
            1
        );
    }
}
