use crate::models::{TaskPatch, TaskRecord, TaskStatus};
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("task {id} is already {status}")]
    Terminal { id: Uuid, status: TaskStatus },
    #[error("task {id} cannot move from {from} back to {to}")]
    Backwards {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task {id} cannot skip from {from} to {to}")]
    Skipped {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task {id} progress cannot drop from {from} to {to}")]
    ProgressRegression { id: Uuid, from: u8, to: u8 },
    #[error("progress {0} is outside 0..=100")]
    ProgressOutOfRange(u8),
    #[error("ERROR is entered through fail, not advance")]
    ErrorViaAdvance,
}

/// Validates a forward move and returns the patch that applies it.
/// Staying in the same status is allowed as long as progress does not drop;
/// otherwise the move must be to the next status in order.
pub fn plan_advance(
    record: &TaskRecord,
    to: TaskStatus,
    progress: u8,
    label: &str,
    now: DateTime<Utc>,
) -> Result<TaskPatch, TransitionError> {
    if record.status.is_terminal() {
        return Err(TransitionError::Terminal {
            id: record.id,
            status: record.status,
        });
    }
    if progress > 100 {
        return Err(TransitionError::ProgressOutOfRange(progress));
    }
    let (Some(from_rank), Some(to_rank)) = (record.status.rank(), to.rank()) else {
        return Err(TransitionError::ErrorViaAdvance);
    };
    if to_rank < from_rank {
        return Err(TransitionError::Backwards {
            id: record.id,
            from: record.status,
            to,
        });
    }
    if to_rank > from_rank + 1 {
        return Err(TransitionError::Skipped {
            id: record.id,
            from: record.status,
            to,
        });
    }
    if progress < record.progress {
        return Err(TransitionError::ProgressRegression {
            id: record.id,
            from: record.progress,
            to: progress,
        });
    }
    Ok(TaskPatch {
        status: Some(to),
        progress: Some(progress),
        stage_label: Some(label.to_string()),
        updated_at: Some(now),
        completed_at: (to == TaskStatus::Completed).then_some(now),
        ..Default::default()
    })
}

/// `None` when the task already reached a final status.
pub fn plan_fail(record: &TaskRecord, reason: &str, now: DateTime<Utc>) -> Option<TaskPatch> {
    if record.status.is_terminal() {
        return None;
    }
    Some(TaskPatch {
        status: Some(TaskStatus::Error),
        progress: Some(0),
        stage_label: Some("Failed".into()),
        error_message: Some(reason.to_string()),
        updated_at: Some(now),
        completed_at: Some(now),
    })
}

#[derive(Debug, Error)]
pub enum AdvanceError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persists lifecycle moves. Every write is a patch keyed by task id.
#[derive(Clone)]
pub struct TaskStateMachine {
    store: Arc<dyn Store>,
}

impl TaskStateMachine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Applies the move to the caller's copy only after the store accepted it.
    pub async fn advance(
        &self,
        record: &mut TaskRecord,
        to: TaskStatus,
        progress: u8,
        label: &str,
    ) -> Result<(), AdvanceError> {
        let patch = plan_advance(record, to, progress, label, Utc::now())?;
        self.store.update(record.id, patch.clone()).await?;
        patch.apply(record);
        crate::metrics::task_transition(to.as_str());
        info!(
            target = "cardforge.tasks",
            task_id = %record.id,
            status = to.as_str(),
            progress,
            label,
            "task_advanced"
        );
        Ok(())
    }

    /// Reads the stored record so a task finished elsewhere is left alone.
    /// Returns whether the task was moved to ERROR.
    pub async fn fail(&self, id: Uuid, reason: &str) -> Result<bool, StoreError> {
        let record = self.store.get(id).await?.ok_or(StoreError::TaskNotFound(id))?;
        let Some(patch) = plan_fail(&record, reason, Utc::now()) else {
            warn!(
                target = "cardforge.tasks",
                task_id = %id,
                status = record.status.as_str(),
                reason,
                "fail_ignored_for_final_task"
            );
            return Ok(false);
        };
        self.store.update(id, patch).await?;
        crate::metrics::task_transition(TaskStatus::Error.as_str());
        warn!(target = "cardforge.tasks", task_id = %id, reason, "task_failed");
        Ok(true)
    }
}
