pub mod inflight;
pub mod processor;
pub mod recovery;
pub mod state;

use crate::models::{AnalysisResult, ItemSubmission, Subject, TaskRecord};
use crate::pipeline::PipelineError;
use crate::publish::PublishError;
use crate::store::{Store, StoreError};
use chrono::Utc;
use processor::TaskProcessor;
use serde::Serialize;
use state::{AdvanceError, TransitionError};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid submission: {0}")]
    InvalidInput(String),
    #[error("subject `{0}` not found")]
    SubjectNotFound(String),
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("no analysis stored for subject `{0}`")]
    AnalysisNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl From<AdvanceError> for TaskError {
    fn from(err: AdvanceError) -> Self {
        match err {
            AdvanceError::Transition(err) => TaskError::Transition(err),
            AdvanceError::Store(err) => TaskError::Store(err),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Submitted {
    pub task_id: Uuid,
    pub subject_id: String,
}

/// Caller-facing operations: submit, resume and read access.
#[derive(Clone)]
pub struct TaskService {
    store: Arc<dyn Store>,
    processor: TaskProcessor,
}

impl TaskService {
    pub fn new(store: Arc<dyn Store>, processor: TaskProcessor) -> Self {
        Self { store, processor }
    }

    /// Stores the item, then submits a task for it.
    pub async fn submit_item(&self, item: ItemSubmission) -> Result<Submitted, TaskError> {
        let name = item.name.trim();
        if name.is_empty() {
            return Err(TaskError::InvalidInput("name must not be empty".into()));
        }
        let category_id = item.category_id.trim();
        if category_id.is_empty() {
            return Err(TaskError::InvalidInput("category_id must not be empty".into()));
        }
        let subject_id = item
            .subject_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.store
            .put_subject(Subject {
                id: subject_id.clone(),
                name: name.to_string(),
                description: item.description.trim().to_string(),
                category_id: category_id.to_string(),
                created_at: Utc::now(),
            })
            .await?;
        let task_id = self.submit(&subject_id).await?;
        Ok(Submitted {
            task_id,
            subject_id,
        })
    }

    pub async fn submit(&self, subject_id: &str) -> Result<Uuid, TaskError> {
        if self.store.get_subject(subject_id).await?.is_none() {
            return Err(TaskError::SubjectNotFound(subject_id.to_string()));
        }
        let record = TaskRecord::new(subject_id, Utc::now());
        let task_id = self.store.create(record).await?;
        info!(
            target = "cardforge.tasks",
            task_id = %task_id,
            subject_id = subject_id,
            "task_submitted"
        );
        self.processor.try_spawn(task_id, subject_id.to_string());
        Ok(task_id)
    }

    /// Idempotent: `false` when the task is final or already running.
    pub async fn resume(&self, task_id: Uuid) -> Result<bool, TaskError> {
        if self.processor.is_running(task_id) {
            return Ok(false);
        }
        let record = self.task(task_id).await?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        let accepted = self
            .processor
            .try_spawn(task_id, record.subject_id)
            .is_some();
        info!(target = "cardforge.tasks", task_id = %task_id, accepted, "task_resume_requested");
        Ok(accepted)
    }

    pub async fn task(&self, task_id: Uuid) -> Result<TaskRecord, TaskError> {
        self.store
            .get(task_id)
            .await?
            .ok_or(TaskError::TaskNotFound(task_id))
    }

    pub async fn analysis(&self, subject_id: &str) -> Result<AnalysisResult, TaskError> {
        self.store
            .get_analysis(subject_id)
            .await?
            .ok_or_else(|| TaskError::AnalysisNotFound(subject_id.to_string()))
    }
}
