use super::TaskError;
use super::inflight::{InFlightSet, InFlightTicket};
use super::state::TaskStateMachine;
use crate::models::{Subject, TaskRecord, TaskStatus};
use crate::pipeline::Pipeline;
use crate::publish::Publisher;
use crate::store::Store;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const PROCESSING_TIMEOUT_MESSAGE: &str = "processing timeout";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Failed(String),
    TimedOut,
    /// The stored task was already COMPLETED or ERROR.
    AlreadyFinal,
}

enum RunEnd {
    Completed,
    AlreadyFinal,
}

/// Drives one task through the pipeline. At most one run per task id is
/// active in this process; the whole run is raced against the task timeout.
#[derive(Clone)]
pub struct TaskProcessor {
    store: Arc<dyn Store>,
    pipeline: Pipeline,
    publisher: Arc<dyn Publisher>,
    machine: TaskStateMachine,
    inflight: InFlightSet,
    timeout: Duration,
}

impl TaskProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        pipeline: Pipeline,
        publisher: Arc<dyn Publisher>,
        inflight: InFlightSet,
        timeout: Duration,
    ) -> Self {
        Self {
            machine: TaskStateMachine::new(store.clone()),
            store,
            pipeline,
            publisher,
            inflight,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_running(&self, task_id: Uuid) -> bool {
        self.inflight.contains(task_id)
    }

    /// Claims the task before spawning, so `None` reliably means another run
    /// is active and nothing was started.
    pub fn try_spawn(&self, task_id: Uuid, subject_id: String) -> Option<JoinHandle<ProcessOutcome>> {
        let Some(ticket) = self.inflight.try_acquire(task_id) else {
            debug!(target = "cardforge.tasks", task_id = %task_id, "process_skipped_already_running");
            return None;
        };
        let processor = self.clone();
        Some(tokio::spawn(async move {
            let outcome = processor.process_with(ticket, &subject_id).await;
            match &outcome {
                ProcessOutcome::Completed => {
                    info!(target = "cardforge.tasks", task_id = %task_id, "task_run_completed");
                }
                ProcessOutcome::Failed(reason) => {
                    warn!(target = "cardforge.tasks", task_id = %task_id, reason = %reason, "task_run_failed");
                }
                ProcessOutcome::TimedOut => {
                    warn!(target = "cardforge.tasks", task_id = %task_id, "task_run_timed_out");
                }
                ProcessOutcome::AlreadyFinal => {
                    debug!(target = "cardforge.tasks", task_id = %task_id, "task_already_final");
                }
            }
            outcome
        }))
    }

    async fn process_with(&self, ticket: InFlightTicket, subject_id: &str) -> ProcessOutcome {
        let task_id = ticket.id();
        let outcome = match tokio::time::timeout(self.timeout, self.run(task_id, subject_id)).await {
            Ok(Ok(RunEnd::Completed)) => ProcessOutcome::Completed,
            Ok(Ok(RunEnd::AlreadyFinal)) => ProcessOutcome::AlreadyFinal,
            Ok(Err(err)) => {
                let message = err.to_string();
                self.record_failure(task_id, &message).await;
                ProcessOutcome::Failed(message)
            }
            Err(_) => {
                warn!(
                    target = "cardforge.tasks",
                    task_id = %task_id,
                    timeout_secs = self.timeout.as_secs(),
                    "task_timed_out"
                );
                self.record_failure(task_id, PROCESSING_TIMEOUT_MESSAGE).await;
                ProcessOutcome::TimedOut
            }
        };
        drop(ticket);
        outcome
    }

    async fn record_failure(&self, task_id: Uuid, message: &str) {
        if let Err(err) = self.machine.fail(task_id, message).await {
            error!(
                target = "cardforge.tasks",
                task_id = %task_id,
                reason = message,
                error = %err,
                "task_fail_not_persisted"
            );
        }
    }

    async fn run(&self, task_id: Uuid, subject_id: &str) -> Result<RunEnd, TaskError> {
        let mut record = self
            .store
            .get(task_id)
            .await?
            .ok_or(TaskError::TaskNotFound(task_id))?;
        if record.status.is_terminal() {
            return Ok(RunEnd::AlreadyFinal);
        }
        if record.subject_id != subject_id {
            warn!(
                target = "cardforge.tasks",
                task_id = %task_id,
                requested = subject_id,
                stored = %record.subject_id,
                "subject_mismatch_using_stored"
            );
        }
        let subject = self
            .store
            .get_subject(&record.subject_id)
            .await?
            .ok_or_else(|| TaskError::SubjectNotFound(record.subject_id.clone()))?;

        if record.status == TaskStatus::Publishing
            && let Some(existing) = self.store.get_analysis(&subject.id).await?
            && existing.task_id == task_id
        {
            info!(target = "cardforge.tasks", task_id = %task_id, "resume_at_publish");
            return self.publish(&mut record, &subject).await;
        }

        self.checkpoint(&mut record, TaskStatus::Analyzing, 10, "Analyzing item")
            .await?;
        let catalog = self.pipeline.load_catalog(&subject.category_id).await?;

        let mut reports = Vec::new();
        let stage1 = self.pipeline.run_stage_one(&subject, &mut reports).await;
        self.checkpoint(&mut record, TaskStatus::Analyzing, 40, "Attributes extracted")
            .await?;
        let stage2 = self
            .pipeline
            .run_stage_two(&subject, &stage1, &catalog, &mut reports)
            .await;
        self.checkpoint(&mut record, TaskStatus::Analyzing, 70, "Catalog aligned")
            .await?;

        let result = self
            .pipeline
            .assemble(task_id, &subject, &stage1, &stage2, &catalog, reports);
        self.store.save_analysis(result).await?;
        self.checkpoint(&mut record, TaskStatus::Analyzing, 80, "Attributes reconciled")
            .await?;

        self.publish(&mut record, &subject).await
    }

    async fn publish(&self, record: &mut TaskRecord, subject: &Subject) -> Result<RunEnd, TaskError> {
        self.checkpoint(record, TaskStatus::Publishing, 90, "Publishing")
            .await?;
        self.publisher.publish(&subject.id, record.id).await?;
        self.checkpoint(record, TaskStatus::Completed, 100, "Completed")
            .await?;
        Ok(RunEnd::Completed)
    }

    /// A resumed task skips checkpoints it already passed.
    async fn checkpoint(
        &self,
        record: &mut TaskRecord,
        to: TaskStatus,
        progress: u8,
        label: &str,
    ) -> Result<(), TaskError> {
        let passed = match (record.status.rank(), to.rank()) {
            (Some(at), Some(target)) => at > target || (at == target && record.progress >= progress),
            _ => false,
        };
        if passed {
            debug!(
                target = "cardforge.tasks",
                task_id = %record.id,
                status = record.status.as_str(),
                progress = record.progress,
                checkpoint = label,
                "checkpoint_already_passed"
            );
            return Ok(());
        }
        self.machine.advance(record, to, progress, label).await?;
        Ok(())
    }
}
