use super::processor::TaskProcessor;
use super::state::TaskStateMachine;
use crate::models::TaskStatus;
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::{info, warn};
use uuid::Uuid;

pub const MISSING_SUBJECT_MESSAGE: &str = "subject record missing after restart";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resumed: Vec<Uuid>,
    pub timed_out: Vec<Uuid>,
    pub missing_subject: Vec<Uuid>,
    /// Already claimed by a run in this process.
    pub skipped: Vec<Uuid>,
}

/// Startup sweep over unfinished tasks. Stale and broken tasks are failed
/// before `run` returns; the rest are handed back to the processor.
pub struct RecoveryInitializer {
    store: Arc<dyn Store>,
    processor: TaskProcessor,
    machine: TaskStateMachine,
    ran: AtomicBool,
}

impl RecoveryInitializer {
    pub fn new(store: Arc<dyn Store>, processor: TaskProcessor) -> Self {
        Self {
            machine: TaskStateMachine::new(store.clone()),
            store,
            processor,
            ran: AtomicBool::new(false),
        }
    }

    pub async fn run(&self) -> Result<RecoveryReport, StoreError> {
        self.run_at(Utc::now()).await
    }

    /// Only the first call in a process does any work.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();
        if self.ran.swap(true, Ordering::SeqCst) {
            info!(target = "cardforge.recovery", "recovery_already_ran");
            return Ok(report);
        }

        let pending = self.store.find_by_status_in(&TaskStatus::RESUMABLE).await?;
        let timeout = self.processor.timeout();
        info!(
            target = "cardforge.recovery",
            pending = pending.len(),
            "recovery_started"
        );

        for record in pending {
            let age = now.signed_duration_since(record.created_at);
            if age.to_std().map(|age| age > timeout).unwrap_or(false) {
                let reason = format!(
                    "timeout after resuming, elapsed {} minutes",
                    age.num_minutes()
                );
                self.machine.fail(record.id, &reason).await?;
                report.timed_out.push(record.id);
                continue;
            }

            if self.store.get_subject(&record.subject_id).await?.is_none() {
                self.machine.fail(record.id, MISSING_SUBJECT_MESSAGE).await?;
                report.missing_subject.push(record.id);
                continue;
            }

            match self.processor.try_spawn(record.id, record.subject_id.clone()) {
                Some(_) => {
                    info!(
                        target = "cardforge.recovery",
                        task_id = %record.id,
                        status = record.status.as_str(),
                        progress = record.progress,
                        "task_resumed"
                    );
                    report.resumed.push(record.id);
                }
                None => {
                    warn!(target = "cardforge.recovery", task_id = %record.id, "task_already_running");
                    report.skipped.push(record.id);
                }
            }
        }

        info!(
            target = "cardforge.recovery",
            resumed = report.resumed.len(),
            timed_out = report.timed_out.len(),
            missing_subject = report.missing_subject.len(),
            "recovery_finished"
        );
        Ok(report)
    }
}
