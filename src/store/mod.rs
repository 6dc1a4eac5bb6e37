mod memory;
mod redis_store;

use crate::models::{AnalysisResult, Subject, TaskPatch, TaskRecord, TaskStatus};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("corrupt record under `{key}`: {message}")]
    Corrupt { key: String, message: String },
}

/// Durable task records. Every update is an independent upsert keyed by id.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, record: TaskRecord) -> Result<Uuid, StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>, StoreError>;
    async fn update(&self, id: Uuid, patch: TaskPatch) -> Result<(), StoreError>;
    async fn find_by_status_in(&self, statuses: &[TaskStatus]) -> Result<Vec<TaskRecord>, StoreError>;
}

/// Items under analysis and their persisted results.
#[async_trait]
pub trait SubjectStore: Send + Sync {
    async fn get_subject(&self, id: &str) -> Result<Option<Subject>, StoreError>;
    async fn put_subject(&self, subject: Subject) -> Result<(), StoreError>;
    async fn save_analysis(&self, result: AnalysisResult) -> Result<(), StoreError>;
    async fn get_analysis(&self, subject_id: &str) -> Result<Option<AnalysisResult>, StoreError>;
}

pub trait Store: TaskStore + SubjectStore {}

impl<T: TaskStore + SubjectStore> Store for T {}

/// Redis when `REDIS_URL` opens, memory otherwise.
pub fn from_env() -> Arc<dyn Store> {
    match std::env::var("REDIS_URL").ok().filter(|u| !u.trim().is_empty()) {
        Some(url) => match redis::Client::open(url.trim()) {
            Ok(client) => {
                info!(target = "cardforge.store", "using redis task store");
                Arc::new(RedisStore::new(client))
            }
            Err(err) => {
                warn!(target = "cardforge.store", error = %err, "redis_url_rejected_falling_back_to_memory");
                Arc::new(MemoryStore::default())
            }
        },
        None => {
            warn!(
                target = "cardforge.store",
                "REDIS_URL not set; tasks will not survive a restart"
            );
            Arc::new(MemoryStore::default())
        }
    }
}
