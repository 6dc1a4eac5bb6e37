use super::{StoreError, SubjectStore, TaskStore};
use crate::models::{AnalysisResult, Subject, TaskPatch, TaskRecord, TaskStatus};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Process-local store. Used for tests and for runs without `REDIS_URL`.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tasks: Arc<Mutex<HashMap<Uuid, TaskRecord>>>,
    subjects: Arc<Mutex<HashMap<String, Subject>>>,
    analyses: Arc<Mutex<HashMap<String, AnalysisResult>>>,
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create(&self, record: TaskRecord) -> Result<Uuid, StoreError> {
        let id = record.id;
        self.tasks.lock().await.insert(id, record);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.tasks.lock().await.get(&id).cloned())
    }

    async fn update(&self, id: Uuid, patch: TaskPatch) -> Result<(), StoreError> {
        let mut guard = self.tasks.lock().await;
        let record = guard.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        patch.apply(record);
        Ok(())
    }

    async fn find_by_status_in(&self, statuses: &[TaskStatus]) -> Result<Vec<TaskRecord>, StoreError> {
        let guard = self.tasks.lock().await;
        let mut found: Vec<TaskRecord> = guard
            .values()
            .filter(|record| statuses.contains(&record.status))
            .cloned()
            .collect();
        found.sort_by_key(|record| record.created_at);
        Ok(found)
    }
}

#[async_trait]
impl SubjectStore for MemoryStore {
    async fn get_subject(&self, id: &str) -> Result<Option<Subject>, StoreError> {
        Ok(self.subjects.lock().await.get(id).cloned())
    }

    async fn put_subject(&self, subject: Subject) -> Result<(), StoreError> {
        self.subjects.lock().await.insert(subject.id.clone(), subject);
        Ok(())
    }

    async fn save_analysis(&self, result: AnalysisResult) -> Result<(), StoreError> {
        self.analyses
            .lock()
            .await
            .insert(result.subject_id.clone(), result);
        Ok(())
    }

    async fn get_analysis(&self, subject_id: &str) -> Result<Option<AnalysisResult>, StoreError> {
        Ok(self.analyses.lock().await.get(subject_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn update_applies_patch_in_place() {
        let store = MemoryStore::default();
        let record = TaskRecord::new("item-1", Utc::now());
        let id = store.create(record).await.unwrap();
        store
            .update(
                id,
                TaskPatch {
                    status: Some(TaskStatus::Analyzing),
                    progress: Some(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let stored = store.get(id).await.unwrap().expect("stored");
        assert_eq!(stored.status, TaskStatus::Analyzing);
        assert_eq!(stored.progress, 10);
    }

    #[tokio::test]
    async fn update_of_unknown_task_fails() {
        let store = MemoryStore::default();
        let id = Uuid::new_v4();
        let err = store.update(id, TaskPatch::default()).await.expect_err("missing");
        assert!(matches!(err, StoreError::TaskNotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn find_by_status_filters_and_orders_by_age() {
        let store = MemoryStore::default();
        let now = Utc::now();
        let mut older = TaskRecord::new("a", now - Duration::minutes(5));
        older.status = TaskStatus::Analyzing;
        let mut newer = TaskRecord::new("b", now);
        newer.status = TaskStatus::Publishing;
        let mut done = TaskRecord::new("c", now);
        done.status = TaskStatus::Completed;
        for record in [newer.clone(), done, older.clone()] {
            store.create(record).await.unwrap();
        }
        let found = store
            .find_by_status_in(&[TaskStatus::Analyzing, TaskStatus::Publishing])
            .await
            .unwrap();
        let ids: Vec<Uuid> = found.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
    }
}
