use super::{StoreError, SubjectStore, TaskStore};
use crate::models::{AnalysisResult, Subject, TaskPatch, TaskRecord, TaskStatus};
use async_trait::async_trait;
use redis::{AsyncCommands, aio::MultiplexedConnection};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};
use uuid::Uuid;

const KEY_PREFIX: &str = "cardforge";

/// JSON documents in redis, one key per record. Task ids are indexed in one
/// set per status, so recovery only reads the tasks it may resume.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    async fn conn(&self) -> Result<MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)
    }

    async fn read<T: DeserializeOwned>(
        conn: &mut MultiplexedConnection,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let raw: Option<String> = conn.get(key).await.map_err(unavailable)?;
        raw.map(|json| {
            serde_json::from_str(&json).map_err(|err| StoreError::Corrupt {
                key: key.to_string(),
                message: err.to_string(),
            })
        })
        .transpose()
    }

    async fn write<T: Serialize>(
        conn: &mut MultiplexedConnection,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let _: () = conn.set(key, to_json(key, value)?).await.map_err(unavailable)?;
        Ok(())
    }

    /// Writes the record and moves its id between status sets in one
    /// MULTI/EXEC block.
    async fn write_task(
        conn: &mut MultiplexedConnection,
        record: &TaskRecord,
        index: &IndexMove,
    ) -> Result<(), StoreError> {
        let key = task_key(record.id);
        let member = record.id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic().set(&key, to_json(&key, record)?).ignore();
        if let Some(from) = &index.remove {
            pipe.srem(from, &member).ignore();
        }
        if let Some(to) = &index.add {
            pipe.sadd(to, &member).ignore();
        }
        pipe.query_async::<()>(conn).await.map_err(unavailable)
    }
}

/// Status-set membership changes that go with one task write.
#[derive(Debug, Default, PartialEq, Eq)]
struct IndexMove {
    remove: Option<String>,
    add: Option<String>,
}

fn status_index_key(status: TaskStatus) -> String {
    format!("{KEY_PREFIX}:tasks:{}", status.as_str().to_ascii_lowercase())
}

fn index_on_create(record: &TaskRecord) -> IndexMove {
    IndexMove {
        remove: None,
        add: Some(status_index_key(record.status)),
    }
}

/// Applies the patch and works out which status sets change.
fn plan_update(mut record: TaskRecord, patch: &TaskPatch) -> (TaskRecord, IndexMove) {
    let before = record.status;
    patch.apply(&mut record);
    let index = if record.status == before {
        IndexMove::default()
    } else {
        IndexMove {
            remove: Some(status_index_key(before)),
            add: Some(status_index_key(record.status)),
        }
    };
    (record, index)
}

fn to_json<T: Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|err| StoreError::Corrupt {
        key: key.to_string(),
        message: err.to_string(),
    })
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn task_key(id: Uuid) -> String {
    format!("{KEY_PREFIX}:task:{id}")
}

fn subject_key(id: &str) -> String {
    format!("{KEY_PREFIX}:subject:{id}")
}

fn analysis_key(subject_id: &str) -> String {
    format!("{KEY_PREFIX}:analysis:{subject_id}")
}

#[async_trait]
impl TaskStore for RedisStore {
    async fn create(&self, record: TaskRecord) -> Result<Uuid, StoreError> {
        let mut conn = self.conn().await?;
        Self::write_task(&mut conn, &record, &index_on_create(&record)).await?;
        Ok(record.id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        let mut conn = self.conn().await?;
        Self::read(&mut conn, &task_key(id)).await
    }

    async fn update(&self, id: Uuid, patch: TaskPatch) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let key = task_key(id);
        let record: TaskRecord = Self::read(&mut conn, &key)
            .await?
            .ok_or(StoreError::TaskNotFound(id))?;
        let (record, index) = plan_update(record, &patch);
        Self::write_task(&mut conn, &record, &index).await
    }

    async fn find_by_status_in(&self, statuses: &[TaskStatus]) -> Result<Vec<TaskRecord>, StoreError> {
        let mut conn = self.conn().await?;
        let mut ids: Vec<String> = Vec::new();
        for status in statuses {
            let members: Vec<String> = conn
                .smembers(status_index_key(*status))
                .await
                .map_err(unavailable)?;
            ids.extend(members);
        }
        ids.sort_unstable();
        ids.dedup();
        let mut found = Vec::new();
        for raw_id in ids {
            let Ok(id) = Uuid::parse_str(&raw_id) else {
                warn!(target = "cardforge.store", id = %raw_id, "task_index_entry_not_a_uuid");
                continue;
            };
            match Self::read::<TaskRecord>(&mut conn, &task_key(id)).await {
                Ok(Some(record)) if statuses.contains(&record.status) => found.push(record),
                Ok(_) => {
                    debug!(target = "cardforge.store", task_id = %id, "stale_status_index_entry");
                }
                Err(StoreError::Corrupt { key, message }) => {
                    warn!(target = "cardforge.store", key = %key, error = %message, "skipping_corrupt_task");
                }
                Err(err) => return Err(err),
            }
        }
        found.sort_by_key(|record| record.created_at);
        Ok(found)
    }
}

#[async_trait]
impl SubjectStore for RedisStore {
    async fn get_subject(&self, id: &str) -> Result<Option<Subject>, StoreError> {
        let mut conn = self.conn().await?;
        Self::read(&mut conn, &subject_key(id)).await
    }

    async fn put_subject(&self, subject: Subject) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        Self::write(&mut conn, &subject_key(&subject.id), &subject).await
    }

    async fn save_analysis(&self, result: AnalysisResult) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        Self::write(&mut conn, &analysis_key(&result.subject_id), &result).await
    }

    async fn get_analysis(&self, subject_id: &str) -> Result<Option<AnalysisResult>, StoreError> {
        let mut conn = self.conn().await?;
        Self::read(&mut conn, &analysis_key(subject_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let id = Uuid::nil();
        assert_eq!(
            task_key(id),
            "cardforge:task:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(subject_key("sku-1"), "cardforge:subject:sku-1");
        assert_eq!(analysis_key("sku-1"), "cardforge:analysis:sku-1");
    }

    #[test]
    fn status_sets_follow_the_task() {
        let record = TaskRecord::new("sku-1", chrono::Utc::now());
        assert_eq!(
            index_on_create(&record),
            IndexMove {
                remove: None,
                add: Some("cardforge:tasks:creating".into()),
            }
        );

        let (record, index) = plan_update(
            record,
            &TaskPatch {
                status: Some(TaskStatus::Analyzing),
                progress: Some(10),
                ..Default::default()
            },
        );
        assert_eq!(record.status, TaskStatus::Analyzing);
        assert_eq!(record.progress, 10);
        assert_eq!(
            index,
            IndexMove {
                remove: Some("cardforge:tasks:creating".into()),
                add: Some("cardforge:tasks:analyzing".into()),
            }
        );

        let (record, index) = plan_update(
            record,
            &TaskPatch {
                status: Some(TaskStatus::Analyzing),
                progress: Some(40),
                ..Default::default()
            },
        );
        assert_eq!(record.progress, 40);
        assert_eq!(index, IndexMove::default());

        let (record, index) = plan_update(
            record,
            &TaskPatch {
                status: Some(TaskStatus::Error),
                error_message: Some("processing timeout".into()),
                ..Default::default()
            },
        );
        assert_eq!(record.error_message.as_deref(), Some("processing timeout"));
        assert_eq!(index.remove.as_deref(), Some("cardforge:tasks:analyzing"));
        assert_eq!(index.add.as_deref(), Some("cardforge:tasks:error"));
    }

    #[tokio::test]
    async fn unreachable_server_reports_unavailable() {
        let client = redis::Client::open("redis://127.0.0.1:1/").expect("url parses");
        let store = RedisStore::new(client);
        let err = store.get(Uuid::nil()).await.expect_err("no server on port 1");
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
