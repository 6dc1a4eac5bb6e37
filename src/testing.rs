//! Test doubles shared by the unit tests.

use crate::catalog::{CatalogClient, CatalogError, demo_definitions};
use crate::config::{ReconcileConfig, ScoringConfig};
use crate::jobs::inflight::InFlightSet;
use crate::jobs::processor::TaskProcessor;
use crate::llm::{InferenceClient, InferenceRequest, LlmError};
use crate::models::{AttributeDefinition, Subject, TaskRecord};
use crate::pipeline::Pipeline;
use crate::pipeline::executor::{RetryPolicy, Sleeper, StageExecutor};
use crate::publish::{PublishError, Publisher};
use crate::store::{MemoryStore, TaskStore};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Answers each call with the next scripted result. Once the script runs out
/// every call fails transiently. With a gate, each call first takes a permit.
pub struct ScriptedInference {
    responses: Mutex<VecDeque<Result<Value, LlmError>>>,
    calls: Arc<AtomicUsize>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedInference {
    pub fn new(responses: Vec<Result<Value, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Arc::new(AtomicUsize::new(0)),
            gate: None,
        }
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn invoke(&self, _request: &InferenceRequest) -> Result<Value, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Http("script exhausted".into())))
    }
}

#[derive(Default)]
pub struct RecordingSleeper {
    recorded: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.recorded.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.recorded.lock().unwrap().push(duration);
    }
}

#[derive(Default)]
pub struct StaticCatalog {
    categories: HashMap<String, Vec<AttributeDefinition>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, category_id: &str, defs: Vec<AttributeDefinition>) -> Self {
        self.categories.insert(category_id.to_string(), defs);
        self
    }
}

#[async_trait]
impl CatalogClient for StaticCatalog {
    async fn lookup(&self, category_id: &str) -> Result<Vec<AttributeDefinition>, CatalogError> {
        self.categories
            .get(category_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(category_id.to_string()))
    }
}

#[derive(Default)]
pub struct CountingPublisher {
    published: Mutex<Vec<(String, Uuid)>>,
    reject: bool,
}

impl CountingPublisher {
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<(String, Uuid)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for CountingPublisher {
    async fn publish(&self, subject_id: &str, task_id: Uuid) -> Result<(), PublishError> {
        if self.reject {
            return Err(PublishError::Rejected("HTTP 503".into()));
        }
        self.published
            .lock()
            .unwrap()
            .push((subject_id.to_string(), task_id));
        Ok(())
    }
}

/// The eight-attribute "watches" category of the demo catalog.
pub fn watch_catalog() -> Vec<AttributeDefinition> {
    demo_definitions("watches").expect("demo watches category")
}

pub fn sample_subject(id: &str) -> Subject {
    Subject {
        id: id.to_string(),
        name: "Часы Casio MTP-1302".into(),
        description: "Кварцевые часы, стальной корпус, черный циферблат".into(),
        category_id: "watches".into(),
        created_at: Utc::now(),
    }
}

/// A well-formed catalog-aligned reply wrapped the way the gateway returns it.
pub fn stage_two_response() -> Value {
    let body = json!({
        "title": "Часы наручные Casio MTP-1302",
        "description": "Классические кварцевые часы.",
        "attributes": [
            {"id": 85, "name": "Бренд", "value": "Casio"},
            {"id": 10096, "name": "Цвет товара", "value": "черный"},
            {"name": "Диаметр корпуса, мм", "value": "38 мм"},
        ]
    });
    json!([{"type": "message", "content": body.to_string()}])
}

pub fn build_processor(
    store: MemoryStore,
    inference: ScriptedInference,
    catalog: StaticCatalog,
    publisher: Arc<dyn Publisher>,
    timeout: Duration,
) -> TaskProcessor {
    let executor = StageExecutor::new(
        Arc::new(inference),
        Arc::new(RecordingSleeper::default()),
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
        },
    );
    let pipeline = Pipeline::new(
        executor,
        Arc::new(catalog),
        ScoringConfig::default(),
        ReconcileConfig::default(),
    );
    TaskProcessor::new(
        Arc::new(store),
        pipeline,
        publisher,
        InFlightSet::new(),
        timeout,
    )
}

/// Polls until the task reaches COMPLETED or ERROR.
pub async fn wait_until_final(store: &MemoryStore, id: Uuid) -> TaskRecord {
    for _ in 0..400 {
        if let Some(record) = store.get(id).await.unwrap()
            && record.status.is_terminal()
        {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {id} did not finish");
}
