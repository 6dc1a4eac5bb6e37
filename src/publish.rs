use crate::http::{build_client, describe_failure};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish request failed: {0}")]
    Request(String),
    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Hands a finished analysis to whatever publishes the item card.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, subject_id: &str, task_id: Uuid) -> Result<(), PublishError>;
}

pub fn from_env() -> Arc<dyn Publisher> {
    match std::env::var("PUBLISH_WEBHOOK_URL")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    {
        Some(url) => {
            info!(target = "cardforge.publish", url = %url, "using webhook publisher");
            Arc::new(WebhookPublisher::new(url))
        }
        None => Arc::new(LogPublisher),
    }
}

#[derive(Debug, Serialize)]
struct PublishNotice<'a> {
    subject_id: &'a str,
    task_id: Uuid,
}

pub struct WebhookPublisher {
    http: Client,
    url: String,
}

impl WebhookPublisher {
    pub fn new(url: String) -> Self {
        Self {
            http: build_client(),
            url,
        }
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, subject_id: &str, task_id: Uuid) -> Result<(), PublishError> {
        let response = self
            .http
            .post(&self.url)
            .json(&PublishNotice {
                subject_id,
                task_id,
            })
            .send()
            .await
            .map_err(|err| PublishError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(PublishError::Rejected(describe_failure(response).await));
        }
        info!(
            target = "cardforge.publish",
            subject_id = subject_id,
            task_id = %task_id,
            "webhook_delivered"
        );
        Ok(())
    }
}

/// Default handoff when no webhook is configured.
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, subject_id: &str, task_id: Uuid) -> Result<(), PublishError> {
        info!(
            target = "cardforge.publish",
            subject_id = subject_id,
            task_id = %task_id,
            "publish_handoff"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_webhook_is_a_request_error() {
        let publisher = WebhookPublisher::new("http://127.0.0.1:1/hook".into());
        let err = publisher
            .publish("sku-1", Uuid::nil())
            .await
            .expect_err("nothing listens on port 1");
        assert!(matches!(err, PublishError::Request(_)));
    }

    #[tokio::test]
    async fn log_publisher_always_accepts() {
        assert!(LogPublisher.publish("sku-1", Uuid::nil()).await.is_ok());
    }
}
