mod tensorzero;

use crate::models::StageKind;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub use tensorzero::{LlmConfig, TensorZeroClient};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing gateway url")]
    MissingGateway,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub stage: StageKind,
    pub messages: Vec<LlmMessage>,
}

/// Opaque inference capability. The returned value is whatever the service
/// produced: a string, an object, or an array of typed content elements.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn invoke(&self, request: &InferenceRequest) -> Result<Value, LlmError>;
}
