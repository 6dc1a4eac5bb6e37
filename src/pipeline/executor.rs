use super::extract::StagePayload;
use crate::config::RetrySettings;
use crate::llm::{InferenceClient, InferenceRequest, LlmError};
use crate::models::StageKind;
use async_trait::async_trait;
use serde_json::Value;
use std::{fmt::Display, future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

/// Substrings (lower-case) that mark a request the service will never accept.
pub const TERMINAL_MARKERS: &[&str] = &[
    "schema",
    "response_format",
    "invalid format",
    "invalid_format",
    "invalid parameter",
    "invalid_parameter",
    "invalid_request",
    "unsupported parameter",
    "unsupported_parameter",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Terminal,
}

pub fn classify_message(message: &str) -> ErrorClass {
    let lowered = message.to_lowercase();
    if TERMINAL_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        ErrorClass::Terminal
    } else {
        ErrorClass::Transient
    }
}

fn classify_llm_error(err: &LlmError) -> ErrorClass {
    match err {
        LlmError::MissingGateway => ErrorClass::Terminal,
        other => classify_message(&other.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff_base: settings.backoff_base(),
        }
    }

    /// Linear ladder: the n-th retry waits `base × n`, saturating.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        self.backoff_base.checked_mul(retry).unwrap_or(Duration::MAX)
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Succeeded {
        value: T,
        attempts: u32,
    },
    Failed {
        class: ErrorClass,
        message: String,
        attempts: u32,
    },
}

/// Runs `op` until it succeeds, hits a terminal error, or uses up
/// `max_attempts`. `op` receives the 1-based attempt number. The sleeper is
/// only consulted between attempts.
pub async fn retry_with_policy<T, E, F, Fut, C, B>(
    max_attempts: u32,
    backoff: B,
    classify: C,
    sleeper: &dyn Sleeper,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    C: Fn(&E) -> ErrorClass,
    B: Fn(u32) -> Duration,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                };
            }
            Err(err) => {
                let class = classify(&err);
                if class == ErrorClass::Terminal || attempt >= max_attempts {
                    return RetryOutcome::Failed {
                        class,
                        message: err.to_string(),
                        attempts: attempt,
                    };
                }
                let delay = backoff(attempt);
                debug!(
                    target = "cardforge.stage",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retry_scheduled"
                );
                sleeper.sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Rejected with a terminal signature; retries were skipped.
    Terminal,
    /// Every attempt failed transiently.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct StageOutput {
    pub payload: StagePayload,
    pub attempts: u32,
}

#[derive(Debug, Clone, Error)]
#[error("stage `{}` failed after {attempts} attempt(s): {message}", .stage.as_str())]
pub struct StageFailure {
    pub stage: StageKind,
    pub class: FailureClass,
    pub message: String,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct StageExecutor {
    inference: Arc<dyn InferenceClient>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
}

impl StageExecutor {
    pub fn new(
        inference: Arc<dyn InferenceClient>,
        sleeper: Arc<dyn Sleeper>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            inference,
            sleeper,
            policy,
        }
    }

    pub async fn run_stage(&self, request: &InferenceRequest) -> Result<StageOutput, StageFailure> {
        let stage = request.stage;
        let policy = self.policy;
        let outcome = retry_with_policy(
            policy.max_attempts,
            |retry| policy.delay_before_retry(retry),
            classify_llm_error,
            self.sleeper.as_ref(),
            |attempt| {
                if attempt > 1 {
                    crate::metrics::stage_retry(stage.as_str(), attempt);
                }
                self.inference.invoke(request)
            },
        )
        .await;

        match outcome {
            RetryOutcome::Succeeded { value, attempts } => Ok(StageOutput {
                payload: payload_from_response(value),
                attempts,
            }),
            RetryOutcome::Failed {
                class,
                message,
                attempts,
            } => {
                let class = match class {
                    ErrorClass::Terminal => FailureClass::Terminal,
                    ErrorClass::Transient => FailureClass::Exhausted,
                };
                warn!(
                    target = "cardforge.stage",
                    stage = stage.as_str(),
                    attempts,
                    terminal = class == FailureClass::Terminal,
                    error = %message,
                    "stage_failed"
                );
                Err(StageFailure {
                    stage,
                    class,
                    message,
                    attempts,
                })
            }
        }
    }
}

/// Normalizes the raw service response. Arrays are searched for a
/// `"message"` element (or a chat-style `"text"` element) and its text is
/// returned; objects are kept structured.
pub fn payload_from_response(value: Value) -> StagePayload {
    match value {
        Value::Object(map) => StagePayload::Structured(map),
        Value::String(text) => StagePayload::RawText(text),
        Value::Array(items) => match envelope_text(&items) {
            Some(text) => StagePayload::RawText(text),
            None => StagePayload::RawText(Value::Array(items).to_string()),
        },
        Value::Null => StagePayload::RawText(String::new()),
        other => StagePayload::RawText(other.to_string()),
    }
}

fn envelope_text(items: &[Value]) -> Option<String> {
    let typed = |kind: &str| {
        items
            .iter()
            .find(|item| item.get("type").and_then(Value::as_str) == Some(kind))
    };
    if let Some(message) = typed("message") {
        return message.get("content").and_then(content_text);
    }
    typed("text")
        .and_then(|item| item.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Object(part) => part.get("text").and_then(Value::as_str).map(str::to_string),
        Value::Array(parts) => {
            let joined: Vec<&str> = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            (!joined.is_empty()).then(|| joined.join(""))
        }
        _ => None,
    }
}
