use super::{InferenceClient, InferenceRequest, LlmError, LlmMessage};
use crate::http::{build_client, describe_failure};
use crate::models::StageKind;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub extract_function: String,
    pub align_function: String,
    pub model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: std::env::var("TENSORZERO_GATEWAY_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
            api_key: std::env::var("TENSORZERO_API_KEY").ok(),
            extract_function: std::env::var("TENSORZERO_STAGE1_FUNCTION")
                .unwrap_or_else(|_| "item_attribute_extraction".into()),
            align_function: std::env::var("TENSORZERO_STAGE2_FUNCTION")
                .unwrap_or_else(|_| "item_catalog_alignment".into()),
            model: std::env::var("TENSORZERO_MODEL").ok(),
        }
    }

    fn function_for(&self, stage: StageKind) -> &str {
        match stage {
            StageKind::ExtractAttributes => &self.extract_function,
            StageKind::AlignCatalog => &self.align_function,
        }
    }
}

pub struct TensorZeroClient {
    http: Client,
    config: LlmConfig,
}

impl TensorZeroClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }
}

#[async_trait]
impl InferenceClient for TensorZeroClient {
    async fn invoke(&self, request: &InferenceRequest) -> Result<Value, LlmError> {
        let gateway = self.config.gateway_url.trim().trim_end_matches('/');
        if gateway.is_empty() {
            return Err(LlmError::MissingGateway);
        }

        let body = ChatRequest {
            function_name: self.config.function_for(request.stage).to_string(),
            model_name: self.config.model.clone(),
            input: ChatInput {
                messages: request.messages.clone(),
            },
        };

        let mut call = self.http.post(format!("{gateway}/inference")).json(&body);
        if let Some(key) = &self.config.api_key {
            call = call.header("X-API-Key", key);
        }

        let response = call
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Http(describe_failure(response).await));
        }

        let body = response
            .text()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        let payload = decode_body(body);
        debug!(
            target = "cardforge.llm",
            stage = request.stage.as_str(),
            text_body = payload.is_string(),
            "inference_response_received"
        );
        Ok(unwrap_envelope(payload))
    }
}

/// A body that is not JSON is handed on as a bare string for extraction.
fn decode_body(body: String) -> Value {
    match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(_) => Value::String(body),
    }
}

/// Gateways wrap the model output in `content` (chat style) or `output`
/// (responses style). Hand back the inner array when one is present.
fn unwrap_envelope(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) => {
            for key in ["content", "output"] {
                if matches!(map.get(key), Some(Value::Array(_))) {
                    return map.remove(key).unwrap_or(Value::Null);
                }
            }
            Value::Object(map)
        }
        other => other,
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    input: ChatInput,
}

#[derive(Debug, Serialize)]
struct ChatInput {
    messages: Vec<LlmMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_prefers_content_array() {
        let raw = json!({
            "inference_id": "abc",
            "content": [{"type": "text", "text": "{}"}],
        });
        assert_eq!(unwrap_envelope(raw), json!([{"type": "text", "text": "{}"}]));
    }

    #[test]
    fn envelope_falls_back_to_output_array() {
        let raw = json!({
            "output": [{"type": "message", "content": "hello"}],
        });
        assert!(unwrap_envelope(raw).is_array());
    }

    #[test]
    fn envelope_keeps_plain_objects() {
        let raw = json!({"attributes": []});
        assert_eq!(unwrap_envelope(raw.clone()), raw);
    }

    fn config(gateway_url: &str) -> LlmConfig {
        LlmConfig {
            gateway_url: gateway_url.into(),
            api_key: None,
            extract_function: "a".into(),
            align_function: "b".into(),
            model: None,
        }
    }

    async fn serve(reply: &'static str, content_type: &'static str) -> String {
        use axum::{Router, http::header, routing::post};

        let app = Router::new().route(
            "/inference",
            post(move || async move { ([(header::CONTENT_TYPE, content_type)], reply) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn request() -> InferenceRequest {
        InferenceRequest {
            stage: StageKind::ExtractAttributes,
            messages: vec![LlmMessage::user("hi")],
        }
    }

    #[test]
    fn non_json_bodies_become_strings() {
        assert_eq!(decode_body("Бренд: Casio".into()), json!("Бренд: Casio"));
        assert_eq!(decode_body("{\"a\": 1}".into()), json!({"a": 1}));
    }

    #[tokio::test]
    async fn plain_text_reply_is_passed_through() {
        let url = serve("Цвет: черный\nБренд: Casio", "text/plain").await;
        let client = TensorZeroClient::new(config(&url));
        let value = client.invoke(&request()).await.expect("plain text");
        assert_eq!(value, json!("Цвет: черный\nБренд: Casio"));
    }

    #[tokio::test]
    async fn json_reply_is_unwrapped() {
        let url = serve(
            r#"{"content": [{"type": "text", "text": "{}"}]}"#,
            "application/json",
        )
        .await;
        let client = TensorZeroClient::new(config(&url));
        let value = client.invoke(&request()).await.expect("json");
        assert_eq!(value, json!([{"type": "text", "text": "{}"}]));
    }

    #[tokio::test]
    async fn missing_gateway_is_reported() {
        let client = TensorZeroClient::new(config("  "));
        let err = client
            .invoke(&request())
            .await
            .expect_err("no gateway");
        assert!(matches!(err, LlmError::MissingGateway));
    }
}
