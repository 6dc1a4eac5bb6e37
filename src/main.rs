mod catalog;
mod config;
mod http;
mod jobs;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod publish;
mod store;
#[cfg(test)]
mod testing;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use config::AppConfig;
use jobs::{Submitted, TaskError, TaskService, inflight::InFlightSet, processor::TaskProcessor, recovery::RecoveryInitializer};
use llm::{LlmConfig, TensorZeroClient};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{AnalysisResult, ApiError, ItemSubmission, TaskRecord};
use pipeline::{
    Pipeline, PipelineErrorKind,
    executor::{RetryPolicy, StageExecutor, TokioSleeper},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "cardforge.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let config = AppConfig::load()?;

    let store = store::from_env();
    let inference = Arc::new(TensorZeroClient::new(LlmConfig::from_env()));
    let executor = StageExecutor::new(
        inference,
        Arc::new(TokioSleeper),
        RetryPolicy::from_settings(&config.retry),
    );
    let pipeline = Pipeline::new(
        executor,
        catalog::from_env(),
        config.scoring.clone(),
        config.reconcile.clone(),
    );
    let processor = TaskProcessor::new(
        store.clone(),
        pipeline,
        publish::from_env(),
        InFlightSet::new(),
        config.tasks.timeout(),
    );

    // Unfinished work from a previous run is settled before any request is served.
    let report = RecoveryInitializer::new(store.clone(), processor.clone())
        .run()
        .await?;
    info!(
        target = "cardforge.api",
        resumed = report.resumed.len(),
        timed_out = report.timed_out.len(),
        missing_subject = report.missing_subject.len(),
        "startup_recovery_done"
    );

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let state = AppState {
        tasks: TaskService::new(store, processor),
        openapi: Arc::new(load_openapi()),
        prometheus_handle,
    };
    let app = build_router(state, config.server.request_max_bytes);

    let addr: SocketAddr = ([0, 0, 0, 0], config.server.port).into();
    info!(target = "cardforge.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!(target = "cardforge.api", "server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(target = "cardforge.api", error = %err, "ctrl_c_handler_failed");
        std::future::pending::<()>().await;
    }
    info!(target = "cardforge.api", "shutdown_requested");
}

#[derive(Clone)]
struct AppState {
    tasks: TaskService,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

fn build_router(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/items", post(submit_item))
        .route("/items/{id}/analysis", get(get_analysis))
        .route("/tasks", post(submit_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/resume", post(resume_task))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or(json!({"openapi": "3.0.3"}))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "cardforge-api-rs",
    }))
}

async fn openapi_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json((*state.openapi).clone())
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Cardforge API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#,
    )
}

async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
}

/// Store an item and start its analysis.
///
/// - Method: `POST`
/// - Path: `/items`
/// - Body: `ItemSubmission`
/// - Response: `202` with `{ task_id, subject_id }`
async fn submit_item(
    State(state): State<AppState>,
    Json(payload): Json<ItemSubmission>,
) -> Result<(StatusCode, Json<Submitted>), AppError> {
    crate::metrics::inc_requests("/items");
    let submitted = state.tasks.submit_item(payload).await?;
    Ok((StatusCode::ACCEPTED, Json(submitted)))
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    subject_id: String,
}

/// Start a new analysis task for an already stored item.
async fn submit_task(
    State(state): State<AppState>,
    Json(payload): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<Submitted>), AppError> {
    crate::metrics::inc_requests("/tasks");
    let task_id = state.tasks.submit(payload.subject_id.trim()).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Submitted {
            task_id,
            subject_id: payload.subject_id.trim().to_string(),
        }),
    ))
}

#[derive(Debug, Serialize)]
struct ResumeResponse {
    task_id: Uuid,
    accepted: bool,
}

async fn resume_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResumeResponse>, AppError> {
    crate::metrics::inc_requests("/tasks/{id}/resume");
    let task_id = parse_task_id(&id)?;
    let accepted = state.tasks.resume(task_id).await?;
    Ok(Json(ResumeResponse { task_id, accepted }))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskRecord>, AppError> {
    let task_id = parse_task_id(&id)?;
    Ok(Json(state.tasks.task(task_id).await?))
}

async fn get_analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AnalysisResult>, AppError> {
    Ok(Json(state.tasks.analysis(&id).await?))
}

fn parse_task_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::BadRequest("invalid_task_id"))
}

#[derive(Debug)]
enum AppError {
    BadRequest(&'static str),
    Task(TaskError),
}

impl From<TaskError> for AppError {
    fn from(value: TaskError) -> Self {
        Self::Task(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            AppError::BadRequest(code) => (StatusCode::BAD_REQUEST, code, None),
            AppError::Task(err) => {
                let (status, code) = match &err {
                    TaskError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
                    TaskError::SubjectNotFound(_) => (StatusCode::NOT_FOUND, "subject_not_found"),
                    TaskError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "task_not_found"),
                    TaskError::AnalysisNotFound(_) => (StatusCode::NOT_FOUND, "analysis_not_found"),
                    TaskError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
                    TaskError::Pipeline(inner) => match inner.kind() {
                        PipelineErrorKind::InvalidInput => (StatusCode::BAD_REQUEST, inner.stage()),
                        PipelineErrorKind::NotFound => (StatusCode::NOT_FOUND, inner.stage()),
                        PipelineErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, inner.stage()),
                    },
                    TaskError::Transition(_) | TaskError::Publish(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal")
                    }
                };
                (status, code, Some(err.to_string()))
            }
        };
        let payload = ApiError {
            error: error.to_string(),
            detail,
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
