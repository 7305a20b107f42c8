use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

use crate::internal::{
    exec::executor::{RunReport, RunSignal},
    kernel::{Kernel, KernelError, RunOptions, RunSignaller},
    registry::IntentRoute,
    tools::spec::ToolDescriptor,
    trace::trace::{TraceError, TraceEvent},
};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished { report: RunReport },
    Error { error: Value },
}

struct RunEntry {
    signaller: RunSignaller,
    status: RunStatus,
}

#[derive(Clone)]
pub struct AppState {
    kernel: Kernel,
    runs: Arc<RwLock<HashMap<String, RunEntry>>>,
    bearer_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            runs: Arc::new(RwLock::new(HashMap::new())),
            bearer_token: None,
        }
    }

    /// Requires `Authorization: Bearer <token>` on every route.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(Arc::from(token.into()));
        self
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/runs", post(start_run))
        .route("/v1/runs/:run_id", get(get_run))
        .route("/v1/runs/:run_id/trace", get(get_trace))
        .route("/v1/runs/:run_id/confirm", post(confirm_run))
        .route("/v1/runs/:run_id/reject", post(reject_run))
        .route("/v1/runs/:run_id/cancel", post(cancel_run))
        .route("/v1/tools", get(list_tools))
        .route("/v1/intents", get(list_intents))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({ "error": { "code": code, "message": message.into() } })),
    )
}

fn kernel_error(err: &KernelError) -> ApiError {
    match err {
        KernelError::Validation(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "code": "intent.invalid", "message": e.to_string(), "data": e.to_value() } })),
        ),
        KernelError::Compile(e) => api_error(StatusCode::UNPROCESSABLE_ENTITY, e.code(), e.to_string()),
        KernelError::Trace(e @ (TraceError::RunAlreadyOpen(_) | TraceError::RunIdTaken(_))) => {
            api_error(StatusCode::CONFLICT, "run.exists", e.to_string())
        }
        KernelError::Trace(e) => api_error(StatusCode::CONFLICT, "trace.unavailable", e.to_string()),
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, "kernel.error", other.to_string()),
    }
}

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(token) = &state.bearer_token {
        let expected = format!("Bearer {}", token);
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return api_error(StatusCode::UNAUTHORIZED, "auth.unauthorized", "Unauthorized").into_response();
        }
    }
    next.run(request).await
}

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub intent: Value,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub allow_destructive: bool,
    /// Block until the run reaches a terminal state.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize)]
pub struct StartRunResponse {
    pub run_id: String,
    pub status_url: String,
    pub trace_url: String,
}

async fn start_run(
    State(state): State<AppState>,
    Json(request): Json<StartRunRequest>,
) -> Result<Response, ApiError> {
    let options = RunOptions {
        run_id: request.run_id,
        dry_run: request.dry_run,
        allow_destructive: request.allow_destructive,
        confirmation_timeout: None,
    };

    if request.wait {
        let report = state
            .kernel
            .run(request.intent, options)
            .await
            .map_err(|e| kernel_error(&e))?;
        return Ok((StatusCode::OK, Json(report)).into_response());
    }

    let handle = state
        .kernel
        .start(request.intent, options)
        .map_err(|e| kernel_error(&e))?;
    let run_id = handle.run_id().to_string();
    state.runs.write().await.insert(
        run_id.clone(),
        RunEntry {
            signaller: handle.signaller(),
            status: RunStatus::Running,
        },
    );

    let runs = state.runs.clone();
    let watched = run_id.clone();
    tokio::spawn(async move {
        let status = match handle.wait().await {
            Ok(report) => RunStatus::Finished { report },
            Err(e) => {
                let (_, Json(error)) = kernel_error(&e);
                RunStatus::Error { error }
            }
        };
        if let Some(entry) = runs.write().await.get_mut(&watched) {
            entry.status = status;
        }
    });

    tracing::info!(run_id = %run_id, "run accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(StartRunResponse {
            status_url: format!("/v1/runs/{}", run_id),
            trace_url: format!("/v1/runs/{}/trace", run_id),
            run_id,
        }),
    )
        .into_response())
}

async fn get_run(
    Path(run_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let runs = state.runs.read().await;
    let entry = runs
        .get(&run_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "run.not_found", format!("Run {} not found", run_id)))?;
    let mut body = serde_json::to_value(&entry.status)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "http.error", e.to_string()))?;
    body["run_id"] = json!(run_id);
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct TraceQuery {
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Serialize)]
pub struct TraceResponse {
    pub run_id: String,
    pub events: Vec<TraceEvent>,
}

async fn get_trace(
    Path(run_id): Path<String>,
    Query(query): Query<TraceQuery>,
    State(state): State<AppState>,
) -> Result<Json<TraceResponse>, ApiError> {
    let events = state
        .kernel
        .emitter()
        .read(&run_id, query.offset)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "trace.read", e.to_string()))?;
    if events.is_empty() && query.offset == 0 {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "run.not_found",
            format!("No trace for run {}", run_id),
        ));
    }
    Ok(Json(TraceResponse { run_id, events }))
}

async fn signal_run(state: &AppState, run_id: &str, signal: RunSignal) -> Result<Json<Value>, ApiError> {
    let runs = state.runs.read().await;
    let entry = runs
        .get(run_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "run.not_found", format!("Run {} not found", run_id)))?;
    if !matches!(entry.status, RunStatus::Running) || !entry.signaller.send(signal) {
        return Err(api_error(
            StatusCode::CONFLICT,
            "run.not_running",
            format!("Run {} is no longer accepting signals", run_id),
        ));
    }
    tracing::info!(run_id = %run_id, signal = ?signal, "signal delivered");
    Ok(Json(json!({ "run_id": run_id, "signal": signal, "delivered": true })))
}

async fn confirm_run(Path(run_id): Path<String>, State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    signal_run(&state, &run_id, RunSignal::Confirm).await
}

async fn reject_run(Path(run_id): Path<String>, State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    signal_run(&state, &run_id, RunSignal::Reject).await
}

async fn cancel_run(Path(run_id): Path<String>, State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    signal_run(&state, &run_id, RunSignal::Cancel).await
}

async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolDescriptor>> {
    Json(state.kernel.tools().descriptors())
}

async fn list_intents(State(state): State<AppState>) -> Json<Vec<IntentRoute>> {
    Json(state.kernel.units().list_intents())
}
