use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tracing::info;

use hub_core::ids::{MessageId, RunId, ThreadId};
use hub_core::run::RunParams;
use hub_core::OrchestratorError;
use hub_engine::engine::{CreateRunOutcome, CreateRunRequest};

use crate::context::OrchestratorContext;

pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8700 }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<OrchestratorContext>,
}

/// Error wrapper mapping the orchestrator taxonomy onto HTTP statuses.
struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Forbidden(_) => StatusCode::FORBIDDEN,
            OrchestratorError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::InvalidState(_) => StatusCode::CONFLICT,
            OrchestratorError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            OrchestratorError::RetryableFetch(_)
            | OrchestratorError::Timeout { .. }
            | OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": {
                "kind": self.0.error_kind(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Caller identity, taken from the `x-user-id` header. Absent headers fall
/// back to a shared anonymous identity.
fn caller_id(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

#[derive(Deserialize)]
struct CreateRunBody {
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    assistant_id: Option<String>,
    #[serde(default)]
    new_message: Option<String>,
    #[serde(flatten)]
    params: RunParams,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/runs", post(create_run_handler))
        .route("/v1/runs/{id}", get(get_run_handler))
        .route("/v1/runs/{id}/deltas", post(append_delta_handler))
        .route("/v1/threads/{id}/messages", get(list_messages_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

async fn create_run_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRunBody>,
) -> Result<Response, ApiError> {
    let stream = body.params.stream;
    let request = CreateRunRequest {
        caller_id: caller_id(&headers),
        thread_id: body.thread_id.map(ThreadId::from_raw),
        agent_id: body.agent_id,
        assistant_id: body.assistant_id,
        new_message: body.new_message,
        params: body.params,
    };
    let vars = request.params.user_env_vars.clone();

    match state.ctx.engine.create_run(request).await? {
        CreateRunOutcome::Scheduled(row) => {
            Ok((StatusCode::ACCEPTED, Json(json!({"scheduled_run": row}))).into_response())
        }
        CreateRunOutcome::Run(run) => {
            if stream {
                // Subscribe before execution starts so the subscriber holds
                // a live queue for every delta the backend writes.
                let rx = state.ctx.streamer.subscribe(&run, true);
                let engine = state.ctx.engine.clone();
                let run_id = run.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.execute(&run_id, &vars).await {
                        tracing::warn!(run_id = %run_id, error = %e, "streamed run execution failed");
                    }
                });
                Ok(sse_response(ReceiverStream::new(rx)))
            } else {
                let run = state.ctx.engine.execute(&run.id, &vars).await?;
                Ok(Json(json!({"run": run})).into_response())
            }
        }
    }
}

fn sse_response(
    stream: impl Stream<Item = hub_core::events::StreamEnvelope> + Send + 'static,
) -> Response {
    // Each frame is `data: {"event": .., "data": ..}\n\n`; the event kind
    // stays inside the JSON body, never in an SSE `event:` field.
    let events = stream
        .map(|envelope| Ok::<Event, Infallible>(Event::default().data(envelope.to_json())));
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

#[derive(Deserialize)]
struct AppendDeltaBody {
    kind: String,
    payload: serde_json::Value,
    #[serde(default)]
    message_id: Option<String>,
}

/// Ingestion point for out-of-process backends. Pooled-callout and
/// async-invocation runners report progress here; the rows feed every
/// watcher subscribed to the run.
async fn append_delta_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AppendDeltaBody>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = RunId::from_raw(id);
    let run = state
        .ctx
        .engine
        .runs()
        .get(&run_id)
        .map_err(OrchestratorError::from)?;
    if run.status.is_final() {
        return Err(ApiError(OrchestratorError::InvalidState(format!(
            "run {run_id} is finished"
        ))));
    }
    let message_id = body.message_id.map(MessageId::from_raw);
    let delta_id = state
        .ctx
        .engine
        .deltas()
        .append(&run_id, message_id.as_ref(), &body.kind, body.payload)
        .map_err(OrchestratorError::from)?;
    Ok(Json(json!({"id": delta_id})))
}

async fn get_run_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .ctx
        .engine
        .get_run(&caller_id(&headers), &RunId::from_raw(id))
        .await?;
    Ok(Json(json!({"run": run})))
}

async fn list_messages_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .ctx
        .engine
        .list_messages(&caller_id(&headers), &ThreadId::from_raw(id))
        .await?;
    Ok(Json(json!({"messages": messages})))
}

/// Bind and serve. Returns a handle that keeps the server task alive.
pub async fn start(
    config: ServerConfig,
    ctx: Arc<OrchestratorContext>,
) -> Result<ServerHandle, std::io::Error> {
    let cancel = ctx.cancel.clone();
    let router = build_router(AppState { ctx });
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(port = local_addr.port(), "hub server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
    })
}

/// Handle returned by `start()`; keeps the server task alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}
