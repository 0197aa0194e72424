//! HTTP intake using Axum.
//!
//! Any sandboxed outcome, including compile errors and timeouts, is a `200`
//! carrying an [`ExecutionReport`]. Non-2xx responses are reserved for
//! requests that never ran and always carry `{"error": "..."}`.

use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path as UrlPath, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::dispatcher::DispatcherStatus;
use crate::error::Error;
use crate::report::{self, ExecutionReport};
use crate::request::{BuildProfile, Channel, CompileTarget, ExecutionMode, ExecutionRequest};
use crate::state::AppState;

const MIB: u64 = 1024 * 1024;

#[derive(Deserialize)]
struct ExecuteRequest {
    #[serde(alias = "source")]
    code: String,
    #[serde(default)]
    mode: ExecutionMode,
    #[serde(default)]
    profile: BuildProfile,
    #[serde(default)]
    tests: bool,
    target: Option<CompileTarget>,
    channel: Option<Channel>,
    id: Option<String>,
    timeout_ms: Option<u64>,
    memory_mb: Option<u64>,
}

impl ExecuteRequest {
    fn into_request(self, forced_mode: Option<ExecutionMode>) -> Result<ExecutionRequest, Error> {
        let mut request = ExecutionRequest::new(self.code)
            .set_id(self.id)
            .mode(forced_mode.unwrap_or(self.mode))
            .profile(self.profile)
            .tests(self.tests)
            .target(self.target)
            .channel(self.channel);
        if let Some(ms) = self.timeout_ms {
            request = request.timeout(Duration::from_millis(ms));
        }
        if let Some(mb) = self.memory_mb {
            let bytes = mb
                .checked_mul(MIB)
                .ok_or_else(|| Error::invalid(format!("memory_mb {} is out of range", mb)))?;
            request = request.memory_limit(bytes);
        }
        Ok(request)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct CancelResponse {
    id: String,
    cancelled: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    dispatcher: DispatcherStatus,
    formatter: bool,
    uptime_secs: u64,
}

/// Error response with a JSON body.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::DuplicateRequest(_) => StatusCode::CONFLICT,
            Error::Busy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: format!("Invalid request: {}", rejection.body_text()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

/// Build the router. Unknown paths fall back to `static_root` when given.
pub fn router(state: AppState, static_root: Option<&Path>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/execute", post(execute))
        .route("/compile", post(compile))
        .route("/format", post(format))
        .route("/executions/:id", delete(cancel))
        .route("/status", get(status))
        .route("/health", get(health))
        .with_state(state);

    let app = match static_root {
        Some(root) => app.fallback_service(ServeDir::new(root)),
        None => app,
    };
    app.layer(cors).layer(TraceLayer::new_for_http())
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn run_server<F>(listener: TcpListener, app: Router, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "Starting HTTP server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> &'static str {
    "OK"
}

async fn execute(
    State(state): State<AppState>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecutionReport>, ApiError> {
    submit(state, body, None).await
}

async fn compile(
    State(state): State<AppState>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecutionReport>, ApiError> {
    submit(state, body, Some(ExecutionMode::Build)).await
}

async fn format(
    State(state): State<AppState>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecutionReport>, ApiError> {
    submit(state, body, Some(ExecutionMode::Format)).await
}

async fn submit(
    state: AppState,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
    forced_mode: Option<ExecutionMode>,
) -> Result<Json<ExecutionReport>, ApiError> {
    let Json(body) = body?;
    let execution = state
        .dispatcher
        .submit(body.into_request(forced_mode)?)
        .await?;
    Ok(Json(report::render(&execution)))
}

async fn cancel(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    if state.dispatcher.cancel(&id).await {
        Ok((
            StatusCode::ACCEPTED,
            Json(CancelResponse { id, cancelled: true }),
        ))
    } else {
        Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("No request with id {:?} is in flight", id),
        })
    }
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        dispatcher: state.dispatcher.status(),
        formatter: state.dispatcher.runner().toolchain().has_formatter(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
