use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kiln_core::error::CoreError;
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for fleet and job failures and adds HTTP-specific
/// variants. Produces `{ "error", "code" }` JSON bodies.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

/// HTTP status for each domain error.
fn core_status(err: &CoreError) -> StatusCode {
    match err {
        CoreError::AlreadyRunning(_)
        | CoreError::NotRunning(_)
        | CoreError::NotInstalled { .. }
        | CoreError::NoCheckpoint(_) => StatusCode::CONFLICT,
        CoreError::StartupTimeout { .. } | CoreError::GenerationTimeout { .. } => {
            StatusCode::GATEWAY_TIMEOUT
        }
        CoreError::InvalidWorkerResponse { .. }
        | CoreError::WorkerUnreachable { .. }
        | CoreError::GenerationFailed { .. } => StatusCode::BAD_GATEWAY,
        CoreError::ArtifactReadFailure { .. } | CoreError::InstallStepFailure { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        CoreError::UnknownWorker(_) => StatusCode::NOT_FOUND,
        CoreError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Core(core) => {
                let status = core_status(core);
                if status.is_server_error() {
                    tracing::warn!(error = %core, code = core.code(), "Request failed");
                }
                (status, core.code(), core.to_string())
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
