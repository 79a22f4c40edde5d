use axum::routing::{get, post};
use axum::Router;

use crate::handlers::fleet;
use crate::state::AppState;

/// Fleet management routes, mounted at the `/api/v1` root.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(fleet::get_status))
        .route("/logs", get(fleet::get_logs))
        .route("/logs/stream", get(fleet::stream_logs))
        .route("/deploy", post(fleet::deploy))
        .route("/models", get(fleet::list_models))
        .route("/workers/stop-all", post(fleet::stop_all))
        .route("/workers/{name}/start", post(fleet::start_worker))
        .route("/workers/{name}/stop", post(fleet::stop_worker))
}
