use axum::routing::post;
use axum::Router;

use crate::handlers::generate;
use crate::state::AppState;

/// Mounted at `/generate`.
pub fn router() -> Router<AppState> {
    Router::new().route("/{capability}", post(generate::generate))
}
