pub mod fleet;
pub mod generate;
pub mod health;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /status                      fleet + host stats
/// /logs                        log snapshot
/// /deploy                      background install of every worker
/// /workers/{name}/start        start and wait until ready
/// /workers/{name}/stop
/// /workers/stop-all
/// /models                      image checkpoints
/// /generate/{capability}       run one job
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(fleet::router())
        .nest("/generate", generate::router())
}
