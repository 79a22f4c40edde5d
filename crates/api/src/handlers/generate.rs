//! Generation endpoint: one route per capability, blocking until the
//! artifact has been delivered.

use axum::extract::{Path, State};
use axum::Json;
use kiln_core::capability::Capability;
use kiln_workers::{GenerationJob, JobOutcome};
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// POST /api/v1/generate/{capability}
///
/// The body holds the capability's request fields plus an optional
/// `destination` path for the artifact.
pub async fn generate(
    State(state): State<AppState>,
    Path(capability): Path<String>,
    Json(body): Json<Value>,
) -> AppResult<Json<DataResponse<JobOutcome>>> {
    let capability: Capability = capability.parse().map_err(AppError::NotFound)?;
    let job = GenerationJob::from_json(capability, body)
        .map_err(|e| AppError::BadRequest(format!("Invalid {capability} request: {e}")))?;

    let outcome = state
        .orchestrator
        .submit(job, state.fleet.cancel_token())
        .await?;
    Ok(Json(DataResponse { data: outcome }))
}
