//! Handlers for fleet management: status, logs, deploy, start/stop and
//! the checkpoint listing.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use kiln_core::error::CoreError;
use kiln_events::LogEntry;
use kiln_supervisor::{FleetStatus, WorkerState};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Only entries tagged with this worker (or `system`).
    pub worker: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub started: bool,
}

#[derive(Debug, Serialize)]
pub struct StopAllResponse {
    pub stopped: usize,
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<AppState>) -> Json<DataResponse<FleetStatus>> {
    Json(DataResponse {
        data: state.fleet.status().await,
    })
}

/// GET /api/v1/logs?worker=<name>
pub async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Json<DataResponse<Vec<LogEntry>>> {
    Json(DataResponse {
        data: state.fleet.logs(query.worker.as_deref()),
    })
}

/// GET /api/v1/logs/stream?worker=<name>
///
/// Server-sent events, one `log` event per entry appended after the
/// client connects. The stream ends when the fleet shuts down.
pub async fn stream_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.fleet.log_sink().subscribe();
    let filter = query.worker.filter(|w| !w.is_empty());
    let shutdown = state.fleet.cancel_token().clone().cancelled_owned();

    let entries = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(entry) => return Some((entry, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Log stream subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let events = entries
        .filter(move |entry| {
            let keep = filter.as_deref().map_or(true, |w| entry.matches(w));
            futures::future::ready(keep)
        })
        .map(|entry| {
            let event = Event::default()
                .event("log")
                .json_data(&entry)
                .unwrap_or_else(|_| Event::default().event("log").data(entry.to_line()));
            Ok(event)
        })
        .take_until(shutdown);

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// POST /api/v1/deploy
///
/// Installs run in the background; progress shows up in status and logs.
pub async fn deploy(
    State(state): State<AppState>,
) -> AppResult<(StatusCode, Json<DataResponse<DeployResponse>>)> {
    if !state.fleet.deploy() {
        return Err(CoreError::Cancelled.into());
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: DeployResponse { started: true },
        }),
    ))
}

/// POST /api/v1/workers/{name}/start
///
/// Responds once the worker answers its readiness probe.
pub async fn start_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<DataResponse<WorkerState>>> {
    let worker = state.fleet.start(&name).await?;
    Ok(Json(DataResponse { data: worker }))
}

/// POST /api/v1/workers/{name}/stop
pub async fn stop_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<DataResponse<WorkerState>>> {
    state.fleet.stop(&name).await?;
    let worker = state.fleet.catalog().require(&name)?;
    Ok(Json(DataResponse {
        data: state.fleet.supervisor().worker_state(worker),
    }))
}

/// POST /api/v1/workers/stop-all
pub async fn stop_all(State(state): State<AppState>) -> Json<DataResponse<StopAllResponse>> {
    let stopped = state.fleet.stop_all().await;
    Json(DataResponse {
        data: StopAllResponse { stopped },
    })
}

/// GET /api/v1/models
pub async fn list_models(State(state): State<AppState>) -> Json<DataResponse<Vec<String>>> {
    Json(DataResponse {
        data: state.fleet.list_models(),
    })
}
