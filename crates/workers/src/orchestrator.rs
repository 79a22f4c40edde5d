//! Job orchestration: ensure running, submit, await completion, deliver.
//!
//! Jobs for the same worker are queued behind a per-worker async mutex so
//! only one is in flight per worker at a time; jobs for different workers
//! run concurrently. Every transition is recorded in the log sink under the
//! worker's tag. No failure is retried.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_core::capability::Capability;
use kiln_core::catalog::{Protocol, WorkerCatalog, WorkerDescriptor};
use kiln_core::error::CoreError;
use kiln_core::layout::Layout;
use kiln_events::LogSink;
use kiln_supervisor::{CommandRunner, Fleet, ReadinessProber};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::api::{WorkerApi, WorkerApiError};
use crate::artifact;
use crate::workflow::{self, CHECKPOINT_INPUT, CHECKPOINT_LOADER};
use crate::request::{GenerationJob, GenerationRequest, ImageRequest};
use crate::schemas::{AudioReply, FileRef, HistoryState, MeshReply, MotionReply, RigReply, SyncReply};

/// Consecutive failed status polls tolerated before a worker is declared
/// unreachable.
const MAX_POLL_TRANSPORT_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Delay between history polls of an async job.
    pub poll_interval: Duration,
    /// History polls before giving up with [`CoreError::GenerationTimeout`].
    pub max_polls: u32,
    /// Timeout of one status or download request.
    pub request_timeout: Duration,
    /// Timeout of a synchronous generation call, which does all the work.
    pub sync_timeout: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_polls: 180,
            request_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(600),
        }
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub worker: String,
    pub capability: Capability,
    /// Destination path, or the worker-local path when none was requested.
    pub artifact: PathBuf,
}

pub struct JobOrchestrator {
    catalog: Arc<WorkerCatalog>,
    layout: Layout,
    prober: Arc<ReadinessProber>,
    logs: Arc<LogSink>,
    config: JobConfig,
    http: reqwest::Client,
    sync_http: reqwest::Client,
    /// One queue per worker; built once since the catalog is fixed.
    queues: HashMap<String, Arc<Mutex<()>>>,
    client_id: String,
}

impl JobOrchestrator {
    pub fn new(
        catalog: Arc<WorkerCatalog>,
        layout: Layout,
        prober: Arc<ReadinessProber>,
        logs: Arc<LogSink>,
        config: JobConfig,
    ) -> Self {
        let queues = catalog
            .iter()
            .map(|w| (w.name.clone(), Arc::new(Mutex::new(()))))
            .collect();
        let client = |timeout| {
            reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default()
        };
        Self {
            http: client(config.request_timeout),
            sync_http: client(config.sync_timeout),
            catalog,
            layout,
            prober,
            logs,
            config,
            queues,
            client_id: format!("kiln-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Orchestrator sharing the fleet's catalog, layout, prober and logs.
    pub fn from_fleet<R: CommandRunner + 'static>(fleet: &Fleet<R>, config: JobConfig) -> Self {
        Self::new(
            Arc::clone(fleet.catalog()),
            fleet.layout().clone(),
            Arc::clone(fleet.prober()),
            Arc::clone(fleet.log_sink()),
            config,
        )
    }

    /// Run `job` to completion on the worker serving its capability.
    ///
    /// Relative paths in the job are taken from the outputs directory.
    pub async fn submit(
        &self,
        mut job: GenerationJob,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, CoreError> {
        let capability = job.request.capability();
        let worker = self
            .catalog
            .for_capability(capability)
            .ok_or_else(|| CoreError::UnknownWorker(capability.to_string()))?;
        let name = worker.name.as_str();
        job.resolve_paths(&self.layout);

        let queue = self
            .queues
            .get(name)
            .cloned()
            .unwrap_or_else(|| Arc::new(Mutex::new(())));
        let _turn = tokio::select! {
            () = cancel.cancelled() => return Err(CoreError::Cancelled),
            turn = queue.lock_owned() => turn,
        };

        let result = self.run(worker, &job, cancel).await;
        match &result {
            Ok(outcome) => {
                tracing::info!(
                    worker = %name,
                    job_id = %outcome.job_id,
                    artifact = %outcome.artifact.display(),
                    "Job complete",
                );
                self.logs.append(
                    name,
                    format!("Job {} complete: {}", outcome.job_id, outcome.artifact.display()),
                );
            }
            Err(e) => {
                tracing::warn!(worker = %name, error = %e, "Job failed");
                self.logs.append(name, format!("Job failed: {e}"));
            }
        }
        result
    }

    async fn run(
        &self,
        worker: &WorkerDescriptor,
        job: &GenerationJob,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, CoreError> {
        let name = worker.name.as_str();
        self.logs
            .append(name, format!("{} job received", job.request.capability()));

        self.prober.ensure_running(name, cancel).await?;

        let output_dir = self.layout.worker_output_dir(worker);
        let job_id = uuid::Uuid::new_v4().to_string();
        let destination = job.destination.as_deref();
        let sync_body = job.request.sync_body(&output_dir, &job_id);

        let (job_id, artifact) = match (&worker.protocol, &job.request, sync_body) {
            (Protocol::AsyncById, GenerationRequest::Image(req), _) => {
                self.run_async(worker, req, &output_dir, destination, cancel)
                    .await?
            }
            (Protocol::Sync { endpoint }, request, Some(body)) => {
                tokio::fs::create_dir_all(&output_dir).await.map_err(|e| {
                    CoreError::ArtifactReadFailure {
                        path: output_dir.display().to_string(),
                        reason: e.to_string(),
                    }
                })?;
                let reported = self
                    .run_sync(worker, endpoint, request, &body, &job_id, cancel)
                    .await?;
                let source = artifact::reported_path(&output_dir, &reported);
                let delivered = artifact::deliver(&source, destination).await?;
                (job_id, delivered)
            }
            _ => {
                return Err(CoreError::InvalidWorkerResponse {
                    worker: name.to_string(),
                    reason: format!(
                        "worker protocol does not accept {} jobs",
                        job.request.capability()
                    ),
                });
            }
        };

        Ok(JobOutcome {
            job_id,
            worker: name.to_string(),
            capability: worker.capability,
            artifact,
        })
    }

    // ---- async-by-id ----

    async fn run_async(
        &self,
        worker: &WorkerDescriptor,
        request: &ImageRequest,
        output_dir: &Path,
        destination: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<(String, PathBuf), CoreError> {
        let name = worker.name.as_str();
        let api = WorkerApi::with_client(self.http.clone(), worker.base_url());

        let checkpoint = match &request.checkpoint {
            Some(checkpoint) => checkpoint.clone(),
            None => self.default_checkpoint(&api, name).await?,
        };
        let graph = request.workflow(&checkpoint);

        let submitted = api
            .submit_workflow(&graph, &self.client_id)
            .await
            .map_err(|e| map_api_error(name, e))?;
        let prompt_id = submitted.prompt_id;
        tracing::info!(worker = %name, prompt_id = %prompt_id, "Job submitted");
        self.logs.append(
            name,
            match submitted.number {
                Some(n) => format!("Job {prompt_id} queued at position {n}"),
                None => format!("Job {prompt_id} queued"),
            },
        );

        let file = match self.poll_history(&api, name, &prompt_id, cancel).await {
            Ok(file) => file,
            Err(CoreError::Cancelled) => {
                if let Err(e) = api.cancel_prompt(&prompt_id).await {
                    tracing::debug!(worker = %name, error = %e, "Failed to dequeue cancelled job");
                }
                return Err(CoreError::Cancelled);
            }
            Err(e) => return Err(e),
        };
        self.logs
            .append(name, format!("Job {prompt_id} produced {}", file.filename));

        let artifact = self.fetch_output(&api, name, &file, output_dir, destination).await?;
        Ok((prompt_id, artifact))
    }

    /// Ask the worker which checkpoints it has and pick one.
    async fn default_checkpoint(&self, api: &WorkerApi, name: &str) -> Result<String, CoreError> {
        let info = api
            .object_info(CHECKPOINT_LOADER)
            .await
            .map_err(|e| map_api_error(name, e))?;
        let names = info
            .get(CHECKPOINT_LOADER)
            .map(|node| node.choices(CHECKPOINT_INPUT))
            .unwrap_or_default();
        let checkpoint = workflow::pick_checkpoint(&names)
            .ok_or_else(|| CoreError::NoCheckpoint(name.to_string()))?
            .to_string();
        tracing::debug!(worker = %name, available = names.len(), %checkpoint, "Checkpoint selected");
        self.logs.append(name, format!("Using checkpoint {checkpoint}"));
        Ok(checkpoint)
    }

    async fn poll_history(
        &self,
        api: &WorkerApi,
        name: &str,
        prompt_id: &str,
        cancel: &CancellationToken,
    ) -> Result<FileRef, CoreError> {
        let mut transport_failures = 0;

        for attempt in 1..=self.config.max_polls {
            tokio::select! {
                () = cancel.cancelled() => return Err(CoreError::Cancelled),
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let history = match api.get_history(prompt_id).await {
                Ok(history) => {
                    transport_failures = 0;
                    history
                }
                Err(e) if e.is_transport() => {
                    transport_failures += 1;
                    tracing::debug!(worker = %name, attempt, error = %e, "Status poll failed");
                    if transport_failures >= MAX_POLL_TRANSPORT_FAILURES {
                        return Err(map_api_error(name, e));
                    }
                    continue;
                }
                Err(e) => return Err(map_api_error(name, e)),
            };

            match history.get(prompt_id).map(|record| record.state()) {
                None | Some(HistoryState::Pending) => {}
                Some(HistoryState::Completed(file)) => return Ok(file),
                Some(HistoryState::Failed(reason)) => {
                    return Err(CoreError::GenerationFailed {
                        worker: name.to_string(),
                        job_id: prompt_id.to_string(),
                        reason,
                    });
                }
            }
        }

        Err(CoreError::GenerationTimeout {
            worker: name.to_string(),
            job_id: prompt_id.to_string(),
            attempts: self.config.max_polls,
        })
    }

    /// Read the output from the worker's output directory, falling back to
    /// downloading it from the worker when it is not on local disk.
    async fn fetch_output(
        &self,
        api: &WorkerApi,
        name: &str,
        file: &FileRef,
        output_dir: &Path,
        destination: Option<&Path>,
    ) -> Result<PathBuf, CoreError> {
        let local = artifact::local_path(output_dir, file).ok_or_else(|| {
            CoreError::InvalidWorkerResponse {
                worker: name.to_string(),
                reason: format!("output reference '{}' escapes the output directory", file.filename),
            }
        })?;

        if tokio::fs::try_exists(&local).await.unwrap_or(false) {
            return artifact::deliver(&local, destination).await;
        }

        tracing::debug!(worker = %name, file = %file.filename, "Output not on local disk, downloading");
        self.logs
            .append(name, format!("Downloading {} from worker", file.filename));
        let bytes = api
            .view(&file.filename, &file.subfolder, &file.kind)
            .await
            .map_err(|e| CoreError::ArtifactReadFailure {
                path: local.display().to_string(),
                reason: e.to_string(),
            })?;
        artifact::write(destination.unwrap_or(&local), &bytes).await
    }

    // ---- synchronous ----

    async fn run_sync(
        &self,
        worker: &WorkerDescriptor,
        endpoint: &str,
        request: &GenerationRequest,
        body: &serde_json::Value,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String, CoreError> {
        let name = worker.name.as_str();
        let api = WorkerApi::with_client(self.sync_http.clone(), worker.base_url());
        tracing::info!(worker = %name, job_id = %job_id, endpoint, "Job submitted");
        self.logs
            .append(name, format!("Job {job_id} submitted to {endpoint}"));

        let call = async {
            match request {
                GenerationRequest::Mesh(_) => call_sync::<MeshReply>(&api, endpoint, body).await,
                GenerationRequest::Rig(_) => call_sync::<RigReply>(&api, endpoint, body).await,
                GenerationRequest::Motion(_) => call_sync::<MotionReply>(&api, endpoint, body).await,
                GenerationRequest::Speech(_) | GenerationRequest::Audio(_) => {
                    call_sync::<AudioReply>(&api, endpoint, body).await
                }
                GenerationRequest::Image(_) => Err(WorkerApiError::Decode(
                    "image jobs need an async worker".to_string(),
                )),
            }
        };

        let reported = tokio::select! {
            () = cancel.cancelled() => return Err(CoreError::Cancelled),
            reply = call => reply.map_err(|e| map_api_error(name, e))?,
        };
        if reported.trim().is_empty() {
            return Err(CoreError::InvalidWorkerResponse {
                worker: name.to_string(),
                reason: "empty artifact path".to_string(),
            });
        }
        Ok(reported)
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }
}

async fn call_sync<T: SyncReply>(
    api: &WorkerApi,
    endpoint: &str,
    body: &serde_json::Value,
) -> Result<String, WorkerApiError> {
    let reply: T = api.post_json(endpoint, body).await?;
    Ok(reply.artifact_path().to_string())
}

/// Map a client error onto the job error taxonomy.
fn map_api_error(worker: &str, err: WorkerApiError) -> CoreError {
    match err {
        WorkerApiError::Request(e) => CoreError::WorkerUnreachable {
            worker: worker.to_string(),
            reason: e.to_string(),
        },
        WorkerApiError::ApiError { status, body } => CoreError::InvalidWorkerResponse {
            worker: worker.to_string(),
            reason: format!("HTTP {status}: {body}"),
        },
        WorkerApiError::Decode(reason) => CoreError::InvalidWorkerResponse {
            worker: worker.to_string(),
            reason,
        },
    }
}
