//! Caller-facing facade over the whole fleet.
//!
//! [`Fleet`] owns the shared state (catalog, registry, log sink) and the
//! components built on it, and exposes the operations the HTTP layer
//! dispatches to. Background installs are tracked so shutdown can cancel
//! them and wait for them to unwind before stopping every worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kiln_core::capability::Capability;
use kiln_core::catalog::WorkerCatalog;
use kiln_core::error::CoreError;
use kiln_core::layout::Layout;
use kiln_events::{LogEntry, LogSink, DEFAULT_CAPACITY};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::installer::Installer;
use crate::prober::{ProbeConfig, ReadinessProber};
use crate::registry::Registry;
use crate::runner::{CommandRunner, ProcessRunner};
use crate::supervisor::{Supervisor, WorkerState, DEFAULT_STOP_GRACE};
use crate::system::SystemStats;

/// File extensions listed as model checkpoints.
const CHECKPOINT_EXTENSIONS: &[&str] = &["safetensors", "ckpt", "pt", "pth", "bin"];

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub root: PathBuf,
    /// Interpreter used to create worker environments.
    pub python: String,
    pub catalog: WorkerCatalog,
    pub probe: ProbeConfig,
    pub log_capacity: usize,
    pub stop_grace: Duration,
}

impl FleetConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            python: "python3".to_string(),
            catalog: WorkerCatalog::default_catalog(),
            probe: ProbeConfig::default(),
            log_capacity: DEFAULT_CAPACITY,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Aggregate status: every worker plus coarse host stats.
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub workers: Vec<WorkerState>,
    pub system: SystemStats,
}

pub struct Fleet<R = ProcessRunner> {
    layout: Layout,
    logs: Arc<LogSink>,
    supervisor: Arc<Supervisor>,
    prober: Arc<ReadinessProber>,
    installer: Arc<Installer<R>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Fleet<ProcessRunner> {
    /// Build a fleet that runs real external commands.
    pub fn new(config: FleetConfig) -> Self {
        Self::with_runner(config, ProcessRunner::new)
    }
}

impl<R: CommandRunner + 'static> Fleet<R> {
    /// Build a fleet whose installer runs commands through the runner
    /// produced by `make_runner`.
    pub fn with_runner(config: FleetConfig, make_runner: impl FnOnce(Arc<LogSink>) -> R) -> Self {
        let layout = Layout::new(&config.root);
        let logs = Arc::new(LogSink::with_file(&layout.log_file(), config.log_capacity));
        let registry = Arc::new(Registry::new());

        let supervisor = Arc::new(
            Supervisor::new(
                Arc::new(config.catalog),
                layout.clone(),
                registry,
                Arc::clone(&logs),
            )
            .with_stop_grace(config.stop_grace),
        );
        let prober = Arc::new(ReadinessProber::new(
            Arc::clone(&supervisor),
            Arc::clone(&logs),
            config.probe,
        ));
        let installer = Arc::new(Installer::new(
            make_runner(Arc::clone(&logs)),
            layout.clone(),
            Arc::clone(&logs),
            config.python,
        ));

        Self {
            layout,
            logs,
            supervisor,
            prober,
            installer,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Status of every worker plus host stats.
    pub async fn status(&self) -> FleetStatus {
        let root = self.layout.root().to_path_buf();
        let system = tokio::task::spawn_blocking(move || SystemStats::collect(&root))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "System stats task failed");
                SystemStats::default()
            });
        FleetStatus {
            workers: self.supervisor.states(),
            system,
        }
    }

    /// Snapshot of the log, optionally filtered to one worker.
    pub fn logs(&self, worker: Option<&str>) -> Vec<LogEntry> {
        self.logs.read(worker)
    }

    /// Kick off installation of every worker in catalog order and return
    /// immediately. Workers already running or installing are skipped.
    ///
    /// The host tools are checked first; if any is missing nothing is
    /// installed. Afterwards the shared output folder of every capability
    /// exists.
    ///
    /// Returns `false` if the fleet is shutting down.
    pub fn deploy(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        let names = self.supervisor.catalog().names();
        let supervisor = Arc::clone(&self.supervisor);
        let installer = Arc::clone(&self.installer);
        let logs = Arc::clone(&self.logs);
        let layout = self.layout.clone();
        let cancel = self.cancel.clone();

        self.logs.system("Deploy started");
        tracing::info!(workers = names.len(), "Deploy started");

        self.tasks.spawn(async move {
            match installer.missing_prerequisites(&cancel).await {
                Ok(missing) if missing.is_empty() => {}
                Ok(missing) => {
                    let missing = missing.join(", ");
                    tracing::error!(%missing, "Deploy aborted");
                    logs.system(format!("Deploy aborted, missing: {missing}"));
                    return;
                }
                Err(_) => return,
            }

            let mut installed = 0usize;
            let mut failed = 0usize;
            for name in names {
                if cancel.is_cancelled() {
                    break;
                }
                match install_one(&supervisor, &installer, &name, &cancel).await {
                    Ok(true) => installed += 1,
                    Ok(false) => {}
                    Err(CoreError::Cancelled) => break,
                    // Already logged by the installer; other workers carry on.
                    Err(_) => failed += 1,
                }
            }
            for capability in Capability::ALL {
                let dir = layout.shared_output_dir(capability);
                if let Err(e) = std::fs::create_dir_all(&dir) {
                    tracing::warn!(path = %dir.display(), error = %e, "Failed to create output folder");
                }
            }
            logs.system(format!(
                "Deploy finished: {installed} installed, {failed} failed"
            ));
            tracing::info!(installed, failed, "Deploy finished");
        });
        true
    }

    /// Install one worker in the foreground.
    ///
    /// Returns `Ok(false)` if an install for it is already in flight.
    pub async fn install(&self, name: &str) -> Result<bool, CoreError> {
        install_one(&self.supervisor, &self.installer, name, &self.cancel).await
    }

    /// Make sure `name` is running and answering, then report its state.
    pub async fn start(&self, name: &str) -> Result<WorkerState, CoreError> {
        let worker = self.supervisor.catalog().require(name)?.clone();
        self.prober.ensure_running(name, &self.cancel).await?;
        Ok(self.supervisor.worker_state(&worker))
    }

    pub async fn stop(&self, name: &str) -> Result<(), CoreError> {
        self.supervisor.stop(name).await
    }

    /// Stop every running worker. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        self.supervisor.stop_all().await
    }

    /// Checkpoint files available to the image worker, sorted by name.
    pub fn list_models(&self) -> Vec<String> {
        let Some(worker) = self.supervisor.catalog().for_capability(Capability::Image) else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(self.layout.checkpoints_dir(&worker.name)) else {
            return Vec::new();
        };

        let mut models: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().is_file())
            .filter(|e| {
                e.path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| CHECKPOINT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        models.sort();
        models
    }

    /// Cancel background work, wait up to `timeout` for it to unwind, then
    /// stop every worker.
    pub async fn shutdown(&self, timeout: Duration) {
        tracing::info!("Fleet shutting down");
        self.logs.system("Shutting down");
        self.cancel.cancel();
        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            tracing::warn!("Background tasks did not finish before the shutdown timeout");
        }
        let stopped = self.supervisor.stop_all().await;
        tracing::info!(stopped, "Fleet shut down");
    }

    pub fn catalog(&self) -> &Arc<WorkerCatalog> {
        self.supervisor.catalog()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn log_sink(&self) -> &Arc<LogSink> {
        &self.logs
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn prober(&self) -> &Arc<ReadinessProber> {
        &self.prober
    }

    /// Token cancelled at shutdown; jobs and polls observe it.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for every background install spawned so far to finish.
    pub async fn wait_background(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

async fn install_one<R: CommandRunner>(
    supervisor: &Supervisor,
    installer: &Installer<R>,
    name: &str,
    cancel: &CancellationToken,
) -> Result<bool, CoreError> {
    let worker = supervisor.catalog().require(name)?;
    let registry = supervisor.registry();
    if registry.lookup(name).is_some() {
        return Err(CoreError::AlreadyRunning(name.to_string()));
    }
    let Some(guard) = registry.begin_install(name) else {
        tracing::debug!(worker = %name, "Install already in progress");
        return Ok(false);
    };
    installer.install(worker, guard, cancel).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_models_filters_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = Fleet::new(FleetConfig::new(dir.path()));
        assert!(fleet.list_models().is_empty());

        let checkpoints = fleet.layout().checkpoints_dir("comfyui");
        std::fs::create_dir_all(checkpoints.join("nested.safetensors")).unwrap();
        for file in ["sdxl.safetensors", "v1-5.ckpt", "README.md", "put_checkpoints_here"] {
            std::fs::write(checkpoints.join(file), b"").unwrap();
        }
        assert_eq!(fleet.list_models(), vec!["sdxl.safetensors", "v1-5.ckpt"]);
    }

    #[tokio::test]
    async fn status_lists_catalog_workers_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = Fleet::new(FleetConfig::new(dir.path()));
        let status = fleet.status().await;

        let names: Vec<_> = status.workers.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["comfyui", "hunyuan3d", "unirig", "momask", "kokoro", "audiocraft"]
        );
        assert!(status
            .workers
            .iter()
            .all(|w| w.status == kiln_core::status::WorkerStatus::Idle));
        assert!(status.system.cpu_count >= 1);
        assert!(status.system.gpu.is_none());
    }

    #[tokio::test]
    async fn deploy_is_refused_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = Fleet::new(FleetConfig::new(dir.path()));
        fleet.shutdown(Duration::from_secs(1)).await;
        assert!(!fleet.deploy());
    }

    #[test]
    fn logs_are_mirrored_under_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = Fleet::new(FleetConfig::new(dir.path()));
        fleet.log_sink().system("hello");
        let contents = std::fs::read_to_string(fleet.layout().log_file()).unwrap();
        assert!(contents.contains("[system] hello"));
        assert_eq!(fleet.logs(Some("comfyui")).len(), 1);
    }
}
