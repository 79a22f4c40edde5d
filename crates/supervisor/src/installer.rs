//! Resumable per-worker install pipeline.
//!
//! Steps run strictly in [`InstallStep::ALL`] order. Before each step the
//! pipeline checks the step's on-disk artifact and skips the work if it is
//! already there, so re-running an interrupted install picks up where it
//! stopped. A failing step ends the install; whatever is on disk stays and
//! shows up as `failed` in the worker's status.

use std::sync::Arc;

use kiln_core::catalog::WorkerDescriptor;
use kiln_core::error::CoreError;
use kiln_core::install::InstallStep;
use kiln_core::layout::Layout;
use kiln_events::{LogSink, SYSTEM_TAG};
use tokio_util::sync::CancellationToken;

use crate::registry::InstallGuard;
use crate::runner::{CommandRunner, CommandSpec, ProcessRunner, RunError};

/// Packaging tools refreshed before any dependency is installed.
const PACKAGING_TOOLS: &[&str] = &["pip", "setuptools", "wheel"];

pub struct Installer<R = ProcessRunner> {
    runner: R,
    layout: Layout,
    logs: Arc<LogSink>,
    /// Interpreter used to create isolated environments.
    python: String,
}

impl<R: CommandRunner> Installer<R> {
    pub fn new(runner: R, layout: Layout, logs: Arc<LogSink>, python: impl Into<String>) -> Self {
        Self {
            runner,
            layout,
            logs,
            python: python.into(),
        }
    }

    /// Tools every install needs on the host, as reported by
    /// `<tool> --version`. Returns the ones that could not be run.
    pub async fn missing_prerequisites(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, CoreError> {
        let mut missing = Vec::new();
        for program in ["git", self.python.as_str()] {
            let spec = CommandSpec::new(program).arg("--version");
            match self.runner.run(SYSTEM_TAG, &spec, cancel).await {
                Ok(()) => {}
                Err(RunError::Cancelled) => return Err(CoreError::Cancelled),
                Err(e) => {
                    tracing::warn!(program, error = %e, "Prerequisite check failed");
                    missing.push(program.to_string());
                }
            }
        }
        Ok(missing)
    }

    /// Install `worker`, holding its installing marker for the whole run.
    ///
    /// The guard is consumed and dropped on return, which clears the marker
    /// on success, failure and cancellation alike.
    pub async fn install(
        &self,
        worker: &WorkerDescriptor,
        guard: InstallGuard,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        debug_assert_eq!(guard.worker(), worker.name);
        let name = worker.name.as_str();

        tracing::info!(worker = %name, "Install started");
        self.logs.append(name, "Install started");

        for step in InstallStep::ALL {
            if cancel.is_cancelled() {
                self.logs.append(name, "Install cancelled");
                return Err(CoreError::Cancelled);
            }

            if step.is_satisfied(&self.layout, name) {
                self.logs
                    .append(name, format!("Skipping {step}: already done"));
                continue;
            }

            self.logs.append(name, format!("Running {step}"));
            if let Err(err) = self.run_step(worker, step, cancel).await {
                tracing::error!(worker = %name, %step, error = %err, "Install step failed");
                self.logs.append(name, format!("Install failed: {err}"));
                return Err(err);
            }
            tracing::info!(worker = %name, %step, "Install step complete");
        }

        self.logs.append(name, "Install complete");
        tracing::info!(worker = %name, "Install complete");
        drop(guard);
        Ok(())
    }

    async fn run_step(
        &self,
        worker: &WorkerDescriptor,
        step: InstallStep,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let name = worker.name.as_str();
        let fail = |reason: String| CoreError::InstallStepFailure {
            worker: name.to_string(),
            step,
            reason,
        };

        if step == InstallStep::Clone {
            self.prepare_clone_target(name)
                .map_err(|e| fail(e.to_string()))?;
        }

        for spec in self.commands_for(worker, step) {
            self.logs.append(name, format!("$ {spec}"));
            match self.runner.run(name, &spec, cancel).await {
                Ok(()) => {}
                Err(RunError::Cancelled) => return Err(CoreError::Cancelled),
                Err(e) => return Err(fail(e.to_string())),
            }
        }

        if !matches!(step, InstallStep::Clone | InstallStep::CreateEnv) {
            self.write_stamp(name, step)
                .map_err(|e| fail(format!("failed to record step: {e}")))?;
        }
        Ok(())
    }

    /// External commands making up `step` for `worker`, in order.
    ///
    /// Package steps with nothing to install produce no commands.
    pub fn commands_for(&self, worker: &WorkerDescriptor, step: InstallStep) -> Vec<CommandSpec> {
        let name = worker.name.as_str();
        let root = self.layout.install_root(name);
        let pip = || {
            CommandSpec::new(self.layout.env_python(name))
                .args(["-m", "pip", "install"])
                .current_dir(&root)
        };

        match step {
            InstallStep::Clone => vec![CommandSpec::new("git")
                .args(["clone", "--depth", "1"])
                .arg(&worker.repository_url)
                .arg(self.layout.repo_dir(name))
                .current_dir(&root)],
            InstallStep::CreateEnv => vec![CommandSpec::new(&self.python)
                .args(["-m", "venv"])
                .arg(self.layout.env_dir(name))
                .current_dir(&root)],
            InstallStep::UpgradeTools => {
                vec![pip().arg("--upgrade").args(PACKAGING_TOOLS.iter().copied())]
            }
            InstallStep::HeavyDeps => {
                if worker.install.heavy_packages.is_empty() {
                    return Vec::new();
                }
                let mut spec = pip().args(&worker.install.heavy_packages);
                if let Some(index) = &worker.install.heavy_index_url {
                    spec = spec.arg("--index-url").arg(index);
                }
                vec![spec]
            }
            InstallStep::Requirements => worker
                .install
                .requirement_files
                .iter()
                .filter_map(|file| {
                    let path = self.layout.repo_dir(name).join(file);
                    if path.is_file() {
                        Some(pip().arg("-r").arg(path))
                    } else {
                        self.logs
                            .append(name, format!("Requirements file {file} not found, skipping"));
                        None
                    }
                })
                .collect(),
            InstallStep::Extras => {
                if worker.install.extra_packages.is_empty() {
                    return Vec::new();
                }
                vec![pip().args(&worker.install.extra_packages)]
            }
        }
    }

    /// Ensure the install root exists and clear a leftover partial clone,
    /// which `git clone` would refuse to overwrite.
    fn prepare_clone_target(&self, worker: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(self.layout.install_root(worker))?;
        let repo = self.layout.repo_dir(worker);
        if repo.exists() {
            self.logs
                .append(worker, "Removing incomplete clone before retrying");
            std::fs::remove_dir_all(&repo)?;
        }
        Ok(())
    }

    fn write_stamp(&self, worker: &str, step: InstallStep) -> std::io::Result<()> {
        let stamp = self.layout.stamp_file(worker, step);
        if let Some(parent) = stamp.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&stamp, chrono::Utc::now().to_rfc3339())
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
