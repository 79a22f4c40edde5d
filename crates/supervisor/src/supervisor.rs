//! Worker process start/stop and status.
//!
//! A started worker is owned by an exit-waiter task: it holds the child
//! process, waits for it to exit or for a kill request, and removes the
//! registry entry once the process is gone. [`Supervisor::stop`] only
//! signals the waiter, so the registry entry disappears whichever way the
//! process ends.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_core::capability::Capability;
use kiln_core::catalog::{Interpreter, WorkerCatalog, WorkerDescriptor};
use kiln_core::error::CoreError;
use kiln_core::install::InstallStep;
use kiln_core::layout::Layout;
use kiln_core::status::{WorkerFacts, WorkerStatus};
use kiln_events::LogSink;
use serde::Serialize;
use tokio::process::{Child, Command};

use crate::registry::{ProcessHandle, Registry};
use crate::runner::{forward_output, hide_console, terminate};

/// How long [`Supervisor::stop`] waits for the exit waiter to reap the
/// process before giving up on it.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Point-in-time view of one worker, as reported by fleet status.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerState {
    pub name: String,
    pub capability: Capability,
    pub status: WorkerStatus,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Step the install will run next; only set while installing or failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_step: Option<InstallStep>,
}

pub struct Supervisor {
    catalog: Arc<WorkerCatalog>,
    layout: Layout,
    registry: Arc<Registry>,
    logs: Arc<LogSink>,
    stop_grace: Duration,
}

impl Supervisor {
    pub fn new(
        catalog: Arc<WorkerCatalog>,
        layout: Layout,
        registry: Arc<Registry>,
        logs: Arc<LogSink>,
    ) -> Self {
        Self {
            catalog,
            layout,
            registry,
            logs,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Launch `name` and register it. Returns the new process id.
    ///
    /// Must be called from within a Tokio runtime; the exit waiter and the
    /// output forwarders are spawned onto it.
    pub fn start(&self, name: &str) -> Result<u32, CoreError> {
        let worker = self.catalog.require(name)?;
        if !self.layout.has_env(name) {
            return Err(CoreError::NotInstalled {
                worker: name.to_string(),
                reason: "environment missing".to_string(),
            });
        }

        let handle = self.registry.register_with(name, |instance| {
            let mut child = self.spawn_process(worker)?;
            let pid = child.id().ok_or_else(|| CoreError::NotInstalled {
                worker: name.to_string(),
                reason: "process exited immediately".to_string(),
            })?;
            forward_output(&mut child, &self.logs, name);

            let handle = ProcessHandle::new(pid, instance);
            self.spawn_exit_waiter(name, child, handle.clone());
            Ok(handle)
        })?;

        tracing::info!(worker = %name, pid = handle.pid, port = worker.port, "Worker started");
        self.logs
            .append(name, format!("Started (pid {}, port {})", handle.pid, worker.port));
        Ok(handle.pid)
    }

    fn spawn_process(&self, worker: &WorkerDescriptor) -> Result<Child, CoreError> {
        let name = worker.name.as_str();
        let mut cmd = match &worker.launch.interpreter {
            Interpreter::Environment => Command::new(self.layout.env_python(name)),
            Interpreter::System(program) => Command::new(program),
        };
        cmd.args(&worker.launch.args)
            .current_dir(self.layout.install_root(name))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        hide_console(&mut cmd);

        cmd.spawn().map_err(|e| {
            tracing::error!(worker = %name, error = %e, "Failed to spawn worker");
            CoreError::NotInstalled {
                worker: name.to_string(),
                reason: format!("failed to launch: {e}"),
            }
        })
    }

    fn spawn_exit_waiter(&self, name: &str, mut child: Child, handle: ProcessHandle) {
        let name = name.to_string();
        let registry = Arc::clone(&self.registry);
        let logs = Arc::clone(&self.logs);

        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => Some(status),
                () = handle.kill_requested() => None,
            };

            let message = match outcome {
                Some(Ok(status)) => match status.code() {
                    Some(code) => format!("Exited with code {code}"),
                    None => "Exited (terminated by signal)".to_string(),
                },
                Some(Err(e)) => format!("Lost track of process: {e}"),
                None => {
                    terminate(&mut child).await;
                    "Stopped".to_string()
                }
            };

            tracing::info!(worker = %name, pid = handle.pid, "{message}");
            logs.append(&name, message);
            registry.remove_instance(&name, handle.instance);
            handle.mark_exited();
        });
    }

    /// Stop a running worker and wait (bounded) for it to be reaped.
    pub async fn stop(&self, name: &str) -> Result<(), CoreError> {
        self.catalog.require(name)?;
        let handle = self
            .registry
            .lookup(name)
            .ok_or_else(|| CoreError::NotRunning(name.to_string()))?;

        self.logs.append(name, "Stopping");
        handle.request_kill();

        if tokio::time::timeout(self.stop_grace, handle.wait_exited())
            .await
            .is_err()
        {
            tracing::warn!(worker = %name, pid = handle.pid, "Worker did not exit within grace period");
            self.logs
                .append(name, "Process did not exit in time; dropping it from the registry");
        }
        // The waiter normally removes the entry; this covers the timeout.
        self.registry.remove_instance(name, handle.instance);
        Ok(())
    }

    /// Stop every registered worker concurrently. Never fails.
    pub async fn stop_all(&self) -> usize {
        let running = self.registry.running();
        let count = running.len();
        if count == 0 {
            return 0;
        }

        self.logs.system(format!("Stopping {count} worker(s)"));
        let stops = running.iter().map(|(name, _)| async move {
            if let Err(e) = self.stop(name).await {
                // Raced with a natural exit.
                tracing::debug!(worker = %name, error = %e, "Stop skipped");
            }
        });
        futures::future::join_all(stops).await;
        count
    }

    /// Current status of `name`.
    pub fn status(&self, name: &str) -> Result<WorkerStatus, CoreError> {
        let worker = self.catalog.require(name)?;
        Ok(self.worker_state(worker).status)
    }

    pub fn worker_state(&self, worker: &WorkerDescriptor) -> WorkerState {
        let name = worker.name.as_str();
        let (handle, installing) = self.registry.facts(name);
        let status = WorkerFacts::probe(&self.layout, name, handle.is_some(), installing).resolve();

        WorkerState {
            name: worker.name.clone(),
            capability: worker.capability,
            status,
            port: worker.port,
            pid: handle.as_ref().map(|h| h.pid),
            started_at: handle.as_ref().map(|h| h.started_at),
            install_step: if matches!(status, WorkerStatus::Installing | WorkerStatus::Failed) {
                InstallStep::resume_point(&self.layout, name)
            } else {
                None
            },
        }
    }

    /// Status of every catalog worker, in catalog order.
    pub fn states(&self) -> Vec<WorkerState> {
        self.catalog.iter().map(|w| self.worker_state(w)).collect()
    }

    pub fn catalog(&self) -> &Arc<WorkerCatalog> {
        &self.catalog
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn logs(&self) -> &Arc<LogSink> {
        &self.logs
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
