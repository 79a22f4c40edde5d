//! HTTP readiness probing.
//!
//! A worker counts as ready once its port answers an HTTP request with any
//! response at all, whatever the status code.
//! [`ReadinessProber::ensure_running`] is the one entry point generation goes
//! through: it starts the worker if needed and waits for it to come up.

use std::sync::Arc;
use std::time::Duration;

use kiln_core::error::CoreError;
use kiln_core::status::WorkerStatus;
use kiln_events::LogSink;
use tokio_util::sync::CancellationToken;

use crate::supervisor::Supervisor;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Delay between polls while waiting for a worker to boot.
    pub interval: Duration,
    /// Polls before giving up with [`CoreError::StartupTimeout`].
    pub max_attempts: u32,
    /// Per-request timeout of a single probe.
    pub request_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 60,
            request_timeout: Duration::from_secs(2),
        }
    }
}

pub struct ReadinessProber {
    supervisor: Arc<Supervisor>,
    logs: Arc<LogSink>,
    http: reqwest::Client,
    config: ProbeConfig,
}

impl ReadinessProber {
    pub fn new(supervisor: Arc<Supervisor>, logs: Arc<LogSink>, config: ProbeConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            supervisor,
            logs,
            http,
            config,
        }
    }

    /// Whether something answers HTTP on `127.0.0.1:{port}`.
    pub async fn probe(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}/");
        self.http.get(&url).send().await.is_ok()
    }

    /// Make sure `name` is up and answering, starting it if it is
    /// installed but stopped.
    ///
    /// A port that already answers is taken as ready without consulting the
    /// registry, so a worker launched outside kiln is used as-is.
    pub async fn ensure_running(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let port = self.supervisor.catalog().require(name)?.port;
        if self.probe(port).await {
            return Ok(());
        }

        match self.supervisor.status(name)? {
            WorkerStatus::Running => {
                tracing::debug!(worker = %name, "Worker registered but not answering yet");
            }
            WorkerStatus::Ready => match self.supervisor.start(name) {
                // Lost a race with another caller starting it.
                Ok(_) | Err(CoreError::AlreadyRunning(_)) => {}
                Err(e) => return Err(e),
            },
            status => {
                return Err(CoreError::NotInstalled {
                    worker: name.to_string(),
                    reason: format!("worker is {status}"),
                });
            }
        }

        self.wait_until_ready(name, port, cancel).await
    }

    async fn wait_until_ready(
        &self,
        name: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        self.logs.append(name, format!("Waiting for port {port}"));

        for attempt in 1..=self.config.max_attempts {
            tokio::select! {
                () = cancel.cancelled() => return Err(CoreError::Cancelled),
                () = tokio::time::sleep(self.config.interval) => {}
            }

            if self.probe(port).await {
                tracing::info!(worker = %name, attempt, "Worker ready");
                self.logs.append(name, "Ready");
                return Ok(());
            }

            // A process that died while booting will never answer.
            if self.supervisor.registry().lookup(name).is_none() {
                tracing::warn!(worker = %name, attempt, "Worker exited before becoming ready");
                self.logs.append(name, "Exited before becoming ready");
                return Err(CoreError::StartupTimeout {
                    worker: name.to_string(),
                    attempts: attempt,
                });
            }
        }

        self.logs.append(
            name,
            format!("No answer after {} attempts", self.config.max_attempts),
        );
        Err(CoreError::StartupTimeout {
            worker: name.to_string(),
            attempts: self.config.max_attempts,
        })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }
}
