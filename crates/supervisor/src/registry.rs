//! Process registry and installing set.
//!
//! The registry is the single source of truth for "is this worker a live
//! OS process". One mutex guards both the process map and the installing
//! set so that status reads, registration and install admission are
//! atomic with respect to each other.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use kiln_core::error::CoreError;
use tokio_util::sync::CancellationToken;

/// Registry-side view of one running worker process.
///
/// The child process itself (and its output pipes) is owned by the exit
/// waiter and the line forwarders spawned at launch. The handle carries
/// the process identity plus the two signals used to talk to the waiter.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    /// Distinguishes successive launches of the same worker name.
    pub instance: u64,
    pub started_at: DateTime<Utc>,
    kill: CancellationToken,
    exited: CancellationToken,
}

impl ProcessHandle {
    pub fn new(pid: u32, instance: u64) -> Self {
        Self {
            pid,
            instance,
            started_at: Utc::now(),
            kill: CancellationToken::new(),
            exited: CancellationToken::new(),
        }
    }

    /// Ask the exit waiter to terminate the process.
    pub fn request_kill(&self) {
        self.kill.cancel();
    }

    /// Resolves once [`request_kill`](Self::request_kill) has been called.
    pub async fn kill_requested(&self) {
        self.kill.cancelled().await;
    }

    /// Called by the exit waiter once the process has been reaped.
    pub fn mark_exited(&self) {
        self.exited.cancel();
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    pub async fn wait_exited(&self) {
        self.exited.cancelled().await;
    }
}

#[derive(Default)]
struct RegistryInner {
    processes: HashMap<String, ProcessHandle>,
    installing: HashSet<String>,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
    next_instance: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `handle` for `name`; fails if an entry already exists.
    pub fn register(&self, name: &str, handle: ProcessHandle) -> Result<(), CoreError> {
        let mut inner = self.lock();
        if inner.processes.contains_key(name) {
            return Err(CoreError::AlreadyRunning(name.to_string()));
        }
        inner.processes.insert(name.to_string(), handle);
        Ok(())
    }

    /// Check admission, launch and register in one critical section.
    ///
    /// `launch` receives a fresh instance number and must spawn the process
    /// synchronously. It is only called when `name` is neither registered
    /// nor installing, so two concurrent starts cannot both launch.
    pub fn register_with<F>(&self, name: &str, launch: F) -> Result<ProcessHandle, CoreError>
    where
        F: FnOnce(u64) -> Result<ProcessHandle, CoreError>,
    {
        let mut inner = self.lock();
        if inner.processes.contains_key(name) {
            return Err(CoreError::AlreadyRunning(name.to_string()));
        }
        if inner.installing.contains(name) {
            return Err(CoreError::NotInstalled {
                worker: name.to_string(),
                reason: "install in progress".to_string(),
            });
        }
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = launch(instance)?;
        inner.processes.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn lookup(&self, name: &str) -> Option<ProcessHandle> {
        self.lock().processes.get(name).cloned()
    }

    /// Remove the entry for `name`. Idempotent.
    pub fn remove(&self, name: &str) -> Option<ProcessHandle> {
        self.lock().processes.remove(name)
    }

    /// Remove the entry for `name` only if it still belongs to `instance`.
    ///
    /// Used by exit waiters so a late exit of an old process never removes
    /// the entry of a newer launch.
    pub fn remove_instance(&self, name: &str, instance: u64) -> bool {
        let mut inner = self.lock();
        match inner.processes.get(name) {
            Some(handle) if handle.instance == instance => {
                inner.processes.remove(name);
                true
            }
            _ => false,
        }
    }

    /// All registered workers, sorted by name.
    pub fn running(&self) -> Vec<(String, ProcessHandle)> {
        let mut entries: Vec<_> = self
            .lock()
            .processes
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Registry-side status facts read under one lock: the live handle (if
    /// registered) and installing-set membership.
    pub fn facts(&self, name: &str) -> (Option<ProcessHandle>, bool) {
        let inner = self.lock();
        (
            inner.processes.get(name).cloned(),
            inner.installing.contains(name),
        )
    }

    /// Mark `name` as installing. Returns `None` if an install is already in
    /// flight or the worker is running.
    ///
    /// The marker is cleared when the returned guard is dropped, on every
    /// exit path of the install.
    pub fn begin_install(self: &Arc<Self>, name: &str) -> Option<InstallGuard> {
        let mut inner = self.lock();
        if inner.processes.contains_key(name) || !inner.installing.insert(name.to_string()) {
            return None;
        }
        Some(InstallGuard {
            registry: Arc::clone(self),
            worker: name.to_string(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Membership of one worker in the installing set.
#[derive(Debug)]
pub struct InstallGuard {
    registry: Arc<Registry>,
    worker: String,
}

impl InstallGuard {
    pub fn worker(&self) -> &str {
        &self.worker
    }
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        self.registry.lock().installing.remove(&self.worker);
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Registry")
            .field("processes", &inner.processes.keys().collect::<Vec<_>>())
            .field("installing", &inner.installing)
            .finish()
    }
}
