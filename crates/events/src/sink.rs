//! Bounded, file-mirrored log ring backed by a `broadcast` feed.
//!
//! All access goes through one mutex guarding both the ring and the file
//! handle, so a [`LogSink::read`] snapshot always matches some valid
//! interleaving of concurrent appends. Appends never fail observably:
//! durable-write errors are swallowed after a diagnostic trace.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Reserved worker tag for fleet-wide messages. System entries are included
/// in every filtered view.
pub const SYSTEM_TAG: &str = "system";

/// Number of entries retained in memory.
pub const DEFAULT_CAPACITY: usize = 500;

/// Buffer capacity of the live feed channel.
const FEED_CAPACITY: usize = 1024;

/// One timestamped, worker-tagged log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub worker: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogEntry {
    /// Line format used in the durable log file.
    pub fn to_line(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.timestamp.to_rfc3339(),
            self.worker,
            self.message
        )
    }

    /// Whether the entry belongs in a view filtered to `filter`.
    pub fn matches(&self, filter: &str) -> bool {
        self.worker == filter || self.worker == SYSTEM_TAG
    }
}

struct SinkInner {
    entries: VecDeque<LogEntry>,
    file: Option<File>,
}

pub struct LogSink {
    inner: Mutex<SinkInner>,
    capacity: usize,
    feed: broadcast::Sender<LogEntry>,
}

impl LogSink {
    /// An in-memory sink with no durable mirror.
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    /// A sink that also appends every entry to `path`.
    ///
    /// If the file cannot be opened the sink still works in memory; the
    /// failure is traced once here.
    pub fn with_file(path: &Path, capacity: usize) -> Self {
        let file = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| OpenOptions::new().create(true).append(true).open(path));

        match file {
            Ok(file) => Self::build(capacity, Some(file)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Log file unavailable, keeping logs in memory only",
                );
                Self::build(capacity, None)
            }
        }
    }

    fn build(capacity: usize, file: Option<File>) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Mutex::new(SinkInner {
                entries: VecDeque::with_capacity(capacity),
                file,
            }),
            capacity,
            feed,
        }
    }

    /// Record a line for `worker`, evicting the oldest entry when full.
    pub fn append(&self, worker: &str, message: impl Into<String>) {
        let entry = LogEntry {
            worker: worker.to_string(),
            timestamp: Utc::now(),
            message: message.into(),
        };
        tracing::debug!(worker = %entry.worker, "{}", entry.message);

        let mut inner = self.lock();
        if let Some(file) = inner.file.as_mut() {
            let _ = writeln!(file, "{}", entry.to_line());
        }
        while inner.entries.len() >= self.capacity {
            inner.entries.pop_front();
        }
        if self.capacity > 0 {
            inner.entries.push_back(entry.clone());
        }
        // Sent under the lock so feed order matches ring order.
        let _ = self.feed.send(entry);
    }

    /// Record a fleet-wide message under [`SYSTEM_TAG`].
    pub fn system(&self, message: impl Into<String>) {
        self.append(SYSTEM_TAG, message);
    }

    /// Snapshot of retained entries in insertion order.
    ///
    /// With no filter (or an empty one) every entry is returned; otherwise
    /// entries tagged with `filter` or with [`SYSTEM_TAG`].
    pub fn read(&self, filter: Option<&str>) -> Vec<LogEntry> {
        let inner = self.lock();
        match filter.filter(|f| !f.is_empty()) {
            None => inner.entries.iter().cloned().collect(),
            Some(worker) => inner
                .entries
                .iter()
                .filter(|e| e.matches(worker))
                .cloned()
                .collect(),
        }
    }

    /// Receive every entry appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.feed.subscribe()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, SinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
