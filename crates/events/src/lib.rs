//! Worker log sink for the kiln fleet.
//!
//! [`LogSink`] is the single place where worker output, installer progress
//! and orchestration transitions are recorded for end users. It keeps a
//! bounded in-memory ring, mirrors every line to a durable log file and
//! fans new entries out to live subscribers.

pub mod sink;

pub use sink::{LogEntry, LogSink, DEFAULT_CAPACITY, SYSTEM_TAG};
