//! Job submission to generation workers.
//!
//! Builds capability payloads, talks to workers over HTTP with typed
//! response schemas, drives each job to completion and delivers the
//! resulting artifact.

pub mod api;
pub mod artifact;
pub mod orchestrator;
pub mod request;
pub mod schemas;
pub mod workflow;

pub use api::{WorkerApi, WorkerApiError};
pub use orchestrator::{JobConfig, JobOrchestrator, JobOutcome};
pub use request::{GenerationJob, GenerationRequest};
