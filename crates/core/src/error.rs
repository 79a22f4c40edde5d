use crate::install::InstallStep;

/// Every failure the fleet can report to a caller.
///
/// Registry and supervisor errors are precondition checks returned to the
/// immediate caller. Orchestration errors are terminal for one job and are
/// never retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Worker '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Worker '{0}' is not running")]
    NotRunning(String),

    #[error("Worker '{worker}' is not installed: {reason}")]
    NotInstalled { worker: String, reason: String },

    #[error("Worker '{worker}' did not answer after {attempts} attempts")]
    StartupTimeout { worker: String, attempts: u32 },

    #[error("Job {job_id} on '{worker}' did not complete after {attempts} polls")]
    GenerationTimeout {
        worker: String,
        job_id: String,
        attempts: u32,
    },

    #[error("Job {job_id} on '{worker}' failed: {reason}")]
    GenerationFailed {
        worker: String,
        job_id: String,
        reason: String,
    },

    #[error("Invalid response from '{worker}': {reason}")]
    InvalidWorkerResponse { worker: String, reason: String },

    #[error("Failed to read artifact {path}: {reason}")]
    ArtifactReadFailure { path: String, reason: String },

    #[error("Install of '{worker}' failed at step {step}: {reason}")]
    InstallStepFailure {
        worker: String,
        step: InstallStep,
        reason: String,
    },

    #[error("Worker '{worker}' is unreachable: {reason}")]
    WorkerUnreachable { worker: String, reason: String },

    #[error("Worker '{0}' has no model checkpoints installed")]
    NoCheckpoint(String),

    #[error("Unknown worker '{0}'")]
    UnknownWorker(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// Stable machine-readable code, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::NotInstalled { .. } => "NOT_INSTALLED",
            Self::StartupTimeout { .. } => "STARTUP_TIMEOUT",
            Self::GenerationTimeout { .. } => "GENERATION_TIMEOUT",
            Self::GenerationFailed { .. } => "GENERATION_FAILED",
            Self::InvalidWorkerResponse { .. } => "INVALID_WORKER_RESPONSE",
            Self::ArtifactReadFailure { .. } => "ARTIFACT_READ_FAILURE",
            Self::InstallStepFailure { .. } => "INSTALL_STEP_FAILURE",
            Self::WorkerUnreachable { .. } => "WORKER_UNREACHABLE",
            Self::NoCheckpoint(_) => "NO_CHECKPOINT",
            Self::UnknownWorker(_) => "UNKNOWN_WORKER",
            Self::Cancelled => "CANCELLED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_worker_and_step() {
        let err = CoreError::InstallStepFailure {
            worker: "comfyui".to_string(),
            step: InstallStep::Clone,
            reason: "exit code 128".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Install of 'comfyui' failed at step clone: exit code 128"
        );
    }

    #[test]
    fn codes_are_distinct() {
        let errors = [
            CoreError::AlreadyRunning("a".into()),
            CoreError::NotRunning("a".into()),
            CoreError::NotInstalled {
                worker: "a".into(),
                reason: "b".into(),
            },
            CoreError::StartupTimeout {
                worker: "a".into(),
                attempts: 1,
            },
            CoreError::GenerationTimeout {
                worker: "a".into(),
                job_id: "j".into(),
                attempts: 1,
            },
            CoreError::NoCheckpoint("a".into()),
            CoreError::UnknownWorker("a".into()),
            CoreError::Cancelled,
        ];
        let mut codes: Vec<_> = errors.iter().map(CoreError::code).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
