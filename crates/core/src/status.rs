//! Worker runtime status.
//!
//! Status is never stored. It is derived from three facts: registry
//! membership, installing-set membership and filesystem probes, resolved
//! with the precedence `running > installing > ready > failed > idle`.

use std::fmt;

use serde::Serialize;

use crate::layout::Layout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Installing,
    Ready,
    Failed,
    Running,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Installing => "installing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Running => "running",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The raw inputs status is computed from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerFacts {
    pub registered: bool,
    pub installing: bool,
    pub env_present: bool,
    pub root_present: bool,
}

impl WorkerFacts {
    /// Fill in the filesystem facts for `worker`; the caller supplies the
    /// registry-side facts.
    pub fn probe(layout: &Layout, worker: &str, registered: bool, installing: bool) -> Self {
        Self {
            registered,
            installing,
            env_present: layout.has_env(worker),
            root_present: layout.has_install_root(worker),
        }
    }

    pub fn resolve(self) -> WorkerStatus {
        if self.registered {
            WorkerStatus::Running
        } else if self.installing {
            WorkerStatus::Installing
        } else if self.env_present {
            WorkerStatus::Ready
        } else if self.root_present {
            WorkerStatus::Failed
        } else {
            WorkerStatus::Idle
        }
    }
}
