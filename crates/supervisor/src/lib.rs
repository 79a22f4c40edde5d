//! Worker process supervision for the kiln fleet.
//!
//! Owns the live side of every worker: the process registry, the install
//! pipeline, starting and stopping worker processes, readiness probing,
//! and the [`Fleet`](fleet::Fleet) facade that ties them together for
//! callers.

pub mod fleet;
pub mod installer;
pub mod prober;
pub mod registry;
pub mod runner;
pub mod supervisor;
pub mod system;

pub use fleet::{Fleet, FleetConfig, FleetStatus};
pub use prober::{ProbeConfig, ReadinessProber};
pub use registry::{InstallGuard, ProcessHandle, Registry};
pub use supervisor::{Supervisor, WorkerState};
pub use installer::Installer;
pub use runner::{CommandRunner, CommandSpec, ProcessRunner, RunError};
pub use system::SystemStats;
