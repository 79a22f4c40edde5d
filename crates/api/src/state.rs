use std::sync::Arc;

use kiln_supervisor::Fleet;
use kiln_workers::JobOrchestrator;

use crate::config::ServerConfig;

/// Shared application state available to all handlers via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Installs, starts, stops and reports on workers.
    pub fleet: Arc<Fleet>,
    /// Runs generation jobs against the fleet's workers.
    pub orchestrator: Arc<JobOrchestrator>,
}
