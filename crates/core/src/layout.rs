//! On-disk layout of a kiln root directory.
//!
//! ```text
//! <root>/kiln.log                     durable log mirror
//! <root>/outputs/<capability>/        shared output folders
//! <root>/<worker>/repo/               cloned repository
//! <root>/<worker>/venv/               isolated environment (the "ready" marker)
//! <root>/<worker>/venv/.kiln/<step>   install step stamps
//! ```

use std::path::{Path, PathBuf};

use crate::capability::Capability;
use crate::catalog::{OutputDir, WorkerDescriptor};
use crate::install::InstallStep;

const LOG_FILE_NAME: &str = "kiln.log";
const OUTPUTS_DIR: &str = "outputs";
const REPO_DIR: &str = "repo";
const ENV_DIR: &str = "venv";
const STAMP_DIR: &str = ".kiln";

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join(LOG_FILE_NAME)
    }

    /// The worker's install root; also its working directory when launched.
    pub fn install_root(&self, worker: &str) -> PathBuf {
        self.root.join(worker)
    }

    pub fn repo_dir(&self, worker: &str) -> PathBuf {
        self.install_root(worker).join(REPO_DIR)
    }

    pub fn env_dir(&self, worker: &str) -> PathBuf {
        self.install_root(worker).join(ENV_DIR)
    }

    /// Python interpreter inside the worker's isolated environment.
    pub fn env_python(&self, worker: &str) -> PathBuf {
        let env = self.env_dir(worker);
        if cfg!(windows) {
            env.join("Scripts").join("python.exe")
        } else {
            env.join("bin").join("python")
        }
    }

    pub fn stamp_file(&self, worker: &str, step: InstallStep) -> PathBuf {
        self.env_dir(worker).join(STAMP_DIR).join(step.as_str())
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join(OUTPUTS_DIR)
    }

    pub fn shared_output_dir(&self, capability: Capability) -> PathBuf {
        self.outputs_dir().join(capability.as_str())
    }

    /// Absolute paths are kept; relative ones are taken from the outputs
    /// directory.
    pub fn resolve_output_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.outputs_dir().join(path)
        }
    }

    /// Directory the worker writes artifacts into.
    pub fn worker_output_dir(&self, worker: &WorkerDescriptor) -> PathBuf {
        match &worker.output_dir {
            OutputDir::Repository(sub) => self.repo_dir(&worker.name).join(sub),
            OutputDir::Shared => self.shared_output_dir(worker.capability),
        }
    }

    /// Model checkpoints directory of a ComfyUI-style repository.
    pub fn checkpoints_dir(&self, worker: &str) -> PathBuf {
        self.repo_dir(worker).join("models").join("checkpoints")
    }

    // ---- filesystem probes ----

    pub fn has_install_root(&self, worker: &str) -> bool {
        self.install_root(worker).is_dir()
    }

    pub fn has_clone(&self, worker: &str) -> bool {
        self.repo_dir(worker).join(".git").exists()
    }

    pub fn has_env(&self, worker: &str) -> bool {
        self.env_dir(worker).is_dir()
    }

    pub fn has_stamp(&self, worker: &str, step: InstallStep) -> bool {
        self.stamp_file(worker, step).is_file()
    }
}
