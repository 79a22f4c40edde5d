//! Worker descriptors and the fixed worker catalog.
//!
//! A [`WorkerDescriptor`] is everything kiln needs to install, launch and
//! talk to one worker. The set of descriptors is fixed at startup and never
//! mutated afterwards, so the catalog is shared behind an `Arc` without a
//! lock.

use serde::Serialize;

use crate::capability::Capability;
use crate::error::CoreError;

/// PyTorch wheel index used for the heavy runtime install step.
pub const TORCH_INDEX_URL: &str = "https://download.pytorch.org/whl/cu121";

/// What the installer puts into a worker's isolated environment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallSpec {
    /// Heavy runtime packages installed before anything else (e.g. torch).
    pub heavy_packages: Vec<String>,
    /// Optional wheel index for [`heavy_packages`](Self::heavy_packages).
    pub heavy_index_url: Option<String>,
    /// Requirement files, relative to the cloned repository.
    pub requirement_files: Vec<String>,
    /// Additional packages installed last.
    pub extra_packages: Vec<String>,
}

/// Which program runs the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpreter {
    /// The Python interpreter inside the worker's isolated environment.
    Environment,
    /// An arbitrary program resolved from `PATH` or an absolute path.
    System(String),
}

/// Per-worker launch convention. Arguments are passed verbatim and paths in
/// them are relative to the worker's install root (the working directory).
#[derive(Debug, Clone, Serialize)]
pub struct LaunchSpec {
    pub interpreter: Interpreter,
    pub args: Vec<String>,
}

/// How a submitted job reports completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Protocol {
    /// Submission returns a job id; completion is polled from a history
    /// endpoint keyed by that id.
    AsyncById,
    /// The submission response embeds the artifact reference directly.
    Sync { endpoint: String },
}

/// Where a worker writes its artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum OutputDir {
    /// A directory inside the cloned repository.
    Repository(String),
    /// The shared `<root>/outputs/<capability>` folder.
    Shared,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerDescriptor {
    pub name: String,
    pub capability: Capability,
    pub port: u16,
    pub repository_url: String,
    pub install: InstallSpec,
    pub launch: LaunchSpec,
    pub protocol: Protocol,
    pub output_dir: OutputDir,
}

impl WorkerDescriptor {
    /// `http://127.0.0.1:{port}`.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// The immutable set of workers managed by this process.
#[derive(Debug, Clone)]
pub struct WorkerCatalog {
    workers: Vec<WorkerDescriptor>,
}

impl WorkerCatalog {
    pub fn new(workers: Vec<WorkerDescriptor>) -> Self {
        Self { workers }
    }

    /// The six workers of a standard deployment, in install order.
    pub fn default_catalog() -> Self {
        Self::new(vec![
            comfyui(),
            sync_worker(
                "hunyuan3d",
                Capability::Mesh,
                8081,
                "https://github.com/Tencent/Hunyuan3D-2.git",
                "api_server.py",
                "/generate",
                &["torch", "torchvision", "torchaudio"],
                &["fastapi", "uvicorn"],
            ),
            sync_worker(
                "unirig",
                Capability::Rig,
                8082,
                "https://github.com/VAST-AI-Research/UniRig.git",
                "server.py",
                "/rig",
                &["torch", "torchvision"],
                &["fastapi", "uvicorn", "trimesh"],
            ),
            sync_worker(
                "momask",
                Capability::Motion,
                8083,
                "https://github.com/EricGuo5513/momask-codes.git",
                "server.py",
                "/generate",
                &["torch"],
                &["fastapi", "uvicorn"],
            ),
            sync_worker(
                "kokoro",
                Capability::Speech,
                8084,
                "https://github.com/hexgrad/kokoro.git",
                "server.py",
                "/tts",
                &["torch"],
                &["fastapi", "uvicorn", "soundfile"],
            ),
            sync_worker(
                "audiocraft",
                Capability::Audio,
                8085,
                "https://github.com/facebookresearch/audiocraft.git",
                "server.py",
                "/generate",
                &["torch==2.1.0", "torchaudio==2.1.0"],
                &["fastapi", "uvicorn"],
            ),
        ])
    }

    pub fn get(&self, name: &str) -> Option<&WorkerDescriptor> {
        self.workers.iter().find(|w| w.name == name)
    }

    /// Like [`get`](Self::get) but reports unknown names as [`CoreError::UnknownWorker`].
    pub fn require(&self, name: &str) -> Result<&WorkerDescriptor, CoreError> {
        self.get(name)
            .ok_or_else(|| CoreError::UnknownWorker(name.to_string()))
    }

    pub fn for_capability(&self, capability: Capability) -> Option<&WorkerDescriptor> {
        self.workers.iter().find(|w| w.capability == capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerDescriptor> {
        self.workers.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.name.clone()).collect()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn comfyui() -> WorkerDescriptor {
    let port = 8188;
    WorkerDescriptor {
        name: "comfyui".to_string(),
        capability: Capability::Image,
        port,
        repository_url: "https://github.com/comfyanonymous/ComfyUI.git".to_string(),
        install: InstallSpec {
            heavy_packages: strings(&["torch", "torchvision", "torchaudio"]),
            heavy_index_url: Some(TORCH_INDEX_URL.to_string()),
            requirement_files: strings(&["requirements.txt"]),
            extra_packages: Vec::new(),
        },
        launch: LaunchSpec {
            interpreter: Interpreter::Environment,
            args: vec![
                "repo/main.py".to_string(),
                "--listen".to_string(),
                "127.0.0.1".to_string(),
                "--port".to_string(),
                port.to_string(),
                "--disable-auto-launch".to_string(),
            ],
        },
        protocol: Protocol::AsyncById,
        output_dir: OutputDir::Repository("output".to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
fn sync_worker(
    name: &str,
    capability: Capability,
    port: u16,
    repository_url: &str,
    entry: &str,
    endpoint: &str,
    heavy: &[&str],
    extras: &[&str],
) -> WorkerDescriptor {
    WorkerDescriptor {
        name: name.to_string(),
        capability,
        port,
        repository_url: repository_url.to_string(),
        install: InstallSpec {
            heavy_packages: strings(heavy),
            heavy_index_url: Some(TORCH_INDEX_URL.to_string()),
            requirement_files: strings(&["requirements.txt"]),
            extra_packages: strings(extras),
        },
        launch: LaunchSpec {
            interpreter: Interpreter::Environment,
            args: vec![
                format!("repo/{entry}"),
                "--host".to_string(),
                "127.0.0.1".to_string(),
                "--port".to_string(),
                port.to_string(),
            ],
        },
        protocol: Protocol::Sync {
            endpoint: endpoint.to_string(),
        },
        output_dir: OutputDir::Shared,
    }
}
