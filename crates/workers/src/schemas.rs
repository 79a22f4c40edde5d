//! Typed worker response schemas.
//!
//! Every field the orchestrator relies on is required here, so a reply that
//! is missing one (or has it mistyped) fails to decode instead of yielding
//! a silent default.

use std::collections::HashMap;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Async-by-id (ComfyUI)
// ---------------------------------------------------------------------------

/// Reply of `POST /prompt`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: Option<i64>,
}

/// Reply of `GET /history/{id}`: prompt id to record. Empty until the
/// prompt has finished executing.
pub type HistoryResponse = HashMap<String, HistoryRecord>;

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryRecord {
    #[serde(default)]
    pub outputs: HashMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<FileRef>,
}

/// Location of an output file inside the worker's output tree.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    "output".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    /// `[event_name, details]` pairs reported during execution.
    #[serde(default)]
    pub messages: Vec<(String, serde_json::Value)>,
}

/// Where an async job stands according to its history record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryState {
    /// No record yet, or a record without outputs.
    Pending,
    Completed(FileRef),
    Failed(String),
}

impl HistoryRecord {
    pub fn state(&self) -> HistoryState {
        if let Some(status) = &self.status {
            if status.status_str.as_deref() == Some("error") {
                return HistoryState::Failed(status.error_message());
            }
        }

        // Node ids are numeric strings; pick the lowest-numbered output
        // node so the choice is stable across polls.
        let mut nodes: Vec<_> = self.outputs.iter().collect();
        nodes.sort_by_key(|(id, _)| (id.parse::<u64>().unwrap_or(u64::MAX), id.to_string()));
        match nodes.into_iter().find_map(|(_, out)| out.images.first()) {
            Some(file) => HistoryState::Completed(file.clone()),
            None => HistoryState::Pending,
        }
    }
}

impl ExecutionStatus {
    fn error_message(&self) -> String {
        self.messages
            .iter()
            .find(|(event, _)| event == "execution_error")
            .and_then(|(_, details)| details.get("exception_message"))
            .and_then(|m| m.as_str())
            .map(|m| m.trim().to_string())
            .unwrap_or_else(|| "execution error".to_string())
    }
}

/// Reply of `GET /object_info/{node}`: node class name to its schema.
pub type ObjectInfoResponse = HashMap<String, NodeInfo>;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    pub input: NodeInputs,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeInputs {
    /// Input name to `[type, options]`.
    #[serde(default)]
    pub required: HashMap<String, serde_json::Value>,
}

impl NodeInfo {
    /// Values a combo input accepts, in the order the worker lists them.
    ///
    /// Older servers put the list in the type slot (`[[a, b], {...}]`);
    /// newer ones use `["COMBO", {"options": [a, b]}]`.
    pub fn choices(&self, input: &str) -> Vec<String> {
        let Some(spec) = self.input.required.get(input).and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        let list = match spec.first() {
            Some(serde_json::Value::Array(list)) => Some(list),
            _ => spec
                .get(1)
                .and_then(|opts| opts.get("options"))
                .and_then(|o| o.as_array()),
        };
        list.into_iter()
            .flatten()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Synchronous workers
// ---------------------------------------------------------------------------

/// A synchronous worker reply that names the produced artifact.
pub trait SyncReply: serde::de::DeserializeOwned + Send {
    fn artifact_path(&self) -> &str;
}

/// Reply of the mesh worker.
#[derive(Debug, Clone, Deserialize)]
pub struct MeshReply {
    pub mesh_path: String,
    #[serde(default)]
    pub face_count: Option<u64>,
}

/// Reply of the rigging worker.
#[derive(Debug, Clone, Deserialize)]
pub struct RigReply {
    pub rigged_path: String,
    #[serde(default)]
    pub joint_count: Option<u32>,
}

/// Reply of the motion worker.
#[derive(Debug, Clone, Deserialize)]
pub struct MotionReply {
    pub motion_path: String,
    #[serde(default)]
    pub frames: Option<u32>,
}

/// Reply of the speech and audio workers.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioReply {
    pub audio_path: String,
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

impl SyncReply for MeshReply {
    fn artifact_path(&self) -> &str {
        &self.mesh_path
    }
}

impl SyncReply for RigReply {
    fn artifact_path(&self) -> &str {
        &self.rigged_path
    }
}

impl SyncReply for MotionReply {
    fn artifact_path(&self) -> &str {
        &self.motion_path
    }
}

impl SyncReply for AudioReply {
    fn artifact_path(&self) -> &str {
        &self.audio_path
    }
}
