//! Capability-specific generation requests.
//!
//! [`GenerationRequest`] is the closed set of job inputs, one variant per
//! capability. Adding a worker type means adding a variant here and its
//! reply schema; the orchestration loop stays untouched.

use std::path::{Path, PathBuf};

use kiln_core::capability::Capability;
use kiln_core::layout::Layout;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow;

fn default_side() -> u32 {
    1024
}

fn default_steps() -> u32 {
    20
}

fn default_cfg() -> f32 {
    7.0
}

fn default_voice() -> String {
    "af_heart".to_string()
}

fn default_speed() -> f32 {
    1.0
}

fn default_motion_secs() -> f32 {
    4.0
}

fn default_audio_secs() -> f32 {
    8.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_side")]
    pub width: u32,
    #[serde(default = "default_side")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg")]
    pub cfg_scale: f32,
    /// Random when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub checkpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshRequest {
    /// Reference image the mesh is reconstructed from.
    pub image_path: String,
    #[serde(default)]
    pub texture: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigRequest {
    pub mesh_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionRequest {
    pub prompt: String,
    #[serde(default = "default_motion_secs")]
    pub duration_secs: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_speed")]
    pub speed: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioRequest {
    pub prompt: String,
    #[serde(default = "default_audio_secs")]
    pub duration_secs: f32,
}

#[derive(Debug, Clone)]
pub enum GenerationRequest {
    Image(ImageRequest),
    Mesh(MeshRequest),
    Rig(RigRequest),
    Motion(MotionRequest),
    Speech(SpeechRequest),
    Audio(AudioRequest),
}

/// One generation call: what to make and where to put it.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub request: GenerationRequest,
    /// Copy the artifact here; when absent the worker-local path is returned.
    pub destination: Option<PathBuf>,
}

impl GenerationRequest {
    pub fn capability(&self) -> Capability {
        match self {
            Self::Image(_) => Capability::Image,
            Self::Mesh(_) => Capability::Mesh,
            Self::Rig(_) => Capability::Rig,
            Self::Motion(_) => Capability::Motion,
            Self::Speech(_) => Capability::Speech,
            Self::Audio(_) => Capability::Audio,
        }
    }

    /// Decode the request fields of `capability` from a JSON object.
    pub fn from_json(capability: Capability, body: Value) -> Result<Self, serde_json::Error> {
        Ok(match capability {
            Capability::Image => Self::Image(serde_json::from_value(body)?),
            Capability::Mesh => Self::Mesh(serde_json::from_value(body)?),
            Capability::Rig => Self::Rig(serde_json::from_value(body)?),
            Capability::Motion => Self::Motion(serde_json::from_value(body)?),
            Capability::Speech => Self::Speech(serde_json::from_value(body)?),
            Capability::Audio => Self::Audio(serde_json::from_value(body)?),
        })
    }

    /// JSON body for a synchronous worker. Workers are told where to write
    /// via `output_dir` and receive the job id for file naming.
    ///
    /// Image requests go through a workflow graph instead and yield `None`.
    pub fn sync_body(&self, output_dir: &Path, job_id: &str) -> Option<Value> {
        let fields = match self {
            Self::Image(_) => return None,
            Self::Mesh(req) => serde_json::to_value(req),
            Self::Rig(req) => serde_json::to_value(req),
            Self::Motion(req) => serde_json::to_value(req),
            Self::Speech(req) => serde_json::to_value(req),
            Self::Audio(req) => serde_json::to_value(req),
        };

        // Plain structs of strings and numbers always serialize to objects.
        let mut body = match fields {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        body.insert(
            "output_dir".to_string(),
            Value::String(output_dir.to_string_lossy().into_owned()),
        );
        body.insert("job_id".to_string(), Value::String(job_id.to_string()));
        Some(Value::Object(body))
    }
}

impl ImageRequest {
    /// The txt2img graph for this request, seeded randomly unless a seed
    /// was given.
    pub fn workflow(&self, checkpoint: &str) -> Value {
        workflow::txt2img(self, checkpoint, self.seed.unwrap_or_else(random_seed))
    }
}

impl GenerationJob {
    /// Decode a job for `capability`: the request fields plus an optional
    /// `destination` path, all in one JSON object.
    pub fn from_json(capability: Capability, mut body: Value) -> Result<Self, serde_json::Error> {
        let destination = match body.as_object_mut().and_then(|o| o.remove("destination")) {
            None | Some(Value::Null) => None,
            Some(value) => Some(serde_json::from_value::<PathBuf>(value)?),
        };
        Ok(Self {
            request: GenerationRequest::from_json(capability, body)?,
            destination,
        })
    }

    /// Anchor relative input and destination paths at the outputs
    /// directory of `layout`.
    pub fn resolve_paths(&mut self, layout: &Layout) {
        let resolve = |path: &str| {
            layout
                .resolve_output_path(Path::new(path))
                .to_string_lossy()
                .into_owned()
        };
        match &mut self.request {
            GenerationRequest::Mesh(req) => req.image_path = resolve(&req.image_path),
            GenerationRequest::Rig(req) => req.mesh_path = resolve(&req.mesh_path),
            _ => {}
        }
        if let Some(dest) = self.destination.take() {
            self.destination = Some(layout.resolve_output_path(&dest));
        }
    }
}

fn random_seed() -> u64 {
    // The low half of a v4 UUID is random.
    uuid::Uuid::new_v4().as_u64_pair().1
}
