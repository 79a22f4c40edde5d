//! ComfyUI text-to-image workflow graph.
//!
//! The graph is the API-format JSON ComfyUI accepts on `/prompt`: a map of
//! node id to `{class_type, inputs}`, where links are `[node_id, slot]`.

use serde_json::{json, Value};

use crate::request::ImageRequest;

/// Node class whose `ckpt_name` input lists the installed checkpoints.
pub const CHECKPOINT_LOADER: &str = "CheckpointLoaderSimple";

pub const CHECKPOINT_INPUT: &str = "ckpt_name";

/// Prefix of files written by the `SaveImage` node.
pub const FILENAME_PREFIX: &str = "kiln";

/// Node id of the `SaveImage` node.
pub const SAVE_NODE: &str = "9";

/// Checkpoint to use when a request names none: the first whose name
/// mentions flux, else the first listed.
pub fn pick_checkpoint(names: &[String]) -> Option<&str> {
    names
        .iter()
        .find(|n| n.to_ascii_lowercase().contains("flux"))
        .or_else(|| names.first())
        .map(String::as_str)
}

/// Build the txt2img graph for `req` loading `checkpoint`, with the given
/// sampler `seed`.
pub fn txt2img(req: &ImageRequest, checkpoint: &str, seed: u64) -> Value {
    json!({
        "4": {
            "class_type": CHECKPOINT_LOADER,
            "inputs": { CHECKPOINT_INPUT: checkpoint }
        },
        "5": {
            "class_type": "EmptyLatentImage",
            "inputs": { "width": req.width, "height": req.height, "batch_size": 1 }
        },
        "6": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": req.prompt, "clip": ["4", 1] }
        },
        "7": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": req.negative_prompt.as_deref().unwrap_or(""), "clip": ["4", 1] }
        },
        "3": {
            "class_type": "KSampler",
            "inputs": {
                "seed": seed,
                "steps": req.steps,
                "cfg": req.cfg_scale,
                "sampler_name": "euler",
                "scheduler": "normal",
                "denoise": 1.0,
                "model": ["4", 0],
                "positive": ["6", 0],
                "negative": ["7", 0],
                "latent_image": ["5", 0]
            }
        },
        "8": {
            "class_type": "VAEDecode",
            "inputs": { "samples": ["3", 0], "vae": ["4", 2] }
        },
        SAVE_NODE: {
            "class_type": "SaveImage",
            "inputs": { "filename_prefix": FILENAME_PREFIX, "images": ["8", 0] }
        }
    })
}
