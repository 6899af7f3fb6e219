//! Request/response types crossing the backend seam.

use serde::{Deserialize, Serialize};

/// Identifier for a submitted completion job, scoped to one engine
/// instance.
pub type JobId = u64;

/// Numeric knobs passed to the backend when loading a model.
///
/// Field defaults mirror what the backends treat as "unset"; the
/// coordinator may override `n_gpu_layers` for GPU-class backends before
/// the load call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoadingParameters {
    pub n_ctx: u32,
    pub n_keep: u32,
    pub use_mlock: bool,
    pub use_mmap: bool,
    pub cont_batching: bool,
    pub warmup: bool,
    pub n_parallel: u32,
    pub n_gpu_layers: i32,
    pub n_batch: u32,
    pub n_ubatch: u32,
}

impl Default for LoadingParameters {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_keep: 2048,
            use_mlock: true,
            use_mmap: true,
            cont_batching: true,
            warmup: false,
            n_parallel: 1,
            n_gpu_layers: 0,
            n_batch: 2048,
            n_ubatch: 512,
        }
    }
}

/// Plain text completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_tokens() -> u32 {
    128
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

/// One message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Result of a finished completion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResult {
    pub text: String,
    pub finish_reason: String,
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_parameters_deserialize_with_partial_fields() {
        let params: LoadingParameters = serde_json::from_str(r#"{"n_ctx": 8192}"#).unwrap();
        assert_eq!(params.n_ctx, 8192);
        assert_eq!(params.n_batch, 2048);
        assert_eq!(params.n_gpu_layers, 0);
    }

    #[test]
    fn completion_request_defaults() {
        let req: CompletionRequest = serde_json::from_str(r#"{"prompt": "hi"}"#).unwrap();
        assert_eq!(req.max_tokens, 128);
        assert!(req.stop.is_empty());
    }
}
