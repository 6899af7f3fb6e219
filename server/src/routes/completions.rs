//! OpenAI-compatible completion endpoints (non-streaming).
//!
//! These are the inference entry points that drive the engine lifecycle:
//! a request fetches the engine through the coordinator (loading it on
//! demand and refreshing its idle clock) and then runs one blocking job
//! against the backend.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use kolosal_inference::{
    ChatCompletionRequest, ChatMessage, CompletionRequest, CompletionResult, InferenceEngine,
};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Upper bound on one inference job.
const JOB_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CompletionHttpRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ChatHttpMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ChatCompletionHttpRequest {
    pub model: String,
    pub messages: Vec<ChatHttpMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub stream: bool,
}

/// Run one completion job to completion on a blocking thread.
fn run_job(
    engine: Arc<dyn InferenceEngine>,
    submit: impl FnOnce(&dyn InferenceEngine) -> kolosal_inference::Result<u64> + Send + 'static,
) -> impl std::future::Future<Output = ApiResult<CompletionResult>> {
    async move {
        let result = tokio::task::spawn_blocking(move || {
            let job = submit(engine.as_ref())
                .map_err(|e| format!("job submission failed: {e}"))?;
            let finished = engine
                .wait_for_job(job, JOB_TIMEOUT)
                .map_err(|e| format!("job wait failed: {e}"))?;
            if !finished {
                return Err(format!(
                    "inference did not finish within {} seconds",
                    JOB_TIMEOUT.as_secs()
                ));
            }
            if let Some(error) = engine.get_job_error(job) {
                return Err(error);
            }
            engine
                .get_job_result(job)
                .map_err(|e| format!("failed to fetch job result: {e}"))
        })
        .await;

        match result {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(message)) => Err(ApiError::unprocessable("inference_failed", message)),
            Err(e) => Err(ApiError::internal(format!("inference task aborted: {e}"))),
        }
    }
}

fn reject_streaming(stream: bool) -> ApiResult<()> {
    if stream {
        return Err(ApiError::validation(
            "streaming_not_supported",
            "streaming responses are not supported on this endpoint",
            Some("stream"),
        ));
    }
    Ok(())
}

pub async fn completion(
    State(state): State<AppState>,
    Json(request): Json<CompletionHttpRequest>,
) -> ApiResult<Json<Value>> {
    reject_streaming(request.stream)?;

    let engine = state.engines.get(&request.model).await?;
    let backend_request = CompletionRequest {
        prompt: request.prompt.clone(),
        max_tokens: request.max_tokens.unwrap_or(128),
        temperature: request.temperature.unwrap_or(1.0),
        top_p: request.top_p.unwrap_or(1.0),
        stop: request.stop.clone().unwrap_or_default(),
        seed: request.seed,
    };

    let result = run_job(engine, move |e| e.submit_completion(&backend_request)).await?;

    Ok(Json(json!({
        "id": format!("cmpl-{}", Uuid::new_v4().simple()),
        "object": "text_completion",
        "created": Utc::now().timestamp(),
        "model": request.model,
        "choices": [{
            "text": result.text,
            "index": 0,
            "logprobs": null,
            "finish_reason": result.finish_reason,
        }],
        "usage": {
            "prompt_tokens": result.prompt_tokens,
            "completion_tokens": result.completion_tokens,
            "total_tokens": result.prompt_tokens + result.completion_tokens,
        },
    })))
}

pub async fn chat_completion(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionHttpRequest>,
) -> ApiResult<Json<Value>> {
    reject_streaming(request.stream)?;
    if request.messages.is_empty() {
        return Err(ApiError::validation(
            "missing_messages",
            "messages must not be empty",
            Some("messages"),
        ));
    }

    let engine = state.engines.get(&request.model).await?;
    let backend_request = ChatCompletionRequest {
        messages: request
            .messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect(),
        max_tokens: request.max_tokens.unwrap_or(128),
        temperature: request.temperature.unwrap_or(1.0),
        top_p: request.top_p.unwrap_or(1.0),
        stop: request.stop.clone().unwrap_or_default(),
        seed: request.seed,
    };

    let result = run_job(engine, move |e| e.submit_chat_completion(&backend_request)).await?;

    Ok(Json(json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": request.model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": result.text },
            "finish_reason": result.finish_reason,
        }],
        "usage": {
            "prompt_tokens": result.prompt_tokens,
            "completion_tokens": result.completion_tokens,
            "total_tokens": result.prompt_tokens + result.completion_tokens,
        },
    })))
}
