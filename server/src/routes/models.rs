//! Model management endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;

use kolosal_downloads::{generate_download_path, is_valid_url, EngineCreationParams};
use kolosal_engines::{EngineState, EngineSummary};
use kolosal_inference::LoadingParameters;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Add-or-register model request.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AddModelRequest {
    pub model_id: String,
    /// Local file, directory containing a .gguf, or HTTP(S) URL
    pub model_path: String,
    #[serde(default = "default_true")]
    pub load_immediately: bool,
    #[serde(default = "default_gpu_id")]
    pub main_gpu_id: i32,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub loading_parameters: LoadingParameters,
    #[serde(default)]
    pub inference_engine: Option<String>,
    #[serde(default)]
    pub is_embedding: bool,
}

fn default_true() -> bool {
    true
}

fn default_gpu_id() -> i32 {
    -1
}

fn capabilities(summary: &EngineSummary) -> Vec<&'static str> {
    if summary.is_embedding {
        vec!["embeddings"]
    } else {
        vec!["completions", "chat_completions"]
    }
}

fn model_type(summary: &EngineSummary) -> &'static str {
    if summary.is_embedding {
        "embedding"
    } else {
        "llm"
    }
}

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let summaries = state.engines.engine_summaries();
    let loaded = summaries
        .iter()
        .filter(|s| s.state == EngineState::Loaded)
        .count();

    let models: Vec<Value> = summaries
        .iter()
        .map(|s| {
            json!({
                "model_id": s.id,
                "status": s.state.as_str(),
                "available": s.state == EngineState::Loaded,
                "model_type": model_type(s),
                "capabilities": capabilities(s),
                "inference_ready": s.state == EngineState::Loaded,
            })
        })
        .collect();

    Json(json!({
        "models": models,
        "summary": {
            "total_models": summaries.len(),
            "loaded_models": loaded,
            "lazy_models": summaries.len() - loaded,
        }
    }))
}

pub async fn add_model(
    State(state): State<AppState>,
    Json(request): Json<AddModelRequest>,
) -> ApiResult<Response> {
    if request.model_id.trim().is_empty() {
        return Err(ApiError::validation(
            "missing_model_id",
            "model_id must not be empty",
            Some("model_id"),
        ));
    }
    if request.model_path.trim().is_empty() {
        return Err(ApiError::validation(
            "missing_model_path",
            "model_path must not be empty",
            Some("model_path"),
        ));
    }

    let (exists, _) = state.engines.get_status(&request.model_id);
    if exists {
        return Err(ApiError::conflict(
            "model_already_loaded",
            format!("Model '{}' already exists on this server", request.model_id),
        ));
    }

    if is_valid_url(&request.model_path) {
        return start_async_download(&state, request).await;
    }

    let result = if request.is_embedding {
        if request.load_immediately {
            state
                .engines
                .add_embedding(
                    &request.model_id,
                    &request.model_path,
                    request.loading_parameters.clone(),
                    request.main_gpu_id,
                )
                .await
        } else {
            state
                .engines
                .register_embedding(
                    &request.model_id,
                    &request.model_path,
                    request.loading_parameters.clone(),
                    request.main_gpu_id,
                )
                .await
        }
    } else if request.load_immediately {
        state
            .engines
            .add(
                &request.model_id,
                &request.model_path,
                request.loading_parameters.clone(),
                request.main_gpu_id,
                request.inference_engine.as_deref(),
            )
            .await
    } else {
        state
            .engines
            .register(
                &request.model_id,
                &request.model_path,
                request.loading_parameters.clone(),
                request.main_gpu_id,
                request.inference_engine.as_deref(),
            )
            .await
    };
    result?;

    let status = if request.load_immediately {
        "loaded"
    } else {
        "registered"
    };
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "model_id": request.model_id,
            "status": status,
        })),
    )
        .into_response())
}

/// URL model paths download in the background; the request returns 202
/// with the progress endpoint coordinates.
async fn start_async_download(state: &AppState, request: AddModelRequest) -> ApiResult<Response> {
    let local_path = generate_download_path(state.downloads.models_dir(), &request.model_path);
    let params = EngineCreationParams {
        model_id: request.model_id.clone(),
        load_immediately: request.load_immediately,
        main_gpu_id: request.main_gpu_id,
        load_params: request.loading_parameters.clone(),
        backend_name: request.inference_engine.clone(),
    };

    let started = state
        .downloads
        .start_with_engine(&request.model_id, &request.model_path, local_path.clone(), params)
        .await;
    if !started {
        return Err(ApiError::conflict(
            "download_in_progress",
            format!("A download for '{}' is already in progress", request.model_id),
        ));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "model_id": request.model_id,
            "status": "downloading",
            "download_url": request.model_path,
            "local_path": local_path.to_string_lossy(),
            "message": format!("Track progress at /downloads/{}", request.model_id),
        })),
    )
        .into_response())
}

pub async fn model_status(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let summary = state
        .engines
        .engine_summaries()
        .into_iter()
        .find(|s| s.id == model_id)
        .ok_or_else(|| {
            ApiError::not_found("model_not_found", format!("Model '{model_id}' not found"))
        })?;

    let loaded = summary.state == EngineState::Loaded;
    Ok(Json(json!({
        "model_id": summary.id,
        "status": summary.state.as_str(),
        "available": loaded,
        "engine_loaded": loaded,
        "inference_ready": loaded,
        "model_type": model_type(&summary),
        "capabilities": capabilities(&summary),
        "inference_engine": summary.backend_name,
    })))
}

pub async fn remove_model(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.engines.remove(&model_id).await?;
    Ok(Json(json!({
        "model_id": model_id,
        "status": "removed",
    })))
}
