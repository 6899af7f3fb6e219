//! Inference backend listing and registration.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::ToSchema;

use kolosal_inference::BackendConfig;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AddBackendRequest {
    pub name: String,
    pub library_path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub load_on_startup: bool,
}

pub async fn list_backends(State(state): State<AppState>) -> Json<Value> {
    let backends = state.engines.list_available_backends();
    Json(json!({
        "inference_engines": backends,
        "default_inference_engine": state.config.default_inference_engine,
    }))
}

pub async fn add_backend(
    State(state): State<AppState>,
    Json(request): Json<AddBackendRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if request.name.trim().is_empty() {
        return Err(ApiError::validation(
            "missing_engine_name",
            "name must not be empty",
            Some("name"),
        ));
    }

    let provider = state.engines.backend_provider();
    if provider.available().iter().any(|b| b.name == request.name) {
        return Err(ApiError::conflict(
            "engine_already_exists",
            format!("Inference backend '{}' is already registered", request.name),
        ));
    }
    if !std::path::Path::new(&request.library_path).exists() {
        return Err(ApiError::validation(
            "library_not_found",
            format!("Library file does not exist: {}", request.library_path),
            Some("library_path"),
        ));
    }

    provider
        .add_backend(BackendConfig {
            name: request.name.clone(),
            library_path: request.library_path.clone(),
            description: request.description.clone(),
            load_on_startup: request.load_on_startup,
        })
        .map_err(|e| {
            ApiError::unprocessable("engine_registration_failed", e.to_string())
        })?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "name": request.name,
            "library_path": request.library_path,
            "status": "registered",
        })),
    ))
}
