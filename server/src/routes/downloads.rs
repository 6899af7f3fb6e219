//! Download tracking and control endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use kolosal_downloads::{DownloadStatus, ProgressSnapshot};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Progress JSON as exposed to clients: percentages arrive pre-clamped
/// from the manager.
fn download_json(snap: &ProgressSnapshot) -> Value {
    let mut timing = json!({
        "start_time": snap.start_time,
        "elapsed_seconds": snap.elapsed_seconds,
    });
    if let Some(eta) = snap.estimated_remaining_seconds {
        timing["estimated_remaining_seconds"] = json!(eta);
    }
    if let Some(end) = snap.end_time {
        timing["end_time"] = json!(end);
    }

    let mut body = json!({
        "model_id": snap.model_id,
        "url": snap.url,
        "local_path": snap.local_path,
        "status": snap.status.as_str(),
        "progress": {
            "downloaded_bytes": snap.downloaded_bytes,
            "total_bytes": snap.total_bytes,
            "percentage": snap.percentage,
        },
        "download_speed_bps": snap.download_speed_bps,
        "timing": timing,
    });
    if let Some(error) = &snap.error_message {
        body["error_message"] = json!(error);
    }
    if let Some(params) = &snap.engine_params {
        body["engine_creation"] = json!({
            "model_id": params.model_id,
            "load_immediately": params.load_immediately,
            "main_gpu_id": params.main_gpu_id,
        });
    }
    body
}

pub async fn list_downloads(State(state): State<AppState>) -> Json<Value> {
    let snapshots = state.downloads.list();

    let count = |statuses: &[DownloadStatus]| {
        snapshots
            .iter()
            .filter(|s| statuses.contains(&s.status))
            .count()
    };
    let summary = json!({
        "total": snapshots.len(),
        "active": count(&[DownloadStatus::Downloading, DownloadStatus::CreatingEngine]),
        "paused": count(&[DownloadStatus::Paused]),
        "completed": count(&[
            DownloadStatus::Completed,
            DownloadStatus::AlreadyComplete,
            DownloadStatus::EngineCreated,
            DownloadStatus::EngineAlreadyExists,
        ]),
        "failed": count(&[DownloadStatus::Failed, DownloadStatus::EngineCreationFailed]),
        "cancelled": count(&[DownloadStatus::Cancelled]),
    });

    let downloads: Vec<Value> = snapshots.iter().map(download_json).collect();
    Json(json!({ "downloads": downloads, "summary": summary }))
}

pub async fn get_download(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let snap = state.downloads.get(&model_id).ok_or_else(|| {
        ApiError::not_found(
            "download_not_found",
            format!("No download tracked for '{model_id}'"),
        )
    })?;
    Ok(Json(download_json(&snap)))
}

pub async fn cancel_download(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if state.downloads.get(&model_id).is_none() {
        return Err(ApiError::not_found(
            "download_not_found",
            format!("No download tracked for '{model_id}'"),
        ));
    }
    if !state.downloads.cancel(&model_id) {
        return Err(ApiError::validation(
            "download_not_cancellable",
            format!("Download for '{model_id}' is already in a terminal state"),
            None,
        ));
    }
    Ok(Json(json!({
        "model_id": model_id,
        "status": "cancelled",
        "message": "Partial file is preserved for future resume",
    })))
}

pub async fn cancel_all_downloads(State(state): State<AppState>) -> Json<Value> {
    let cancelled = state.downloads.cancel_all();
    Json(json!({
        "cancelled_count": cancelled,
        "message": format!("Cancelled {cancelled} download(s)"),
    }))
}

pub async fn pause_download(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if state.downloads.get(&model_id).is_none() {
        return Err(ApiError::not_found(
            "download_not_found",
            format!("No download tracked for '{model_id}'"),
        ));
    }
    if !state.downloads.pause(&model_id) {
        return Err(ApiError::validation(
            "download_not_pausable",
            format!("Download for '{model_id}' is not currently downloading"),
            None,
        ));
    }
    Ok(Json(json!({ "model_id": model_id, "status": "paused" })))
}

pub async fn resume_download(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if state.downloads.get(&model_id).is_none() {
        return Err(ApiError::not_found(
            "download_not_found",
            format!("No download tracked for '{model_id}'"),
        ));
    }
    if !state.downloads.resume(&model_id) {
        return Err(ApiError::validation(
            "download_not_paused",
            format!("Download for '{model_id}' is not paused"),
            None,
        ));
    }
    Ok(Json(json!({ "model_id": model_id, "status": "downloading" })))
}
