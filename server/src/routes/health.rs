//! Liveness and status reporting.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use kolosal_engines::EngineState;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let summaries = state.engines.engine_summaries();
    let loaded = summaries
        .iter()
        .filter(|s| s.state == EngineState::Loaded)
        .count();
    let active_downloads = state
        .downloads
        .list()
        .iter()
        .filter(|s| !s.status.is_terminal())
        .count();

    Json(json!({
        "status": "ok",
        "engines": { "total": summaries.len(), "loaded": loaded },
        "downloads": { "active": active_downloads },
    }))
}

pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let summaries = state.engines.engine_summaries();
    let loaded: Vec<&str> = summaries
        .iter()
        .filter(|s| s.state == EngineState::Loaded)
        .map(|s| s.id.as_str())
        .collect();
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);

    let memory = kolosal_hardware::detect_memory()
        .map(|m| json!({ "total_ram_mb": m.total_ram_mb, "available_ram_mb": m.available_ram_mb }))
        .unwrap_or_else(|_| json!(null));

    Json(json!({
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "engines": {
            "total": summaries.len(),
            "loaded": loaded.len(),
            "loaded_ids": loaded,
        },
        "inference_backends": state.engines.list_available_backends().len(),
        "downloads": { "tracked": state.downloads.list().len() },
        "memory": memory,
    }))
}
