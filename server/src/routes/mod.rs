//! HTTP route assembly.
//!
//! Every API route is mounted both bare (`/models`) and under the
//! OpenAI-style version prefix (`/v1/models`); health endpoints live at
//! the root only.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod backends;
pub mod completions;
pub mod downloads;
pub mod health;
pub mod models;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/models",
            get(models::list_models).post(models::add_model),
        )
        .route(
            "/models/{model_id}",
            get(models::model_status).delete(models::remove_model),
        )
        .route("/models/{model_id}/status", get(models::model_status))
        .route(
            "/downloads",
            get(downloads::list_downloads).delete(downloads::cancel_all_downloads),
        )
        .route("/downloads/cancel", post(downloads::cancel_all_downloads))
        .route(
            "/downloads/{model_id}",
            get(downloads::get_download).delete(downloads::cancel_download),
        )
        .route("/downloads/{model_id}/cancel", post(downloads::cancel_download))
        .route("/downloads/{model_id}/pause", post(downloads::pause_download))
        .route("/downloads/{model_id}/resume", post(downloads::resume_download))
        .route(
            "/inference-engines",
            get(backends::list_backends).post(backends::add_backend),
        )
        .route("/completions", post(completions::completion))
        .route("/chat/completions", post(completions::chat_completion));

    Router::new()
        .merge(api.clone())
        .nest("/v1", api)
        .route("/health", get(health::health))
        .route("/status", get(health::status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
