use std::time::Instant;

use axum::{
    extract::State,
    http::{Method, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::Settings;
use crate::control::RetrainOutcome;
use crate::AppState;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RetrainResponse {
    pub outcome: RetrainOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResetResponse {
    pub status: String,
}

#[utoipa::path(
    get,
    path = "/settings",
    responses((status = 200, description = "Settings as currently stored on disk", body = Settings)),
    tag = "admin"
)]
pub async fn settings_handler(State(state): State<AppState>) -> Json<Settings> {
    let started = Instant::now();
    let settings = state.settings_store().load();
    state.record_http_observation(Method::GET, "/settings", StatusCode::OK, started);
    Json(settings)
}

#[utoipa::path(
    post,
    path = "/admin/retrain",
    responses((status = 200, description = "Outcome of the retrain request", body = RetrainResponse)),
    tag = "admin"
)]
pub async fn retrain_handler(State(state): State<AppState>) -> Json<RetrainResponse> {
    let started = Instant::now();
    let outcome = state
        .control()
        .request_retrain(state.config().action_count)
        .await;
    state.record_http_observation(Method::POST, "/admin/retrain", StatusCode::OK, started);
    Json(RetrainResponse { outcome })
}

#[utoipa::path(
    post,
    path = "/admin/reset",
    responses((status = 200, description = "Trace, engine, and remote state cleared", body = ResetResponse)),
    tag = "admin"
)]
pub async fn reset_handler(State(state): State<AppState>) -> Json<ResetResponse> {
    let started = Instant::now();
    let lifecycle = state.lifecycle().clone();
    let cache = state.selection_cache().clone();
    let cfg = state.config().clone();

    // Detached: has to finish even when the request times out.
    let task = tokio::spawn(async move {
        lifecycle.reset().await;
        cache.clear();
        lifecycle
            .create(cfg.action_count, &cfg.model_output_dir, cfg.fixed_action)
            .await;
    });
    if let Err(err) = task.await {
        tracing::error!(error = %err, "reset task failed");
    }

    state.record_http_observation(Method::POST, "/admin/reset", StatusCode::OK, started);
    Json(ResetResponse {
        status: "reset".into(),
    })
}
