use crate::error::AppError;
use crate::routes::triggered_by;
use crate::state::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_engine::engine::EngineStatus;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/server/restart", post(restart_server))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "job": state.engine.current_job(),
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> Result<Json<EngineStatus>, AppError> {
    Ok(Json(state.engine.status().await?))
}

async fn restart_server(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    state.engine.restart_server(&triggered_by(&headers)).await?;
    Ok(Json(json!({ "restarted": true })))
}
