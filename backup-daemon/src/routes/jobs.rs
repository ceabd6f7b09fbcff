use crate::error::AppError;
use crate::routes::triggered_by;
use crate::state::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_engine::job::JobRecord;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/current", get(current_job))
        .route("/cancel", post(cancel_job))
}

async fn current_job(State(state): State<Arc<AppState>>) -> Json<Option<JobRecord>> {
    Json(state.engine.current_job())
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<JobRecord>, AppError> {
    Ok(Json(state.engine.cancel(&triggered_by(&headers))?))
}
