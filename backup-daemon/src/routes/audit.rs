use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use backup_engine::audit::{AuditAction, AuditEvent, AuditFilter, AuditLevel};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub action: Option<AuditAction>,
    pub triggered_by: Option<String>,
    pub level: Option<AuditLevel>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(query_audit))
}

async fn query_audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEvent>>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let filter = AuditFilter {
        action: query.action,
        triggered_by: query.triggered_by,
        level: query.level,
        since: query.since,
    };
    let audit = state.audit.clone();
    let events = tokio::task::spawn_blocking(move || audit.query(&filter, limit))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(events))
}
