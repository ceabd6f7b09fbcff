use crate::error::AppError;
use crate::routes::triggered_by;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use backup_engine::catalog::BackupInfo;
use backup_engine::checksum::{ChecksumDiff, VerifyReport};
use backup_engine::job::JobRecord;
use backup_engine::storage::CleanupReport;
use backup_engine::EngineError;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub sizes: bool,
}

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    pub from: String,
    pub to: String,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/backups", get(list_backups).post(start_backup))
        .route("/backups/{name}", delete(delete_backup))
        .route("/backups/{name}/verify", get(verify_backup))
        .route("/snapshots", get(list_snapshots))
        .route("/snapshots/{name}", delete(delete_snapshot))
        .route("/restore/{name}", post(start_restore))
        .route("/rollback/{name}", post(start_rollback))
        .route("/diff", get(diff))
        .route("/cleanup", post(cleanup))
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BackupInfo>>, AppError> {
    Ok(Json(state.engine.list_backups(query.sizes).await?))
}

async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BackupInfo>>, AppError> {
    Ok(Json(state.engine.list_snapshots(query.sizes).await?))
}

async fn start_backup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<JobRecord>), AppError> {
    let record = state.engine.spawn_backup(&triggered_by(&headers))?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn start_restore(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<JobRecord>), AppError> {
    // fail fast on unknown names instead of reporting them from the background job
    let catalog = state.engine.catalog().clone();
    let lookup = name.clone();
    tokio::task::spawn_blocking(move || catalog.require(&lookup))
        .await
        .map_err(EngineError::from)??;
    let record = state.engine.spawn_restore(&name, &triggered_by(&headers))?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn start_rollback(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<JobRecord>), AppError> {
    let record = state.engine.spawn_rollback(&name, &triggered_by(&headers))?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn verify_backup(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<VerifyReport>, AppError> {
    Ok(Json(state.engine.verify(&name).await?))
}

async fn diff(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DiffQuery>,
) -> Result<Json<ChecksumDiff>, AppError> {
    Ok(Json(state.engine.diff(&query.from, &query.to).await?))
}

async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let bytes = state.engine.delete_backup(&name, &triggered_by(&headers)).await?;
    Ok(Json(json!({ "name": name, "bytes_removed": bytes })))
}

async fn delete_snapshot(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let bytes = state.engine.delete_snapshot(&name, &triggered_by(&headers)).await?;
    Ok(Json(json!({ "name": name, "bytes_removed": bytes })))
}

async fn cleanup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<CleanupReport>, AppError> {
    Ok(Json(state.engine.cleanup(&triggered_by(&headers)).await?))
}

#[cfg(test)]
mod tests {
    use crate::routes::create_router;
    use crate::routes::test_support::app_state;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn call(app: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("x-triggered-by", "tester")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_backup_lifecycle_over_http() {
        let dir = TempDir::new().unwrap();
        let state = app_state(&dir);
        let app = create_router(state.clone());

        let (status, body) = call(&app, Method::POST, "/backups").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["kind"], "backup");
        assert_eq!(body["triggered_by"], "api:tester");

        while state.engine.current_job().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (status, body) = call(&app, Method::GET, "/backups?sizes=true").await;
        assert_eq!(status, StatusCode::OK);
        let backups = body.as_array().unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0]["size"], 5);
        let name = backups[0]["name"].as_str().unwrap().to_string();

        let (status, body) = call(&app, Method::GET, &format!("/backups/{name}/verify")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], true);

        let (status, body) = call(&app, Method::GET, "/audit?action=BACKUP_COMPLETED").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = call(&app, Method::DELETE, &format!("/snapshots/{name}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, Method::DELETE, &format!("/backups/{name}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], name.as_str());
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let dir = TempDir::new().unwrap();
        let app = create_router(app_state(&dir));

        let (status, _) = call(&app, Method::POST, "/restore/2001-01-01_000000").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, Method::POST, "/rollback/2001-01-01_000000").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, Method::GET, "/diff?from=a&to=b").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, Method::POST, "/jobs/cancel").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("No job"));

        let (status, body) = call(&app, Method::GET, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_restore_accepted_for_known_backup() {
        let dir = TempDir::new().unwrap();
        let state = app_state(&dir);
        let app = create_router(state.clone());

        call(&app, Method::POST, "/backups").await;
        while state.engine.current_job().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let name = state.engine.catalog().latest().unwrap();

        let (status, body) = call(&app, Method::POST, &format!("/restore/{name}")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["kind"], "restore");
        assert_eq!(body["target"], name.as_str());

        let (status, _) = call(&app, Method::POST, &format!("/restore/{name}")).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
