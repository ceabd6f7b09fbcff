pub mod audit;
pub mod backups;
pub mod jobs;
pub mod status;

use crate::state::AppState;
use axum::http::HeaderMap;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Header naming the operator behind a request.
pub const TRIGGERED_BY_HEADER: &str = "x-triggered-by";

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(status::router())
        .merge(backups::router())
        .nest("/jobs", jobs::router())
        .nest("/audit", audit::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) fn triggered_by(headers: &HeaderMap) -> String {
    headers
        .get(TRIGGERED_BY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| format!("api:{v}"))
        .unwrap_or_else(|| "api".to_string())
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_triggered_by_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(triggered_by(&headers), "api");
        headers.insert(TRIGGERED_BY_HEADER, HeaderValue::from_static("alice"));
        assert_eq!(triggered_by(&headers), "api:alice");
    }
}
