use backup_engine::audit::JsonlAuditLog;
use backup_engine::Engine;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub engine: Arc<Engine>,
    pub audit: Arc<JsonlAuditLog>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, audit: Arc<JsonlAuditLog>) -> Self {
        Self {
            engine,
            audit,
            started_at: Instant::now(),
        }
    }
}
