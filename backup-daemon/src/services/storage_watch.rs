use backup_engine::audit::JsonlAuditLog;
use backup_engine::Engine;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Identity recorded for alerts raised by the periodic check.
pub const MONITOR: &str = "monitor";

const AUDIT_PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Periodic storage threshold check and daily audit log pruning.
pub fn start_storage_watch(
    engine: Arc<Engine>,
    audit: Arc<JsonlAuditLog>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let check_every = Duration::from_secs(engine.config().storage.check_interval_secs);
    let audit_retention = engine.config().audit.retention_days;

    tokio::spawn(async move {
        let mut check = tokio::time::interval(check_every);
        let mut prune = tokio::time::interval(AUDIT_PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = check.tick() => {
                    match engine.check_storage(MONITOR).await {
                        Ok(result) => tracing::debug!(
                            percentage = result.sample.percentage,
                            alerted = result.alerted,
                            "Storage checked"
                        ),
                        Err(e) => tracing::warn!(error = %e, "Storage check failed"),
                    }
                }
                _ = prune.tick() => {
                    let audit = audit.clone();
                    match tokio::task::spawn_blocking(move || audit.prune(audit_retention, Utc::now())).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::warn!(error = %e, "Audit log pruning failed"),
                        Err(e) => tracing::warn!(error = %e, "Audit log pruning task failed"),
                    }
                }
            }
        }
        tracing::info!("Storage watch stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::app_state;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_watch_prunes_audit_and_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let state = app_state(&dir);
        let stale = dir.path().join("audit/audit-2000-01-01.log");
        std::fs::create_dir_all(dir.path().join("audit")).unwrap();
        std::fs::write(&stale, "").unwrap();

        let cancel = CancellationToken::new();
        let handle = start_storage_watch(state.engine.clone(), state.audit.clone(), cancel.clone());
        for _ in 0..200 {
            if !stale.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert!(!stale.exists());
    }
}
