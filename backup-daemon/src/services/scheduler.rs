use backup_engine::config::normalize_cron;
use backup_engine::{Engine, EngineError};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Identity recorded for scheduler-initiated backups.
pub const SCHEDULED: &str = "scheduled";

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    engine: Arc<Engine>,
}

impl BackupScheduler {
    pub async fn new(engine: Arc<Engine>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            engine,
        })
    }

    pub async fn schedule(&self, cron_expression: &str) -> anyhow::Result<()> {
        let expr = normalize_cron(cron_expression);
        let engine = self.engine.clone();

        let job = Job::new_async(expr.as_str(), move |_uuid, _lock| {
            let engine = engine.clone();
            Box::pin(async move {
                tracing::info!("Starting scheduled backup");
                match engine.run_backup(SCHEDULED).await {
                    Ok(result) => {
                        tracing::info!(backup = %result.name, "Scheduled backup finished")
                    }
                    Err(e @ EngineError::Concurrency { .. }) => {
                        tracing::warn!(error = %e, "Skipping scheduled backup")
                    }
                    Err(e) => tracing::error!(error = %e, "Scheduled backup failed"),
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %expr, "Backup scheduled");
        Ok(())
    }

    pub async fn init_schedules(&self, expressions: &[String]) -> anyhow::Result<usize> {
        let mut count = 0;
        for expr in expressions {
            if let Err(e) = self.schedule(expr).await {
                tracing::error!(cron = %expr, error = %e, "Failed to schedule backup");
            } else {
                count += 1;
            }
        }
        tracing::info!(count, "Cron schedules initialized");
        Ok(count)
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::app_state;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_invalid_expressions_are_skipped() {
        let dir = TempDir::new().unwrap();
        let state = app_state(&dir);
        let scheduler = BackupScheduler::new(state.engine.clone()).await.unwrap();

        let count = scheduler
            .init_schedules(&["*/5 * * * *".to_string(), "not a cron".to_string()])
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
