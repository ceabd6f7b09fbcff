//! One-shot CLI subcommands.

use crate::config;
use anyhow::Context;
use backup_engine::audit::{AuditAction, AuditFilter, AuditLevel, JsonlAuditLog};
use backup_engine::catalog::BackupInfo;
use backup_engine::utils::format::format_bytes;
use backup_engine::Engine;
use clap::Subcommand;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Command {
    /// Run the scheduler, storage watch and HTTP API until SIGINT/SIGTERM
    Run,
    /// Take a backup now
    Backup,
    /// Replace the live world with a backup (a pre-restore snapshot is kept)
    Restore { name: String },
    /// Restore a pre-restore snapshot
    Rollback { snapshot: String },
    /// List backups, or snapshots with --snapshots
    List {
        #[arg(long)]
        snapshots: bool,
        /// Measure on-disk sizes (walks every backup)
        #[arg(long)]
        sizes: bool,
    },
    /// Check a backup against its checksum set
    Verify { name: String },
    /// Compare the checksum sets of two backups
    Diff { from: String, to: String },
    /// Delete a backup
    Delete { name: String },
    /// Delete a pre-restore snapshot
    DeleteSnapshot { name: String },
    /// Delete backups older than the retention window
    Cleanup,
    /// Restart the game server
    Restart,
    /// Server, storage and retention overview
    Status,
    /// Query the audit log, newest first
    Logs {
        /// e.g. BACKUP_COMPLETED
        #[arg(long)]
        action: Option<String>,
        #[arg(long)]
        triggered_by: Option<String>,
        /// info, warn or error
        #[arg(long)]
        level: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Validate the configuration file and list every problem
    CheckConfig,
}

impl Command {
    /// Commands that write to the backup root or drive the server.
    pub fn mutates(&self) -> bool {
        matches!(
            self,
            Command::Run
                | Command::Backup
                | Command::Restore { .. }
                | Command::Rollback { .. }
                | Command::Delete { .. }
                | Command::DeleteSnapshot { .. }
                | Command::Cleanup
                | Command::Restart
        )
    }
}

/// Identity recorded in the audit log for CLI invocations.
pub fn operator() -> String {
    match std::env::var("USER") {
        Ok(user) if !user.is_empty() => format!("cli:{user}"),
        _ => "cli".to_string(),
    }
}

pub fn check_config(path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config::resolve_path(path);
    let violations = config::check(&path)?;
    if violations.is_empty() {
        println!("{}: OK", path.display());
        return Ok(());
    }
    for violation in &violations {
        println!("  - {violation}");
    }
    anyhow::bail!("{} has {} problem(s)", path.display(), violations.len())
}

pub async fn execute(command: Command, engine: &Engine, audit: &JsonlAuditLog) -> anyhow::Result<()> {
    let operator = operator();
    match command {
        Command::Backup => {
            let result = interruptible(engine, engine.run_backup(&operator)).await?;
            print_json(&result)
        }
        Command::Restore { name } => {
            let result = interruptible(engine, engine.run_restore(&name, &operator)).await?;
            print_json(&result)
        }
        Command::Rollback { snapshot } => {
            let result = interruptible(engine, engine.rollback(&snapshot, &operator)).await?;
            print_json(&result)
        }
        Command::List { snapshots, sizes } => {
            let entries = if snapshots {
                engine.list_snapshots(sizes).await?
            } else {
                engine.list_backups(sizes).await?
            };
            print_listing(&entries, engine.catalog().latest().as_deref());
            Ok(())
        }
        Command::Verify { name } => {
            let report = engine.verify(&name).await?;
            print_json(&report)?;
            if !report.valid {
                anyhow::bail!("{name} failed verification");
            }
            Ok(())
        }
        Command::Diff { from, to } => print_json(&engine.diff(&from, &to).await?),
        Command::Delete { name } => {
            let bytes = engine.delete_backup(&name, &operator).await?;
            println!("Deleted {name} ({})", format_bytes(bytes));
            Ok(())
        }
        Command::DeleteSnapshot { name } => {
            let bytes = engine.delete_snapshot(&name, &operator).await?;
            println!("Deleted {name} ({})", format_bytes(bytes));
            Ok(())
        }
        Command::Cleanup => print_json(&engine.cleanup(&operator).await?),
        Command::Restart => {
            engine.restart_server(&operator).await?;
            println!("Server restarted");
            Ok(())
        }
        Command::Status => print_json(&engine.status().await?),
        Command::Logs {
            action,
            triggered_by,
            level,
            limit,
        } => {
            let filter = AuditFilter {
                action: action
                    .map(|a| parse_label::<AuditAction>(&a.to_uppercase()))
                    .transpose()?,
                triggered_by,
                level: level
                    .map(|l| parse_label::<AuditLevel>(&l.to_lowercase()))
                    .transpose()?,
                since: None,
            };
            for event in audit.query(&filter, limit)? {
                println!("{}", serde_json::to_string(&event)?);
            }
            Ok(())
        }
        Command::Run | Command::CheckConfig => anyhow::bail!("not a one-shot command"),
    }
}

/// Drive a job to completion; Ctrl-C cancels it and waits for it to unwind.
async fn interruptible<T, F>(engine: &Engine, job: F) -> backup_engine::Result<T>
where
    F: Future<Output = backup_engine::Result<T>>,
{
    tokio::pin!(job);
    tokio::select! {
        result = &mut job => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling job");
            if let Err(e) = engine.cancel(&operator()) {
                tracing::debug!("Nothing to cancel: {}", e);
            }
            job.await
        }
    }
}

fn parse_label<T: DeserializeOwned>(label: &str) -> anyhow::Result<T> {
    serde_json::from_value(Value::String(label.to_string()))
        .with_context(|| format!("Unknown value '{label}'"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_listing(entries: &[BackupInfo], latest: Option<&str>) {
    if entries.is_empty() {
        println!("No entries");
        return;
    }
    for info in entries {
        let size = info.size.map(format_bytes).unwrap_or_default();
        let marker = if latest == Some(info.name.as_str()) { " (latest)" } else { "" };
        println!(
            "{:<32} {}  {:>12}{marker}",
            info.name,
            info.created.format("%Y-%m-%d %H:%M:%S UTC"),
            size
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutating_commands() {
        assert!(Command::Backup.mutates());
        assert!(Command::Restore { name: "x".to_string() }.mutates());
        assert!(!Command::Status.mutates());
        assert!(!Command::Verify { name: "x".to_string() }.mutates());
        assert!(!Command::CheckConfig.mutates());
    }

    #[test]
    fn test_parse_label() {
        let action: AuditAction = parse_label("BACKUP_COMPLETED").unwrap();
        assert_eq!(action, AuditAction::BackupCompleted);
        let level: AuditLevel = parse_label("warn").unwrap();
        assert_eq!(level, AuditLevel::Warn);
        assert!(parse_label::<AuditAction>("NOPE").is_err());
    }
}
