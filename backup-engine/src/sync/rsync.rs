//! rsync-backed sync port.

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FileSyncPort, SyncRequest, SyncStats};
use crate::utils::errors::{EngineError, Result};

/// rsync exit code for "some source files vanished before they could be transferred"
const EXIT_VANISHED: i32 = 24;

/// Grace period between SIGTERM and SIGKILL for a cancelled transfer
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

pub struct RsyncSync {
    binary: PathBuf,
}

impl RsyncSync {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// First line of `rsync --version`, or an error when the binary is unusable.
    pub async fn probe(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                EngineError::Precondition(format!("rsync not available at {}: {e}", self.binary.display()))
            })?;
        if !output.status.success() {
            return Err(EngineError::Precondition(format!(
                "{} --version exited with {}",
                self.binary.display(),
                output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    }

    fn build_args(request: &SyncRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-aAX".into(), "--delete".into(), "--stats".into()];
        if let Some(base) = request.reference_base.as_deref().filter(|b| b.is_dir()) {
            let mut link = OsString::from("--link-dest=");
            link.push(absolute(base));
            args.push(link);
        }
        args.push(with_trailing_slash(&request.source));
        args.push(with_trailing_slash(&request.destination));
        args
    }
}

#[async_trait]
impl FileSyncPort for RsyncSync {
    fn name(&self) -> &'static str {
        "rsync"
    }

    async fn sync(&self, request: &SyncRequest, cancel: &CancellationToken) -> Result<SyncStats> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if !request.source.is_dir() {
            return Err(EngineError::Transfer(format!(
                "source {} is not a directory",
                request.source.display()
            )));
        }
        tokio::fs::create_dir_all(&request.destination).await?;

        let args = Self::build_args(request);
        debug!(binary = %self.binary.display(), ?args, "Spawning rsync");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Transfer(format!("failed to spawn rsync: {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_all(stdout));
        let stderr_task = tokio::spawn(read_all(stderr));

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                warn!(source = %request.source.display(), "Cancelling rsync transfer");
                terminate(&mut child).await;
                return Err(EngineError::Cancelled);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        match status.code() {
            Some(0) => {}
            Some(EXIT_VANISHED) => {
                warn!(
                    source = %request.source.display(),
                    "Some files vanished during transfer (rsync exit 24)"
                );
            }
            code => {
                let detail = stderr.lines().rev().take(5).collect::<Vec<_>>();
                let detail = detail.into_iter().rev().collect::<Vec<_>>().join(" | ");
                return Err(EngineError::Transfer(format!(
                    "rsync exited with {}: {detail}",
                    code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string())
                )));
            }
        }

        let stats = parse_stats(&stdout);
        info!(
            source = %request.source.display(),
            destination = %request.destination.display(),
            files = stats.files_total,
            transferred = stats.files_transferred,
            bytes = stats.bytes_total,
            bytes_transferred = stats.bytes_transferred,
            "rsync completed"
        );
        Ok(stats)
    }
}

async fn read_all<R>(reader: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = String::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_string(&mut buf).await;
    }
    buf
}

/// SIGTERM, then SIGKILL if the child outlives the grace period.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed");
        }
    }
    if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
        warn!("rsync ignored SIGTERM, killing");
        let _ = child.kill().await;
    }
}

/// Extract counters from `rsync --stats` output.
pub fn parse_stats(output: &str) -> SyncStats {
    let mut stats = SyncStats::default();
    let mut created = None;
    let mut regular_transferred = None;

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        match key.trim() {
            "Number of files" => {
                // "1,234 (reg: 1,000, dir: 234)"; prefer the regular file count
                stats.files_total = value
                    .split_once("reg:")
                    .and_then(|(_, rest)| leading_number(rest))
                    .or_else(|| leading_number(value))
                    .unwrap_or(0);
            }
            "Number of created files" => created = leading_number(value),
            "Number of regular files transferred" => regular_transferred = leading_number(value),
            "Total file size" => stats.bytes_total = leading_number(value).unwrap_or(0),
            "Total transferred file size" => {
                stats.bytes_transferred = leading_number(value).unwrap_or(0)
            }
            _ => {}
        }
    }

    stats.files_transferred = regular_transferred.or(created).unwrap_or(0);
    stats
}

fn leading_number(text: &str) -> Option<u64> {
    let digits: String = text
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(|c| *c != ',')
        .collect();
    digits.parse().ok()
}

fn with_trailing_slash(path: &Path) -> OsString {
    let mut s = path.as_os_str().to_os_string();
    if !path.as_os_str().to_string_lossy().ends_with('/') {
        s.push("/");
    }
    s
}

/// rsync resolves `--link-dest` relative to the destination, so pass it absolute.
fn absolute(path: &Path) -> OsString {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .into_os_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STATS: &str = "
Number of files: 1,234 (reg: 1,000, dir: 234)
Number of created files: 12 (reg: 10, dir: 2)
Number of deleted files: 0
Number of regular files transferred: 7
Total file size: 1,048,576 bytes
Total transferred file size: 4,096 bytes
Literal data: 4,096 bytes
";

    #[test]
    fn test_parse_stats() {
        let stats = parse_stats(STATS);
        assert_eq!(stats.files_total, 1000);
        assert_eq!(stats.files_transferred, 7);
        assert_eq!(stats.bytes_total, 1_048_576);
        assert_eq!(stats.bytes_transferred, 4096);
    }

    #[test]
    fn test_parse_stats_falls_back_to_created_count() {
        let stats = parse_stats("Number of files: 3\nNumber of created files: 2\n");
        assert_eq!(stats.files_total, 3);
        assert_eq!(stats.files_transferred, 2);
        assert_eq!(stats.bytes_total, 0);
    }

    #[test]
    fn test_args_include_link_dest_only_when_base_exists() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base");
        std::fs::create_dir(&base).unwrap();

        let without = RsyncSync::build_args(&SyncRequest::new("/live/world", "/backups/x/world"));
        assert!(!without.iter().any(|a| a.to_string_lossy().starts_with("--link-dest")));
        assert_eq!(without[without.len() - 2], OsString::from("/live/world/"));

        let with = RsyncSync::build_args(
            &SyncRequest::new("/live/world", "/backups/x/world").with_reference(Some(base)),
        );
        assert!(with.iter().any(|a| a.to_string_lossy().starts_with("--link-dest=/")));

        let missing = RsyncSync::build_args(
            &SyncRequest::new("/live/world", "/backups/x/world")
                .with_reference(Some(dir.path().join("gone"))),
        );
        assert!(!missing.iter().any(|a| a.to_string_lossy().starts_with("--link-dest")));
    }

    #[tokio::test]
    async fn test_sync_with_real_rsync_when_installed() {
        let rsync = RsyncSync::new("rsync");
        if rsync.probe().await.is_err() {
            return;
        }

        let dir = TempDir::new().unwrap();
        let source = dir.path().join("live");
        std::fs::create_dir_all(source.join("region")).unwrap();
        std::fs::write(source.join("level.dat"), b"level").unwrap();
        std::fs::write(source.join("region/r.0.0.mca"), b"chunks").unwrap();

        let dest = dir.path().join("backup");
        let stats = rsync
            .sync(&SyncRequest::new(&source, &dest), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.files_total, 2);
        assert_eq!(std::fs::read(dest.join("region/r.0.0.mca")).unwrap(), b"chunks");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let result = RsyncSync::new("rsync")
            .sync(&SyncRequest::new(dir.path(), dir.path().join("out")), &token)
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
