//! Readiness waiters: bounded polling with a caller-supplied deadline.
//!
//! All three primitives share the same contract: they never block past
//! the deadline, never panic, and report failure as `LabError::Timeout`
//! so callers can distinguish "slow" from "broken". Cancellation is
//! expressed purely as the timeout; there is no external cancel token.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::LabError;

const DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const PORT_RETRY_SLEEP: Duration = Duration::from_millis(200);
const LOG_POLL_SLEEP: Duration = Duration::from_millis(200);

/// Executes the remote readiness query; injectable so tests can script
/// responses without an SSH stack.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str) -> Result<String, LabError>;
}

/// Retry bounded-duration connect attempts until one succeeds.
pub async fn wait_for_port(host: &str, port: u16, timeout: Duration) -> Result<(), LabError> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Ok(Ok(_)) =
            tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((host, port))).await
        {
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(LabError::Timeout {
                what: format!("port {host}:{port}"),
                secs: timeout.as_secs(),
            });
        }
        tokio::time::sleep(PORT_RETRY_SLEEP).await;
    }
}

/// Follow a log file from its current end until a line contains
/// `marker` (case-insensitive substring). Tolerates the file not
/// existing yet and being recreated or truncated mid-wait; a shrinking
/// file reopens from the start.
pub async fn wait_for_log_marker(
    path: &Path,
    marker: &str,
    timeout: Duration,
) -> Result<(), LabError> {
    let needle = marker.to_lowercase();
    let deadline = tokio::time::Instant::now() + timeout;

    let mut pos = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let mut partial = String::new();

    loop {
        if let Ok(mut file) = std::fs::File::open(path) {
            let len = file.metadata().map(|m| m.len()).unwrap_or(0);
            if len < pos {
                // Recreated or truncated: start over.
                pos = 0;
                partial.clear();
            }
            if len > pos && file.seek(SeekFrom::Start(pos)).is_ok() {
                let mut bytes = Vec::new();
                if file.read_to_end(&mut bytes).is_ok() {
                    pos = len;
                    partial.push_str(&String::from_utf8_lossy(&bytes));
                }
            }

            while let Some(i) = partial.find('\n') {
                let line: String = partial.drain(..=i).collect();
                if line.to_lowercase().contains(&needle) {
                    return Ok(());
                }
            }
            // A marker on a still-unterminated final line counts too.
            if partial.to_lowercase().contains(&needle) {
                return Ok(());
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(LabError::Timeout {
                what: format!("'{marker}' in {}", path.display()),
                secs: timeout.as_secs(),
            });
        }
        tokio::time::sleep(LOG_POLL_SLEEP).await;
    }
}

/// Re-run a fixed remote status query until its output contains
/// `ready_marker`. Individual failures (connection refused while the
/// guest is still booting, non-zero exits) are expected and only logged
/// at debug level; the sole reportable failure is the deadline.
pub async fn wait_for_remote_ready(
    runner: &dyn CommandRunner,
    command: &str,
    ready_marker: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<(), LabError> {
    let needle = ready_marker.to_lowercase();
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match runner.run(command) {
            Ok(output) if output.to_lowercase().contains(&needle) => return Ok(()),
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "remote readiness poll failed"),
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(LabError::Timeout {
                what: format!("remote readiness ({command})"),
                secs: timeout.as_secs(),
            });
        }
        tokio::time::sleep(interval).await;
    }
}
