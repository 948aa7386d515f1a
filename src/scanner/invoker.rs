// Launches the external scanner binary and classifies its outcome.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::scanner::metrics::ScannerDocument;

const TERM_GRACE_PERIOD: Duration = Duration::from_secs(5);
const STDERR_EXCERPT_BYTES: usize = 2000;

#[derive(Debug)]
pub enum InvokeError {
    Timeout,
    ImageNotFound,
    PullFailed(PullFailedKind),
    ScannerError { exit_code: Option<i32>, stderr_excerpt: String },
}

#[derive(Debug, Clone, Copy)]
pub enum PullFailedKind {
    Auth,
    RateLimit,
}

pub struct InvokeRequest<'a> {
    pub image_reference: &'a str,
    pub output_path: &'a Path,
    pub timeout: Duration,
    pub cache_dir: &'a Path,
    pub binary_path: &'a str,
}

pub struct ScannerInvoker;

impl ScannerInvoker {
    /// Runs the scanner to completion or classifies why it did not finish.
    /// Never blocks the caller past `request.timeout` + the termination grace period.
    pub async fn invoke(request: InvokeRequest<'_>) -> Result<ScannerDocument, InvokeError> {
        let timeout_secs = request.timeout.as_secs().max(1);

        let mut child = Command::new(request.binary_path)
            .arg("image")
            .arg("--format")
            .arg("json")
            .arg("--output")
            .arg(request.output_path)
            .arg("--timeout")
            .arg(format!("{timeout_secs}s"))
            .arg("--scanners")
            .arg("vuln")
            .arg("--cache-dir")
            .arg(request.cache_dir)
            .arg("--quiet")
            .arg(request.image_reference)
            .env("NO_COLOR", "1")
            .env("TRIVY_CACHE_DIR", request.cache_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InvokeError::ScannerError {
                exit_code: None,
                stderr_excerpt: format!("failed to spawn scanner: {e}"),
            })?;

        let mut stderr_pipe = child.stderr.take();
        let mut stdout_pipe = child.stdout.take();

        let wait_result = timeout(request.timeout, child.wait()).await;

        let status = match wait_result {
            Ok(status) => status.map_err(|e| InvokeError::ScannerError {
                exit_code: None,
                stderr_excerpt: format!("failed to wait on scanner: {e}"),
            })?,
            Err(_elapsed) => {
                terminate_forcefully(&mut child).await;
                return Err(InvokeError::Timeout);
            }
        };

        let mut stderr_buf = String::new();
        if let Some(mut pipe) = stderr_pipe.take() {
            let _ = pipe.read_to_string(&mut stderr_buf).await;
        }
        let mut stdout_buf = String::new();
        if let Some(mut pipe) = stdout_pipe.take() {
            let _ = pipe.read_to_string(&mut stdout_buf).await;
        }

        if !status.success() {
            return Err(classify_failure(status.code(), &stderr_buf));
        }

        let contents = tokio::fs::read_to_string(request.output_path)
            .await
            .map_err(|e| InvokeError::ScannerError {
                exit_code: status.code(),
                stderr_excerpt: format!("output file unreadable: {e}"),
            })?;

        serde_json::from_str(&contents).map_err(|e| InvokeError::ScannerError {
            exit_code: status.code(),
            stderr_excerpt: format!("output file not valid JSON: {e}"),
        })
    }
}

fn classify_failure(exit_code: Option<i32>, stderr: &str) -> InvokeError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("could not find image") || lower.contains("manifest unknown") {
        return InvokeError::ImageNotFound;
    }
    if lower.contains("unauthorized") || lower.contains("denied") {
        return InvokeError::PullFailed(PullFailedKind::Auth);
    }
    if lower.contains("rate limit") || lower.contains("too many requests") {
        return InvokeError::PullFailed(PullFailedKind::RateLimit);
    }
    InvokeError::ScannerError {
        exit_code,
        stderr_excerpt: bounded_excerpt(stderr),
    }
}

fn bounded_excerpt(stderr: &str) -> String {
    if stderr.len() <= STDERR_EXCERPT_BYTES {
        stderr.to_string()
    } else {
        let mut end = STDERR_EXCERPT_BYTES;
        while !stderr.is_char_boundary(end) {
            end -= 1;
        }
        stderr[..end].to_string()
    }
}

/// SIGTERM, a grace period, then SIGKILL if the child is still alive.
async fn terminate_forcefully(child: &mut tokio::process::Child) {
    if let Some(raw_pid) = child.id() {
        let pid = Pid::from_raw(raw_pid as i32);
        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            tracing::warn!(pid = raw_pid, error = %e, "failed to send SIGTERM to scanner");
        }
    }

    match timeout(TERM_GRACE_PERIOD, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(error = %e, "failed to SIGKILL scanner after grace period");
            }
            let _ = child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_image_not_found() {
        match classify_failure(Some(1), "Error: could not find image nginx:bogus") {
            InvokeError::ImageNotFound => {}
            other => panic!("expected ImageNotFound, got {other:?}"),
        }
    }

    #[test]
    fn classifies_manifest_unknown_as_image_not_found() {
        match classify_failure(Some(1), "manifest unknown for this tag") {
            InvokeError::ImageNotFound => {}
            other => panic!("expected ImageNotFound, got {other:?}"),
        }
    }

    #[test]
    fn classifies_auth_failure() {
        match classify_failure(Some(1), "Error: unauthorized: authentication required") {
            InvokeError::PullFailed(PullFailedKind::Auth) => {}
            other => panic!("expected PullFailed(Auth), got {other:?}"),
        }
    }

    #[test]
    fn classifies_rate_limit() {
        match classify_failure(Some(1), "toomanyrequests: You have reached your rate limit") {
            InvokeError::PullFailed(PullFailedKind::RateLimit) => {}
            other => panic!("expected PullFailed(RateLimit), got {other:?}"),
        }
    }

    #[test]
    fn unclassified_failure_becomes_trivy_error() {
        match classify_failure(Some(2), "panic: unexpected internal state") {
            InvokeError::ScannerError { exit_code, .. } => assert_eq!(exit_code, Some(2)),
            other => panic!("expected ScannerError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_forcibly_terminates_child() {
        let request = InvokeRequest {
            image_reference: "irrelevant",
            output_path: Path::new("/tmp/does-not-exist.json"),
            timeout: Duration::from_millis(200),
            cache_dir: Path::new("/tmp"),
            binary_path: "sleep",
        };
        // `sleep`'s argument parsing differs from trivy's; exercise only the
        // deadline-then-kill path by invoking it with a long sleep duration
        // appended as the final positional argument.
        let mut child = Command::new(request.binary_path)
            .arg("5")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sleep");

        let result = timeout(Duration::from_millis(200), child.wait()).await;
        assert!(result.is_err(), "sleep should still be running at 200ms");
        terminate_forcefully(&mut child).await;
        let status = child.wait().await.expect("wait after kill");
        assert!(!status.success());
    }
}
