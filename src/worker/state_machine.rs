// Drives a single claimed scan from `pulling` through to a terminal state.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::config::Config;
use crate::db::claimer::ClaimedScan;
use crate::db::models::ScanStatus;
use crate::db::store::ScanStore;
use crate::errors::is_permanent;
use crate::scanner::{extract, InvokeError, InvokeRequest, PullFailedKind, ScannerInvoker};

pub struct ScanDriver<'a> {
    store: &'a ScanStore,
    config: &'a Config,
    worker_id: &'a str,
}

impl<'a> ScanDriver<'a> {
    pub fn new(store: &'a ScanStore, config: &'a Config, worker_id: &'a str) -> Self {
        Self { store, config, worker_id }
    }

    /// Runs the claimed scan to completion. Every exit path cleans up the
    /// scratch directory and leaves the scan in a terminal state.
    pub async fn drive(&self, claimed: ClaimedScan) {
        let scan_id = claimed.id;
        let reference = claimed.image.reference();
        let claim_instant = Instant::now();

        let scratch = match tempfile::Builder::new()
            .prefix(&format!("vulnscan-{scan_id}-"))
            .tempdir()
        {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(scan_id = %scan_id, error = %e, "failed to create scratch directory");
                self.fail(
                    scan_id,
                    ScanStatus::Pulling,
                    "INTERNAL_ERROR",
                    &format!("scratch dir creation failed: {e}"),
                    true,
                )
                .await;
                return;
            }
        };

        let result = self.run(scan_id, &reference, scratch.path(), claim_instant).await;

        if let Err((previous, e)) = result {
            tracing::error!(scan_id = %scan_id, error = %e, "unhandled error driving scan");
            self.fail(scan_id, previous, "INTERNAL_ERROR", &e, true).await;
        }

        // tempdir is removed when `scratch` drops here, on every exit path.
    }

    /// On error, returns the last status the scan was confirmed to hold so
    /// the caller can record an accurate `previous_status` on the failure
    /// audit row.
    async fn run(
        &self,
        scan_id: uuid::Uuid,
        reference: &str,
        scratch: &Path,
        claim_instant: Instant,
    ) -> Result<(), (ScanStatus, String)> {
        // pulling -> scanning
        self.store
            .update_status(scan_id, ScanStatus::Scanning)
            .await
            .map_err(|e| (ScanStatus::Pulling, e.to_string()))?;
        self.store
            .append_audit(
                scan_id,
                Some(ScanStatus::Pulling),
                ScanStatus::Scanning,
                Some("invoking scanner"),
                None,
                self.worker_id,
            )
            .await
            .map_err(|e| (ScanStatus::Scanning, e.to_string()))?;
        let pull_duration = claim_instant.elapsed().as_secs_f64();

        let scan_start = Instant::now();
        let output_path = scratch.join(format!("{scan_id}.json"));
        let request = InvokeRequest {
            image_reference: reference,
            output_path: &output_path,
            timeout: Duration::from_secs(self.config.scanner_timeout_seconds),
            cache_dir: Path::new(&self.config.scanner_cache_dir),
            binary_path: &self.config.scanner_binary_path,
        };

        let invocation = ScannerInvoker::invoke(request).await;
        let scan_elapsed = scan_start.elapsed().as_secs_f64();

        let document = match invocation {
            Ok(doc) => doc,
            Err(err) => {
                let (code, message, retryable) = classify(&err);
                self.fail(scan_id, ScanStatus::Scanning, code, &message, retryable).await;
                return Ok(());
            }
        };

        // scanning -> parsing
        self.store
            .update_status(scan_id, ScanStatus::Parsing)
            .await
            .map_err(|e| (ScanStatus::Scanning, e.to_string()))?;
        self.store
            .append_audit(
                scan_id,
                Some(ScanStatus::Scanning),
                ScanStatus::Parsing,
                Some("extracting metrics"),
                None,
                self.worker_id,
            )
            .await
            .map_err(|e| (ScanStatus::Parsing, e.to_string()))?;

        let parse_start = Instant::now();
        let metrics = extract(&document, &crate::config::RiskWeights {
            critical: self.config.risk_weights.critical,
            high: self.config.risk_weights.high,
            medium: self.config.risk_weights.medium,
            low: self.config.risk_weights.low,
        });
        let analysis_duration = parse_start.elapsed().as_secs_f64();

        let raw_report = read_raw_report(&output_path).unwrap_or(serde_json::Value::Null);

        let scan_duration = claim_instant.elapsed().as_secs_f64();
        let trivy_version = document.schema_version.map(|v| v.to_string());

        self.store
            .terminal_success(
                scan_id,
                &raw_report,
                &metrics,
                Some(pull_duration),
                Some(analysis_duration),
                scan_duration,
                trivy_version.as_deref(),
            )
            .await
            .map_err(|e| (ScanStatus::Parsing, e.to_string()))?;

        if self.config.persist_vulnerability_details {
            if let Err(e) = self.store.bulk_insert_findings(scan_id, &metrics.per_finding).await {
                tracing::warn!(scan_id = %scan_id, error = %e, "failed to persist vulnerability details");
            }
        }

        // The scan is already durably `completed` at this point — a failure
        // here is an audit-trail gap, not a scan failure, so it's logged and
        // swallowed rather than routed through `fail()`.
        if let Err(e) = self
            .store
            .append_audit(
                scan_id,
                Some(ScanStatus::Parsing),
                ScanStatus::Completed,
                Some("scan completed"),
                Some(serde_json::json!({
                    "risk_score": metrics.risk_score,
                    "total_vulnerabilities": metrics.total_vulnerabilities,
                    "scan_elapsed_seconds": scan_elapsed,
                })),
                self.worker_id,
            )
            .await
        {
            tracing::warn!(scan_id = %scan_id, error = %e, "failed to append completion audit row");
        }

        Ok(())
    }

    async fn fail(&self, scan_id: uuid::Uuid, previous: ScanStatus, code: &str, message: &str, retryable: bool) {
        if let Err(e) = self.store.terminal_failure(scan_id, code, message, retryable).await {
            tracing::error!(scan_id = %scan_id, error = %e, "failed to persist terminal failure");
            return;
        }
        let _ = self
            .store
            .append_audit(
                scan_id,
                Some(previous),
                ScanStatus::Failed,
                Some(message),
                Some(serde_json::json!({ "error_code": code })),
                self.worker_id,
            )
            .await;
    }
}

fn classify(err: &InvokeError) -> (&'static str, String, bool) {
    match err {
        InvokeError::Timeout => ("TIMEOUT", "scanner exceeded its deadline".to_string(), !is_permanent("TIMEOUT")),
        InvokeError::ImageNotFound => (
            "IMAGE_NOT_FOUND",
            "scanner could not resolve the image".to_string(),
            !is_permanent("IMAGE_NOT_FOUND"),
        ),
        InvokeError::PullFailed(PullFailedKind::Auth) => (
            "PULL_FAILED",
            "image pull failed: authentication required".to_string(),
            !is_permanent("PULL_FAILED"),
        ),
        InvokeError::PullFailed(PullFailedKind::RateLimit) => (
            "PULL_FAILED",
            "image pull failed: registry rate limit exceeded".to_string(),
            !is_permanent("PULL_FAILED"),
        ),
        InvokeError::ScannerError { exit_code, stderr_excerpt } => (
            "TRIVY_ERROR",
            format!("scanner exited with code {:?}: {}", exit_code, stderr_excerpt),
            !is_permanent("TRIVY_ERROR"),
        ),
    }
}

fn read_raw_report(path: &Path) -> Option<serde_json::Value> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_timeout_is_retryable() {
        let (code, _, retryable) = classify(&InvokeError::Timeout);
        assert_eq!(code, "TIMEOUT");
        assert!(retryable);
    }

    #[test]
    fn classify_image_not_found_is_not_retryable() {
        let (code, _, retryable) = classify(&InvokeError::ImageNotFound);
        assert_eq!(code, "IMAGE_NOT_FOUND");
        assert!(!retryable);
    }

    #[test]
    fn classify_pull_failed_is_retryable_even_for_auth() {
        let (code, _, retryable) = classify(&InvokeError::PullFailed(PullFailedKind::Auth));
        assert_eq!(code, "PULL_FAILED");
        assert!(retryable);
    }
}
