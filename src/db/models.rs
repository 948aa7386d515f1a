// Scan entity and related row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Pulling,
    Scanning,
    Parsing,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Pulling => "pulling",
            ScanStatus::Scanning => "scanning",
            ScanStatus::Parsing => "parsing",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    /// Progress percentage per the fixed mapping in the status-poll contract.
    pub fn progress_percent(self) -> u8 {
        match self {
            ScanStatus::Pending => 0,
            ScanStatus::Pulling => 20,
            ScanStatus::Scanning => 50,
            ScanStatus::Parsing => 80,
            ScanStatus::Completed => 100,
            ScanStatus::Failed => 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Compliant,
    NonCompliant,
    PendingReview,
}

/// The central scan entity. Mutated only by the claimer (once, at claim)
/// and by the worker that owns it; immutable once terminal.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Scan {
    pub id: Uuid,
    pub registry: String,
    pub image_name: String,
    pub image_tag: String,
    pub image_digest: Option<String>,
    pub status: ScanStatus,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub retry_count: i32,
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing)]
    pub raw_report: Option<serde_json::Value>,
    pub critical_count: i32,
    pub high_count: i32,
    pub medium_count: i32,
    pub low_count: i32,
    pub unknown_count: i32,
    pub total_vulnerabilities: i32,
    pub fixable_count: i32,
    pub unfixable_count: i32,
    pub risk_score: i32,
    pub max_cvss_score: Option<f64>,
    pub avg_cvss_score: Option<f64>,
    pub is_compliant: bool,
    pub compliance_status: Option<ComplianceStatus>,
    pub scan_duration: Option<f64>,
    pub pull_duration: Option<f64>,
    pub analysis_duration: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub worker_id: Option<String>,
    pub trivy_version: Option<String>,
}

impl Scan {
    /// Attach the raw report only when the caller has opted in — the
    /// default fetch-by-id response excludes the large payload.
    pub fn without_raw_report(mut self) -> Self {
        self.raw_report = None;
        self
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct VulnerabilityDetail {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub vulnerability_id: String,
    pub package_name: String,
    pub package_version: String,
    pub fixed_version: Option<String>,
    pub severity: String,
    pub cvss_score: Option<f64>,
    pub is_fixable: bool,
    pub published_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub previous_status: Option<ScanStatus>,
    pub new_status: ScanStatus,
    pub message: Option<String>,
    pub structured_context: Option<serde_json::Value>,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

/// Immutable triple that identifies what is being scanned.
#[derive(Debug, Clone)]
pub struct ImageRef {
    pub registry: String,
    pub image_name: String,
    pub image_tag: String,
}

impl ImageRef {
    pub fn reference(&self) -> String {
        format!("{}/{}:{}", self.registry, self.image_name, self.image_tag)
    }
}
