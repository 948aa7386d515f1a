// Durable state for scan entities: create, fetch, status transitions,
// cascading delete, and analytical queries.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::models::{AuditLogEntry, ComplianceStatus, Scan, ScanStatus, VulnerabilityDetail};
use crate::scanner::metrics::FindingRow;

const IN_PROGRESS_STATUSES: &[&str] = &["pending", "pulling", "scanning", "parsing"];

fn row_to_scan(row: PgRow) -> Result<Scan, sqlx::Error> {
    Ok(Scan {
        id: row.try_get("id")?,
        registry: row.try_get("registry")?,
        image_name: row.try_get("image_name")?,
        image_tag: row.try_get("image_tag")?,
        image_digest: row.try_get("image_digest")?,
        status: row.try_get("status")?,
        error_message: row.try_get("error_message")?,
        error_code: row.try_get("error_code")?,
        retry_count: row.try_get("retry_count")?,
        idempotency_key: row.try_get("idempotency_key")?,
        raw_report: row.try_get("raw_report")?,
        critical_count: row.try_get("critical_count")?,
        high_count: row.try_get("high_count")?,
        medium_count: row.try_get("medium_count")?,
        low_count: row.try_get("low_count")?,
        unknown_count: row.try_get("unknown_count")?,
        total_vulnerabilities: row.try_get("total_vulnerabilities")?,
        fixable_count: row.try_get("fixable_count")?,
        unfixable_count: row.try_get("unfixable_count")?,
        risk_score: row.try_get("risk_score")?,
        max_cvss_score: row.try_get("max_cvss_score")?,
        avg_cvss_score: row.try_get("avg_cvss_score")?,
        is_compliant: row.try_get("is_compliant")?,
        compliance_status: row.try_get("compliance_status")?,
        scan_duration: row.try_get("scan_duration")?,
        pull_duration: row.try_get("pull_duration")?,
        analysis_duration: row.try_get("analysis_duration")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
        worker_id: row.try_get("worker_id")?,
        trivy_version: row.try_get("trivy_version")?,
    })
}

fn row_to_vuln_detail(row: PgRow) -> Result<VulnerabilityDetail, sqlx::Error> {
    Ok(VulnerabilityDetail {
        id: row.try_get("id")?,
        scan_id: row.try_get("scan_id")?,
        vulnerability_id: row.try_get("vulnerability_id")?,
        package_name: row.try_get("package_name")?,
        package_version: row.try_get("package_version")?,
        fixed_version: row.try_get("fixed_version")?,
        severity: row.try_get("severity")?,
        cvss_score: row.try_get("cvss_score")?,
        is_fixable: row.try_get("is_fixable")?,
        published_date: row.try_get("published_date")?,
    })
}

#[derive(Debug, Default)]
pub struct ListFilters {
    pub status: Option<ScanStatus>,
    pub image_name_contains: Option<String>,
    pub compliant_only: Option<bool>,
}

#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Debug, Default)]
pub struct ComplianceSummary {
    pub total_scans: i64,
    pub compliant_count: i64,
    pub non_compliant_count: i64,
    pub pending_review_count: i64,
    pub avg_risk_score: f64,
}

#[derive(Clone)]
pub struct ScanStore {
    pool: PgPool,
}

impl ScanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn create(
        &self,
        registry: &str,
        image_name: &str,
        image_tag: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Scan, sqlx::Error> {
        let row = sqlx::query(
            r#"
            INSERT INTO scans (id, registry, image_name, image_tag, status, idempotency_key, retry_count)
            VALUES ($1, $2, $3, $4, 'pending', $5, 0)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(registry)
        .bind(image_name)
        .bind(image_tag)
        .bind(idempotency_key)
        .fetch_one(&self.pool)
        .await?;

        let scan = row_to_scan(row)?;
        self.append_audit(scan.id, None, ScanStatus::Pending, Some("scan submitted"), None, "submission_service")
            .await?;
        Ok(scan)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Scan>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM scans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_scan).transpose()
    }

    /// Most recent completed scan for the triple within the cache TTL window.
    pub async fn find_cached_scan(
        &self,
        registry: &str,
        image_name: &str,
        image_tag: &str,
        ttl_minutes: i64,
    ) -> Result<Option<Scan>, sqlx::Error> {
        let cutoff = Utc::now() - ChronoDuration::minutes(ttl_minutes);
        let row = sqlx::query(
            r#"
            SELECT * FROM scans
            WHERE registry = $1 AND image_name = $2 AND image_tag = $3
              AND status = 'completed' AND created_at >= $4
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(registry)
        .bind(image_name)
        .bind(image_tag)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_scan).transpose()
    }

    /// Any scan for the triple still in flight ("join existing work").
    pub async fn find_in_progress(
        &self,
        registry: &str,
        image_name: &str,
        image_tag: &str,
    ) -> Result<Option<Scan>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT * FROM scans
            WHERE registry = $1 AND image_name = $2 AND image_tag = $3
              AND status = ANY($4)
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(registry)
        .bind(image_name)
        .bind(image_tag)
        .bind(IN_PROGRESS_STATUSES)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_scan).transpose()
    }

    pub async fn update_status(
        &self,
        id: Uuid,
        new_status: ScanStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE scans SET status = $1, updated_at = now() WHERE id = $2")
            .bind(new_status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_started(
        &self,
        id: Uuid,
        worker_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE scans SET status = 'pulling', worker_id = $1, started_at = now(), updated_at = now() WHERE id = $2",
        )
        .bind(worker_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn terminal_success(
        &self,
        id: Uuid,
        raw_report: &JsonValue,
        metrics: &crate::scanner::metrics::ExtractedMetrics,
        pull_duration: Option<f64>,
        analysis_duration: Option<f64>,
        scan_duration: f64,
        trivy_version: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE scans SET
                status = 'completed',
                raw_report = $2,
                image_digest = $3,
                critical_count = $4,
                high_count = $5,
                medium_count = $6,
                low_count = $7,
                unknown_count = $8,
                total_vulnerabilities = $9,
                fixable_count = $10,
                unfixable_count = $11,
                risk_score = $12,
                max_cvss_score = $13,
                avg_cvss_score = $14,
                is_compliant = $15,
                compliance_status = $16,
                pull_duration = $17,
                analysis_duration = $18,
                scan_duration = $19,
                trivy_version = $20,
                completed_at = now(),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(raw_report)
        .bind(&metrics.image_digest)
        .bind(metrics.critical_count)
        .bind(metrics.high_count)
        .bind(metrics.medium_count)
        .bind(metrics.low_count)
        .bind(metrics.unknown_count)
        .bind(metrics.total_vulnerabilities)
        .bind(metrics.fixable_count)
        .bind(metrics.unfixable_count)
        .bind(metrics.risk_score)
        .bind(metrics.max_cvss_score)
        .bind(metrics.avg_cvss_score)
        .bind(metrics.is_compliant)
        .bind(metrics.compliance_status)
        .bind(pull_duration)
        .bind(analysis_duration)
        .bind(scan_duration)
        .bind(trivy_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `error_message` is truncated to 500 characters before persisting.
    /// `increment_retry` should be false for permanent classifications.
    pub async fn terminal_failure(
        &self,
        id: Uuid,
        error_code: &str,
        error_message: &str,
        increment_retry: bool,
    ) -> Result<(), sqlx::Error> {
        let bounded: String = error_message.chars().take(500).collect();
        if increment_retry {
            sqlx::query(
                r#"
                UPDATE scans SET
                    status = 'failed', error_code = $2, error_message = $3,
                    retry_count = retry_count + 1, completed_at = now(), updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(error_code)
            .bind(bounded)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE scans SET
                    status = 'failed', error_code = $2, error_message = $3,
                    completed_at = now(), updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(error_code)
            .bind(bounded)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn delete_cascade(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM scans WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self, filters: &ListFilters, page: i64, page_size: i64) -> Result<Page<Scan>, sqlx::Error> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 100);
        let offset = (page - 1) * page_size;

        let status_filter = filters.status.map(|s| s.as_str());
        let name_pattern = filters.image_name_contains.as_ref().map(|s| format!("%{}%", s.to_lowercase()));

        let rows = sqlx::query(
            r#"
            SELECT * FROM scans
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR image_name ILIKE $2)
              AND ($3::bool IS NULL OR is_compliant = $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(status_filter)
        .bind(&name_pattern)
        .bind(filters.compliant_only)
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM scans
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR image_name ILIKE $2)
              AND ($3::bool IS NULL OR is_compliant = $3)
            "#,
        )
        .bind(status_filter)
        .bind(&name_pattern)
        .bind(filters.compliant_only)
        .fetch_one(&self.pool)
        .await?
        .try_get("count")?;

        let items = rows.into_iter().map(row_to_scan).collect::<Result<Vec<_>, _>>()?;
        Ok(Page { items, total, page, page_size })
    }

    pub async fn history_for_image(
        &self,
        image_name: &str,
        image_tag: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Scan>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM scans
            WHERE image_name = $1 AND image_tag = $2 AND created_at >= $3
            ORDER BY created_at DESC
            "#,
        )
        .bind(image_name)
        .bind(image_tag)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_scan).collect()
    }

    pub async fn top_n_by_risk(&self, n: i64) -> Result<Vec<Scan>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM scans
            WHERE status = 'completed'
            ORDER BY risk_score DESC, created_at DESC
            LIMIT $1
            "#,
        )
        .bind(n)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_scan).collect()
    }

    pub async fn compliance_summary(&self) -> Result<ComplianceSummary, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'completed') AS total_scans,
                COUNT(*) FILTER (WHERE compliance_status = 'compliant') AS compliant_count,
                COUNT(*) FILTER (WHERE compliance_status = 'non_compliant') AS non_compliant_count,
                COUNT(*) FILTER (WHERE compliance_status = 'pending_review') AS pending_review_count,
                COALESCE(AVG(risk_score) FILTER (WHERE status = 'completed'), 0.0) AS avg_risk_score
            FROM scans
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ComplianceSummary {
            total_scans: row.try_get("total_scans")?,
            compliant_count: row.try_get("compliant_count")?,
            non_compliant_count: row.try_get("non_compliant_count")?,
            pending_review_count: row.try_get("pending_review_count")?,
            avg_risk_score: row.try_get::<Option<f64>, _>("avg_risk_score")?.unwrap_or(0.0),
        })
    }

    /// Failed scans eligible for retry: retry_count < max_retries and not
    /// a permanent classification, in created_at order.
    pub async fn retry_candidates(&self, max_retries: i32) -> Result<Vec<Scan>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM scans
            WHERE status = 'failed'
              AND retry_count < $1
              AND (error_code IS NULL OR NOT (error_code = ANY($2)))
            ORDER BY created_at ASC
            "#,
        )
        .bind(max_retries)
        .bind(crate::errors::PERMANENT_ERROR_CODES)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_scan).collect()
    }

    /// Re-enqueues a retry candidate as pending again, for the worker pool
    /// to claim like any other fresh submission.
    pub async fn requeue_for_retry(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE scans SET
                status = 'pending', error_message = NULL, error_code = NULL,
                worker_id = NULL, started_at = NULL, completed_at = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append_audit(
        &self,
        scan_id: Uuid,
        previous_status: Option<ScanStatus>,
        new_status: ScanStatus,
        message: Option<&str>,
        structured_context: Option<JsonValue>,
        actor: &str,
    ) -> Result<AuditLogEntry, sqlx::Error> {
        let row = sqlx::query(
            r#"
            INSERT INTO audit_log (id, scan_id, previous_status, new_status, message, structured_context, actor)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(scan_id)
        .bind(previous_status)
        .bind(new_status)
        .bind(message)
        .bind(structured_context)
        .bind(actor)
        .fetch_one(&self.pool)
        .await?;

        Ok(AuditLogEntry {
            id: row.try_get("id")?,
            scan_id: row.try_get("scan_id")?,
            previous_status: row.try_get("previous_status")?,
            new_status: row.try_get("new_status")?,
            message: row.try_get("message")?,
            structured_context: row.try_get("structured_context")?,
            actor: row.try_get("actor")?,
            created_at: row.try_get("created_at")?,
        })
    }

    pub async fn audit_history(&self, scan_id: Uuid) -> Result<Vec<AuditLogEntry>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM audit_log WHERE scan_id = $1 ORDER BY created_at ASC")
            .bind(scan_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(AuditLogEntry {
                    id: row.try_get("id")?,
                    scan_id: row.try_get("scan_id")?,
                    previous_status: row.try_get("previous_status")?,
                    new_status: row.try_get("new_status")?,
                    message: row.try_get("message")?,
                    structured_context: row.try_get("structured_context")?,
                    actor: row.try_get("actor")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    /// Persists per-finding rows, gated by `persist_vulnerability_details`.
    pub async fn bulk_insert_findings(&self, scan_id: Uuid, findings: &[FindingRow]) -> Result<(), sqlx::Error> {
        if findings.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for finding in findings {
            sqlx::query(
                r#"
                INSERT INTO vulnerability_details
                    (id, scan_id, vulnerability_id, package_name, package_version, fixed_version, severity, cvss_score, is_fixable)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(scan_id)
            .bind(&finding.vulnerability_id)
            .bind(&finding.package_name)
            .bind(&finding.package_version)
            .bind(&finding.fixed_version)
            .bind(&finding.severity)
            .bind(finding.cvss_score)
            .bind(finding.is_fixable)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn find_by_cve(&self, vulnerability_id: &str) -> Result<Vec<VulnerabilityDetail>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM vulnerability_details WHERE vulnerability_id = $1 ORDER BY package_name ASC")
            .bind(vulnerability_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_vuln_detail).collect()
    }

    pub async fn scan_details(&self, scan_id: Uuid) -> Result<Vec<VulnerabilityDetail>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM vulnerability_details WHERE scan_id = $1 ORDER BY severity ASC")
            .bind(scan_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_vuln_detail).collect()
    }
}
