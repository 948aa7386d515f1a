use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::db::models::{ComplianceStatus, Scan, ScanStatus};
use crate::db::store::ListFilters;
use crate::errors::ScanError;
use crate::middleware::rate_limit_key;
use crate::submission::{SubmissionRequest, SubmissionService};

// ============================================
// Response projections (flat row -> nested document)
// ============================================

#[derive(Debug, Serialize)]
pub struct ImageResponse {
    pub registry: String,
    pub image_name: String,
    pub image_tag: String,
    pub image_digest: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
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
}

#[derive(Debug, Serialize)]
pub struct TimingResponse {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scan_duration: Option<f64>,
    pub pull_duration: Option<f64>,
    pub analysis_duration: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ScanResponse {
    pub id: Uuid,
    pub image: ImageResponse,
    pub status: ScanStatus,
    pub retry_count: i32,
    pub worker_id: Option<String>,
    pub trivy_version: Option<String>,
    pub idempotency_key: Option<String>,
    pub metrics: MetricsResponse,
    pub timing: TimingResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_report: Option<serde_json::Value>,
}

impl ScanResponse {
    fn from_scan(scan: &Scan, include_raw_report: bool) -> Self {
        Self {
            id: scan.id,
            image: ImageResponse {
                registry: scan.registry.clone(),
                image_name: scan.image_name.clone(),
                image_tag: scan.image_tag.clone(),
                image_digest: scan.image_digest.clone(),
            },
            status: scan.status,
            retry_count: scan.retry_count,
            worker_id: scan.worker_id.clone(),
            trivy_version: scan.trivy_version.clone(),
            idempotency_key: scan.idempotency_key.clone(),
            metrics: MetricsResponse {
                critical_count: scan.critical_count,
                high_count: scan.high_count,
                medium_count: scan.medium_count,
                low_count: scan.low_count,
                unknown_count: scan.unknown_count,
                total_vulnerabilities: scan.total_vulnerabilities,
                fixable_count: scan.fixable_count,
                unfixable_count: scan.unfixable_count,
                risk_score: scan.risk_score,
                max_cvss_score: scan.max_cvss_score,
                avg_cvss_score: scan.avg_cvss_score,
                is_compliant: scan.is_compliant,
                compliance_status: scan.compliance_status,
            },
            timing: TimingResponse {
                started_at: scan.started_at,
                completed_at: scan.completed_at,
                scan_duration: scan.scan_duration,
                pull_duration: scan.pull_duration,
                analysis_duration: scan.analysis_duration,
            },
            error: scan.error_code.clone().map(|code| ErrorDetail {
                code,
                message: scan.error_message.clone().unwrap_or_default(),
            }),
            created_at: scan.created_at,
            updated_at: scan.updated_at,
            raw_report: if include_raw_report { scan.raw_report.clone() } else { None },
        }
    }
}

// ============================================
// POST /api/v1/scan
// ============================================

#[derive(Debug, Deserialize)]
pub struct SubmitScanRequest {
    pub image_name: String,
    #[serde(default)]
    pub image_tag: Option<String>,
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub force_rescan: bool,
}

#[derive(Debug, Serialize)]
pub struct SubmitScanResponse {
    #[serde(flatten)]
    pub scan: ScanResponse,
    pub cache_hit: bool,
    pub newly_created: bool,
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
}

pub async fn submit_scan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SubmitScanRequest>,
) -> Result<Response, ScanError> {
    let key = rate_limit_key(client_ip(&headers).as_deref());
    let (allowed, _remaining, _reset) = state
        .cache
        .check_rate_limit(
            &key,
            state.config.submission_rate_limit,
            state.config.submission_rate_limit_window_seconds,
        )
        .await
        .map_err(|e| ScanError::Internal(format!("rate limiter unavailable: {e}")))?;
    if !allowed {
        return Err(ScanError::RateLimitExceeded);
    }

    let force_rescan = req.force_rescan;
    let submission = SubmissionService::new(&state.store, state.config.cache_ttl_minutes);
    let outcome = submission
        .submit(SubmissionRequest {
            raw_image_name: req.image_name,
            raw_tag: req.image_tag,
            raw_registry: req.registry,
            force_rescan,
            actor: "submission_api".to_string(),
        })
        .await?;

    let (cache_header, status) = if outcome.cache_hit {
        ("HIT", StatusCode::OK)
    } else if force_rescan {
        ("BYPASS", StatusCode::ACCEPTED)
    } else {
        ("MISS", StatusCode::ACCEPTED)
    };

    let body = SubmitScanResponse {
        scan: ScanResponse::from_scan(&outcome.scan, false),
        cache_hit: outcome.cache_hit,
        newly_created: outcome.newly_created,
    };

    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert("X-Cache", HeaderValue::from_static(cache_header));
    Ok(response)
}

// ============================================
// GET /api/v1/scan/{id}
// ============================================

#[derive(Debug, Deserialize)]
pub struct FetchQuery {
    #[serde(default)]
    pub include_raw_report: bool,
}

pub async fn get_scan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<FetchQuery>,
) -> Result<Json<ScanResponse>, ScanError> {
    let scan = state.store.get_by_id(id).await?.ok_or(ScanError::NotFound(id))?;
    Ok(Json(ScanResponse::from_scan(&scan, q.include_raw_report)))
}

// ============================================
// GET /api/v1/scan/{id}/status
// ============================================

#[derive(Debug, Serialize)]
pub struct ScanStatusResponse {
    pub id: Uuid,
    pub status: ScanStatus,
    pub is_terminal: bool,
    pub error_message: Option<String>,
    pub progress: u8,
}

pub async fn get_scan_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScanStatusResponse>, ScanError> {
    let scan = state.store.get_by_id(id).await?.ok_or(ScanError::NotFound(id))?;
    Ok(Json(ScanStatusResponse {
        id: scan.id,
        status: scan.status,
        is_terminal: scan.status.is_terminal(),
        error_message: scan.error_message,
        progress: scan.status.progress_percent(),
    }))
}

// ============================================
// GET /api/v1/scans
// ============================================

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub status: Option<ScanStatus>,
    pub image: Option<String>,
    pub compliant_only: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ListScansResponse {
    pub items: Vec<ScanResponse>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

pub async fn list_scans(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<ListScansResponse>, ScanError> {
    let filters = ListFilters {
        status: q.status,
        image_name_contains: q.image,
        compliant_only: q.compliant_only,
    };
    let page = state.store.list(&filters, q.page.unwrap_or(1), q.page_size.unwrap_or(20)).await?;
    Ok(Json(ListScansResponse {
        items: page.items.iter().map(|s| ScanResponse::from_scan(s, false)).collect(),
        total: page.total,
        page: page.page,
        page_size: page.page_size,
    }))
}

// ============================================
// DELETE /api/v1/scan/{id}
// ============================================

pub async fn delete_scan(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, ScanError> {
    let deleted = state.store.delete_cascade(id).await?;
    if deleted {
        Ok(StatusCode::OK)
    } else {
        Err(ScanError::NotFound(id))
    }
}
