// Aggregation endpoints backing the dashboard: pushed into SQL aggregates
// at the store layer rather than folded client-side over a row dump.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::db::models::ScanStatus;
use crate::errors::ScanError;

#[derive(Debug, Serialize)]
pub struct DashboardStatsResponse {
    pub total_scans: i64,
    pub compliant_count: i64,
    pub non_compliant_count: i64,
    pub pending_review_count: i64,
    pub avg_risk_score: f64,
    pub top_risk: Vec<TopRiskEntry>,
}

#[derive(Debug, Serialize)]
pub struct TopRiskEntry {
    pub id: Uuid,
    pub registry: String,
    pub image_name: String,
    pub image_tag: String,
    pub risk_score: i32,
    pub is_compliant: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

const TOP_N: i64 = 10;

pub async fn stats(State(state): State<AppState>) -> Result<Json<DashboardStatsResponse>, ScanError> {
    let summary = state.store.compliance_summary().await?;
    let top = state.store.top_n_by_risk(TOP_N).await?;

    Ok(Json(DashboardStatsResponse {
        total_scans: summary.total_scans,
        compliant_count: summary.compliant_count,
        non_compliant_count: summary.non_compliant_count,
        pending_review_count: summary.pending_review_count,
        avg_risk_score: summary.avg_risk_score,
        top_risk: top
            .into_iter()
            .map(|s| TopRiskEntry {
                id: s.id,
                registry: s.registry,
                image_name: s.image_name,
                image_tag: s.image_tag,
                risk_score: s.risk_score,
                is_compliant: s.is_compliant,
                completed_at: s.completed_at,
            })
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct TrendQuery {
    pub tag: Option<String>,
    pub days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TrendPoint {
    pub id: Uuid,
    pub status: ScanStatus,
    pub risk_score: i32,
    pub is_compliant: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct TrendResponse {
    pub image_name: String,
    pub image_tag: String,
    pub since: DateTime<Utc>,
    pub points: Vec<TrendPoint>,
}

const DEFAULT_TREND_WINDOW_DAYS: i64 = 30;

pub async fn trend(
    State(state): State<AppState>,
    Path(image): Path<String>,
    Query(q): Query<TrendQuery>,
) -> Result<Json<TrendResponse>, ScanError> {
    let tag = q.tag.unwrap_or_else(|| "latest".to_string());
    let days = q.days.unwrap_or(DEFAULT_TREND_WINDOW_DAYS).clamp(1, 365);
    let since = Utc::now() - ChronoDuration::days(days);

    let history = state.store.history_for_image(&image, &tag, since).await?;

    Ok(Json(TrendResponse {
        image_name: image,
        image_tag: tag,
        since,
        points: history
            .into_iter()
            .map(|s| TrendPoint {
                id: s.id,
                status: s.status,
                risk_score: s.risk_score,
                is_compliant: s.is_compliant,
                created_at: s.created_at,
                completed_at: s.completed_at,
            })
            .collect(),
    }))
}
