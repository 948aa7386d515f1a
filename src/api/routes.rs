use axum::{Router, routing::{get, post}};

use super::AppState;
use super::{dashboard, scan};

/// The three lifecycle endpoints (submit, fetch, status) plus the
/// listing/delete/dashboard surface described at the interface level only.
pub fn v1_routes() -> Router<AppState> {
    Router::new()
        .route("/scan", post(scan::submit_scan))
        .route("/scan/{id}", get(scan::get_scan).delete(scan::delete_scan))
        .route("/scan/{id}/status", get(scan::get_scan_status))
        .route("/scans", get(scan::list_scans))
        .route("/dashboard/stats", get(dashboard::stats))
        .route("/dashboard/trend/{*image}", get(dashboard::trend))
}
