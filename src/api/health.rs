use axum::{Json, extract::State};
use serde::Serialize;

use super::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub services: ServiceStatus,
}

#[derive(Serialize)]
pub struct ServiceStatus {
    pub database: bool,
    pub redis: bool,
}

#[derive(Serialize)]
pub struct PingResponse {
    pub status: &'static str,
}

/// Lightweight liveness probe for container healthchecks. Returns 200
/// immediately — no database or Redis round trip. Use `/health` for the
/// full diagnostic check.
pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse { status: "ok" })
}

/// Full health check — queries the database and the rate-limiter's Redis.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_healthy = sqlx::query("SELECT 1").fetch_one(state.store.pool()).await.is_ok();
    let redis_healthy = state.cache.ping().await;

    Json(HealthResponse {
        status: if db_healthy && redis_healthy {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        services: ServiceStatus {
            database: db_healthy,
            redis: redis_healthy,
        },
    })
}
