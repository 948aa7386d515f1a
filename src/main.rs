use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{HeaderName, Method, header},
    routing::get,
};
use redis::aio::ConnectionManager;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod cache;
mod config;
mod db;
mod errors;
mod middleware;
mod scanner;
mod submission;
mod utils;
mod worker;

use api::AppState;
use cache::CacheService;
use config::Config;
use db::claimer::JobClaimer;
use db::store::ScanStore;

const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vulnscan_api=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    let config = Arc::new(config);

    let pool = db::create_pool(&config).await.context("failed to connect to PostgreSQL")?;
    tracing::info!("connected to PostgreSQL");

    sqlx::migrate!("./migrations").run(&pool).await.context("failed to run database migrations")?;
    tracing::info!("database migrations completed");

    let redis_client = redis::Client::open(config.redis_url.clone()).context("invalid REDIS_URL")?;
    let redis_conn = ConnectionManager::new(redis_client)
        .await
        .context("failed to connect to Redis")?;
    tracing::info!("connected to Redis");

    let store = ScanStore::new(pool.clone());
    let claimer = JobClaimer::new(pool.clone());
    let cache = CacheService::new(redis_conn);

    let shutdown = worker::ShutdownFlag::new();
    let worker_handles = worker::spawn_pool(store.clone(), claimer, Arc::clone(&config), shutdown.clone());
    tracing::info!(count = config.worker_concurrency, "worker pool started");

    let app_state = AppState::new(store, cache, Arc::clone(&config));

    let origins: Vec<header::HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(std::time::Duration::from_secs(3600));

    let app = Router::new()
        .route("/health", get(api::health::health_check))
        .route("/health/ping", get(api::health::ping))
        .nest("/api/v1", api::routes::v1_routes())
        .with_state(app_state)
        .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid));

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .context("invalid SERVER_HOST/SERVER_PORT")?;
    tracing::info!("starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, signaling worker pool to stop claiming new scans");
    shutdown.trigger();
    for handle in worker_handles {
        let _ = handle.await;
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, starting graceful shutdown"),
        _ = terminate => tracing::info!("received SIGTERM, starting graceful shutdown"),
    }
}
