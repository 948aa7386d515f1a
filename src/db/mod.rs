pub mod claimer;
pub mod models;
pub mod store;

use sqlx::postgres::{PgPoolOptions, PgPool};
use std::time::Duration;

use crate::config::Config;

pub async fn create_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.db_pool_size + config.db_pool_overflow)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(config.db_connect_timeout_seconds))
        .max_lifetime(Duration::from_secs(config.db_connection_recycle_seconds))
        .connect(&config.database_url)
        .await
}
