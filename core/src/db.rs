use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::env;
use std::time::Duration;

use crate::config::{DatabaseConfig, DATABASE_URL_ENV};

/// Create a pool from the database section of the configuration
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let url = config
        .url
        .as_deref()
        .with_context(|| format!("Database URL not configured (set {DATABASE_URL_ENV})"))?;

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .connect(url)
        .await
        .context("Failed to connect to database")
}

/// Create a pool from `PARLEY_DATABASE_URL` with default pool settings
pub async fn create_pool_from_env() -> Result<PgPool> {
    let url = env::var(DATABASE_URL_ENV).with_context(|| format!("{DATABASE_URL_ENV} must be set"))?;
    create_pool(&DatabaseConfig {
        url: Some(url),
        ..Default::default()
    })
    .await
}

/// Run database migrations
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;

    Ok(())
}
