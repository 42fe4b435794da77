//! Connection pool and migrations

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::{IngestError, IngestResult};

/// Job, queue and sheet config tables. Business tables are created at runtime.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn create_pool(config: &DatabaseConfig) -> IngestResult<PgPool> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| IngestError::InvalidConfig("DATABASE_URL is not set".to_string()))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(url)
        .await?;

    tracing::info!(max_connections = config.max_connections, "Database connection pool established");
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> IngestResult<()> {
    MIGRATOR.run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}
