//! Database pool factory and migrations
//!
//! No caching, no static storage. The caller owns the pool and hands it to
//! the stores that need it.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::config::DatabaseConfig;

/// Create a new database connection pool from configuration
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let url = config
        .url
        .as_deref()
        .context("Database URL is not configured")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(url)
        .await
        .context("Failed to connect to database")?;

    Ok(pool)
}

/// Run database migrations
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_url_is_reported() {
        let result = create_pool(&DatabaseConfig::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires database to be running
    async fn test_pool_initialization() {
        let config = crate::config::Config::load().unwrap();
        let pool = create_pool(&config.database).await.unwrap();
        let result: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(result.0, 1);
    }
}
