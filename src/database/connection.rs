use crate::config::DatabaseConfig;
use crate::error::{BridgeError, BridgeResult};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

pub struct DatabaseConnection {
    pool: PgPool,
}

impl DatabaseConnection {
    /// Connect using the configured url, falling back to `DATABASE_URL`
    pub async fn connect(config: &DatabaseConfig) -> BridgeResult<Self> {
        let database_url = config
            .url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .ok_or_else(|| {
                BridgeError::ConfigurationError(
                    "database.url is not set and DATABASE_URL is missing".to_string(),
                )
            })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&database_url)
            .await?;

        info!(
            max_connections = config.max_connections,
            "💾 Connected to instance store database"
        );

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
