use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::time::Duration;
use tracing::info;

use super::DbResult;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/rbac_engine".to_string()),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
        }
    }
}

/// Thin wrapper around a `PgPool`, grouping the options the engine cares
/// about and exposing a health check used by the store layer at startup.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    pool: PgPool,
}

impl ConnectionPool {
    pub async fn new(config: DatabaseConfig) -> DbResult<Self> {
        info!("connecting to database, max_connections={}", config.max_connections);

        let mut pool_options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout);

        if let Some(idle_timeout) = config.idle_timeout {
            pool_options = pool_options.idle_timeout(idle_timeout);
        }
        if let Some(max_lifetime) = config.max_lifetime {
            pool_options = pool_options.max_lifetime(max_lifetime);
        }

        let pool = pool_options.connect(&config.database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub fn close(&self) {
        self.pool.close();
    }

    pub async fn health_check(&self) -> DbResult<bool> {
        let row = sqlx::query("SELECT 1 AS health_check")
            .fetch_one(&self.pool)
            .await?;
        let value: i32 = row.try_get("health_check")?;
        Ok(value == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_config_default_has_sane_pool_sizing() {
        let config = DatabaseConfig::default();
        assert_eq!(config.min_connections, 1);
        assert!(config.max_connections >= config.min_connections);
    }
}
