use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Ambient configuration shared by every binary embedding the engine: where
/// the database lives and how loudly the engine should log. RBAC-specific
/// options (singleton roles, team-assignment gating, creator defaults, ...)
/// live in `rbac_engine::EngineConfig`, loaded separately so a host can
/// change its RBAC policy without touching connection settings.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SharedConfig {
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl SharedConfig {
    /// Loads configuration from compiled-in defaults, an optional
    /// `config/rbac.toml` file, then environment variables prefixed
    /// `RBAC__` (double underscore separates nesting, e.g.
    /// `RBAC__DATABASE__URL`).
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("database.url", "postgresql://localhost/rbac_engine")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 1)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.idle_timeout_secs", 600)?
            .set_default("database.max_lifetime_secs", 1800)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::with_name("config/rbac").required(false))
            .add_source(Environment::with_prefix("RBAC").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            database: DatabaseSettings {
                url: "postgresql://localhost/rbac_engine".to_string(),
                max_connections: 10,
                min_connections: 1,
                acquire_timeout_secs: 30,
                idle_timeout_secs: 600,
                max_lifetime_secs: 1800,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                json: false,
            },
        }
    }
}

impl From<&DatabaseSettings> for crate::database::DatabaseConfig {
    fn from(settings: &DatabaseSettings) -> Self {
        use std::time::Duration;
        crate::database::DatabaseConfig {
            database_url: settings.url.clone(),
            max_connections: settings.max_connections,
            min_connections: settings.min_connections,
            acquire_timeout: Duration::from_secs(settings.acquire_timeout_secs),
            idle_timeout: Some(Duration::from_secs(settings.idle_timeout_secs)),
            max_lifetime: Some(Duration::from_secs(settings.max_lifetime_secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_local_database_url() {
        let config = SharedConfig::default();
        assert!(config.database.url.starts_with("postgresql://"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn database_settings_convert_to_pool_config() {
        let config = SharedConfig::default();
        let pool_config: crate::database::DatabaseConfig = (&config.database).into();
        assert_eq!(pool_config.max_connections, 10);
    }
}
