use sqlx::{migrate::Migrator, PgPool};
use std::path::Path;
use tracing::{error, info};

use super::DbResult;

/// Applies the crate's versioned schema migrations at startup.
pub struct MigrationRunner {
    pool: PgPool,
    migrations_path: String,
}

impl MigrationRunner {
    pub fn new(pool: PgPool, migrations_path: Option<String>) -> Self {
        Self {
            pool,
            migrations_path: migrations_path.unwrap_or_else(|| "./migrations".to_string()),
        }
    }

    pub async fn run(&self) -> DbResult<()> {
        info!("running migrations from {}", self.migrations_path);

        let migrator = Migrator::new(Path::new(&self.migrations_path))
            .await
            .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;

        migrator.run(&self.pool).await.map_err(|e| {
            error!("migration run failed: {}", e);
            e
        })?;

        info!("migrations applied");
        Ok(())
    }

    pub async fn status(&self) -> DbResult<Vec<MigrationInfo>> {
        let migrator = Migrator::new(Path::new(&self.migrations_path))
            .await
            .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;

        let applied = sqlx::query_as::<_, (i64, String, chrono::DateTime<chrono::Utc>)>(
            "SELECT version, description, installed_on FROM _sqlx_migrations ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();

        let mut info = Vec::new();
        for migration in migrator.migrations.iter() {
            let found = applied.iter().find(|row| row.0 == migration.version);
            info.push(MigrationInfo {
                version: migration.version,
                description: migration.description.to_string(),
                is_applied: found.is_some(),
                installed_on: found.map(|row| row.2),
            });
        }
        Ok(info)
    }
}

#[derive(Debug, Clone)]
pub struct MigrationInfo {
    pub version: i64,
    pub description: String,
    pub is_applied: bool,
    pub installed_on: Option<chrono::DateTime<chrono::Utc>>,
}

impl std::fmt::Display for MigrationInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.is_applied { "APPLIED" } else { "PENDING" };
        write!(f, "{:03} | {} | {}", self.version, status, self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_info_display_shows_status() {
        let info = MigrationInfo {
            version: 1,
            description: "create rbac tables".to_string(),
            is_applied: true,
            installed_on: None,
        };
        let text = format!("{}", info);
        assert!(text.contains("001"));
        assert!(text.contains("APPLIED"));
    }
}
