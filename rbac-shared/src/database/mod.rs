mod connection;
mod migrations;

pub use connection::{ConnectionPool, DatabaseConfig};
pub use migrations::{MigrationInfo, MigrationRunner};

use sqlx::{PgPool, Postgres, Transaction};

pub type DbPool = PgPool;
pub type DbTransaction<'a> = Transaction<'a, Postgres>;
pub type DbResult<T> = std::result::Result<T, sqlx::Error>;
