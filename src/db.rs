use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness};

use crate::domain::errors::DomainError;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_pool(database_url: &str) -> Result<DbPool, r2d2::Error> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder().build(manager)
}

/// Run any pending migrations of `migrations` against the pool's database.
pub fn run_migrations(pool: &DbPool, migrations: EmbeddedMigrations) -> Result<(), DomainError> {
    let mut conn = pool.get()?;
    conn.run_pending_migrations(migrations)
        .map(|_| ())
        .map_err(|e| DomainError::Internal(format!("migrations failed: {e}")))
}

/// Runs a synchronous storage call on tokio's blocking pool.
pub async fn blocking<T, F>(f: F) -> Result<T, DomainError>
where
    F: FnOnce() -> Result<T, DomainError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DomainError::Internal(format!("blocking task failed: {e}")))?
}
