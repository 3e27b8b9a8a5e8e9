//! Schema migrations.
//!
//! Migrations are applied before the API serves requests and before the CLI
//! starts an import, so the engine always runs against the latest schema.

use rocket_db_pools::sqlx::{self, PgPool, migrate::Migrator};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply pending migrations. Already-applied migrations are skipped.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    log::info!("checking database migration state");

    // `run` also verifies checksums of applied migrations.
    MIGRATOR.run(pool).await?;

    log::info!("database migrations up to date");
    Ok(())
}
