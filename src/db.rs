//! Database connection management for the order bridge.
//!
//! Opens the SQLite store behind a SeaORM pool, applies the journaling
//! pragmas the engine relies on (WAL so readers never block the single
//! writer) and runs pending migrations.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("failed to connect to database: {source}")]
    ConnectionFailed {
        #[from]
        source: sea_orm::DbErr,
    },
    #[error("invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
}

/// Opens (creating if necessary) the SQLite store at `db_path` and applies
/// all pending migrations.
pub async fn init_store(db_path: &str) -> Result<DatabaseConnection> {
    if db_path.is_empty() {
        return Err(DatabaseError::InvalidConfiguration {
            message: "database path cannot be empty".to_string(),
        }
        .into());
    }

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {parent:?}"))?;
        }
    }

    let url = format!("sqlite://{db_path}?mode=rwc");
    let mut opt = ConnectOptions::new(url);
    opt.max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let db = Database::connect(opt)
        .await
        .map_err(|source| DatabaseError::ConnectionFailed { source })?;

    apply_pragmas(&db).await?;

    Migrator::up(&db, None)
        .await
        .context("failed to apply database migrations")?;

    Ok(db)
}

/// Enables WAL journaling and foreign key enforcement on the pool.
pub async fn apply_pragmas(db: &DatabaseConnection) -> Result<()> {
    let backend = db.get_database_backend();
    for pragma in [
        "PRAGMA journal_mode=WAL",
        "PRAGMA foreign_keys=ON",
        "PRAGMA busy_timeout=5000",
    ] {
        db.execute(Statement::from_string(backend, pragma.to_string()))
            .await
            .with_context(|| format!("failed to apply {pragma}"))?;
    }
    Ok(())
}

/// Health check for the database connection.
pub async fn health_check(db: &DatabaseConnection) -> Result<()> {
    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());

    db.query_one(stmt)
        .await
        .context("database health check failed")?;

    Ok(())
}
