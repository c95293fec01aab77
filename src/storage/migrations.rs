//! Schema migrations.
//!
//! Migrations from [`schema::MIGRATIONS`] are applied in order, each in its
//! own transaction, and recorded by name in `_migrations`. A session-wide
//! advisory lock serializes runners, so several workers started with
//! `--migrate` at once apply each migration exactly once.

use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use thiserror::Error;
use tracing::{debug, info};

use super::schema;

/// Advisory lock key held while migrations run.
const MIGRATION_LOCK_KEY: i64 = 0x7265_706f_7665_7269;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A migration statement was rejected.
    #[error("Migration {name} failed: {message}")]
    MigrationFailed { name: String, message: String },
}

/// Applies pending migrations against a pool.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every migration not yet recorded and returns how many ran.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let result = apply_pending(&mut conn).await;

        // Unlock even when a migration failed; the connection goes back to the pool.
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        result
    }

    /// Migrations recorded in `_migrations`, oldest first.
    pub async fn list_applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        let mut conn = self.pool.acquire().await?;
        ensure_migrations_table(&mut conn).await?;

        let migrations: Vec<AppliedMigration> =
            sqlx::query_as("SELECT name, applied_at FROM _migrations ORDER BY name")
                .fetch_all(&mut *conn)
                .await?;

        Ok(migrations)
    }
}

async fn apply_pending(conn: &mut PoolConnection<Postgres>) -> Result<usize, MigrationError> {
    ensure_migrations_table(conn).await?;

    let applied: Vec<(String,)> = sqlx::query_as("SELECT name FROM _migrations")
        .fetch_all(&mut **conn)
        .await?;
    let applied: Vec<String> = applied.into_iter().map(|(name,)| name).collect();

    let pending = pending_migrations(&applied);
    for (name, sql) in &pending {
        let mut tx = sqlx::Connection::begin(&mut **conn).await?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::MigrationFailed {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(*name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(migration = %name, "Applied migration");
    }

    if pending.is_empty() {
        debug!("Schema is up to date");
    }
    Ok(pending.len())
}

async fn ensure_migrations_table(conn: &mut PoolConnection<Postgres>) -> Result<(), MigrationError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id SERIAL PRIMARY KEY,
            name VARCHAR(255) NOT NULL UNIQUE,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut **conn)
    .await?;

    Ok(())
}

/// Migrations whose names are not in `applied`, in declaration order.
fn pending_migrations(applied: &[String]) -> Vec<(&'static str, &'static str)> {
    schema::MIGRATIONS
        .iter()
        .filter(|(name, _)| !applied.iter().any(|a| a == name))
        .copied()
        .collect()
}

/// Record of an applied migration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_migrations_skip_applied() {
        let all = pending_migrations(&[]);
        assert_eq!(all.len(), schema::MIGRATIONS.len());

        let applied = vec![
            "0001_create_submissions".to_string(),
            "0002_create_jobs".to_string(),
        ];
        let pending = pending_migrations(&applied);
        assert_eq!(pending.len(), schema::MIGRATIONS.len() - 2);
        assert_eq!(pending[0].0, "0003_index_jobs_submission");
    }

    #[test]
    fn test_migration_error_display() {
        let err = MigrationError::MigrationFailed {
            name: "0002_create_jobs".to_string(),
            message: "syntax error".to_string(),
        };
        assert!(err.to_string().contains("0002_create_jobs"));
        assert!(err.to_string().contains("syntax error"));
    }
}
