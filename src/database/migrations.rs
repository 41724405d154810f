//! # Database Migration System
//!
//! Applies the embedded schema migrations in version order. A PostgreSQL
//! advisory lock serializes concurrent bridge processes starting against the
//! same database; applied versions are tracked in
//! `satcom_bridge_schema_migrations`.

use sqlx::{PgPool, Row};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Represents a single embedded database migration.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Version timestamp (YYYYMMDDHHMMSS format)
    pub version: &'static str,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Migrations in application order
pub const MIGRATIONS: &[Migration] = &[Migration {
    version: "20240301000000",
    name: "create_ota_command_instances",
    sql: include_str!("../../migrations/20240301000000_create_ota_command_instances.sql"),
}];

// Deterministic key shared by all bridge processes
const MIGRATION_LOCK_KEY: i64 = 0x5a7c_0b71_d6e1_0001;

pub struct DatabaseMigrations;

impl DatabaseMigrations {
    /// Run all outstanding migrations, returning how many were applied
    pub async fn run_all(pool: &PgPool) -> Result<usize, sqlx::Error> {
        let mut conn = pool.acquire().await?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let result = Self::apply_outstanding(&mut conn).await;

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        result
    }

    async fn apply_outstanding(conn: &mut sqlx::PgConnection) -> Result<usize, sqlx::Error> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS satcom_bridge_schema_migrations (
                version    TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        let applied: BTreeSet<String> =
            sqlx::query("SELECT version FROM satcom_bridge_schema_migrations")
                .fetch_all(&mut *conn)
                .await?
                .iter()
                .map(|row| row.get::<String, _>("version"))
                .collect();

        let mut count = 0;
        for migration in MIGRATIONS {
            if applied.contains(migration.version) {
                debug!(version = migration.version, "Migration already applied");
                continue;
            }

            let mut tx = sqlx::Connection::begin(&mut *conn).await?;
            sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO satcom_bridge_schema_migrations (version, name) VALUES ($1, $2)")
                .bind(migration.version)
                .bind(migration.name)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            info!(
                version = migration.version,
                name = migration.name,
                "💾 Applied migration"
            );
            count += 1;
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_unique() {
        let versions: Vec<_> = MIGRATIONS.iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(versions, sorted);
        assert!(MIGRATIONS
            .iter()
            .all(|m| m.sql.contains("ota_command_instances")));
    }
}
