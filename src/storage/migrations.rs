//! Schema migration runner.
//!
//! Applied statements are recorded in a `_migrations` table so the runner
//! can be invoked on every start.

use sqlx::PgPool;
use tracing::info;

use crate::error::StoreError;

use super::schema;

pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every schema statement not yet recorded. Returns how many ran.
    pub async fn run_migrations(&self) -> Result<usize, StoreError> {
        self.ensure_migrations_table().await?;

        let mut applied = 0;
        for (idx, statement) in schema::all_schema_statements().iter().enumerate() {
            let migration_name = migration_name(idx);
            if !self.is_migration_applied(&migration_name).await? {
                self.apply_migration(&migration_name, statement).await?;
                applied += 1;
            }
        }

        if applied > 0 {
            info!(applied, "Applied schema migrations");
        }
        Ok(applied)
    }

    async fn ensure_migrations_table(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_migration_applied(&self, name: &str) -> Result<bool, StoreError> {
        let result: Option<(i32,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(result.is_some())
    }

    async fn apply_migration(&self, name: &str, sql: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Migration(format!("{}: {}", name, e)))?;

        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_applied_migrations(&self) -> Result<Vec<AppliedMigration>, StoreError> {
        self.ensure_migrations_table().await?;

        let migrations: Vec<AppliedMigration> =
            sqlx::query_as("SELECT name, applied_at FROM _migrations ORDER BY applied_at")
                .fetch_all(&self.pool)
                .await?;

        Ok(migrations)
    }

    /// Drops every table, including the migration log.
    ///
    /// **WARNING**: destroys all data. Development only.
    pub async fn reset_database(&self) -> Result<(), StoreError> {
        for table in schema::tables::ALL.iter().chain(["_migrations"].iter()) {
            sqlx::query(&format!("DROP TABLE IF EXISTS {} CASCADE", table))
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Migration(format!("drop {} failed: {}", table, e)))?;
        }
        Ok(())
    }
}

fn migration_name(idx: usize) -> String {
    format!("reelcast_v1_part_{}", idx)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_names_are_stable() {
        assert_eq!(migration_name(0), "reelcast_v1_part_0");
        assert_eq!(migration_name(6), "reelcast_v1_part_6");
    }

    #[test]
    fn test_migration_error_display() {
        let err = StoreError::Migration("part_3: syntax error".to_string());
        assert!(err.to_string().contains("part_3"));
    }
}
