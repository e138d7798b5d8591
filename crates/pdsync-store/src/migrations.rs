//! Versioned, forward-only schema migrations
//!
//! Each migration runs in its own transaction together with the bump of
//! `schema_version`, so a crash mid-migration leaves the database at the
//! previous version. There is no down path.

use sqlx::SqlitePool;

use crate::StoreError;

/// Ordered list of (version, sql) pairs. Append only.
const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("migrations/0001_initial.sql"))];

/// Apply all migrations newer than the database's current version.
pub async fn run(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::raw_sql("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .execute(pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("schema_version table: {e}")))?;

    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("read schema version: {e}")))?;
    let current = current.unwrap_or(0);

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("begin migration {version}: {e}")))?;

        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("apply migration {version}: {e}")))?;

        sqlx::query("INSERT INTO schema_version (version) VALUES (?1)")
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("record migration {version}: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("commit migration {version}: {e}")))?;

        tracing::info!(version, "Applied schema migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = pool::open_in_memory().await.unwrap();
        // A second run must be a no-op.
        run(&pool).await.unwrap();

        let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().0);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count as usize, MIGRATIONS.len());
    }

    #[tokio::test]
    async fn test_initial_schema_creates_all_tables() {
        let pool = pool::open_in_memory().await.unwrap();
        for table in [
            "file_state",
            "file_hashes",
            "node_mapping",
            "sync_jobs",
            "signals",
        ] {
            let found: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert_eq!(found, 1, "missing table {table}");
        }
    }
}
