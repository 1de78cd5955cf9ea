//! SQLite implementation of [`MigrationExecutor`].
//!
//! Applied migrations live in `schema_versions`. SQLite has no advisory
//! locks, so the lock is a row in `migration_locks`: inserting the row
//! acquires it, deleting it releases it. Each executor instance has its own
//! holder id and only ever deletes its own row.
//!
//! A row outlives a crashed process, so a row older than the lock TTL
//! ([`DEFAULT_LOCK_TTL`] unless set with
//! [`SqliteMigrationExecutor::with_lock_ttl`]) counts as stale and is taken
//! over by the next acquirer.
//!
//! Each migration runs inside a transaction, so a failing file leaves no
//! partial schema change behind.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use second_brain_core::drift::{MigrationInfo, MigrationRecord};
use sqlx::SqlitePool;
use tracing::warn;

use crate::migrate::MigrationExecutor;

/// Age after which a lock row is considered abandoned.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15 * 60);

pub struct SqliteMigrationExecutor {
    pool: SqlitePool,
    holder: String,
    lock_ttl: Duration,
}

impl SqliteMigrationExecutor {
    /// Wrap `pool`, creating the bookkeeping tables if needed.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_versions (
                version INTEGER PRIMARY KEY,
                filename TEXT NOT NULL,
                checksum TEXT NOT NULL,
                applied_at INTEGER NOT NULL,
                execution_time_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migration_locks (
                lock_key INTEGER PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            holder: uuid::Uuid::new_v4().to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
        })
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MigrationExecutor for SqliteMigrationExecutor {
    async fn execute_sql(&self, sql: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(sql)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>> {
        let rows: Vec<(i64, String, String, i64, i64)> = sqlx::query_as(
            "SELECT version, filename, checksum, applied_at, execution_time_ms \
             FROM schema_versions ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(version, filename, checksum, applied_at, execution_time_ms)| -> Result<MigrationRecord> {
                Ok(MigrationRecord {
                    version: u32::try_from(version)
                        .with_context(|| format!("invalid version {} in schema_versions", version))?,
                    filename,
                    checksum,
                    applied_at: DateTime::<Utc>::from_timestamp(applied_at, 0)
                        .unwrap_or_default(),
                    execution_time_ms,
                })
            })
            .collect()
    }

    async fn record_migration(&self, info: &MigrationInfo, execution_time_ms: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO schema_versions (version, filename, checksum, applied_at, execution_time_ms) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(i64::from(info.version))
        .bind(&info.filename)
        .bind(&info.checksum)
        .bind(Utc::now().timestamp())
        .bind(execution_time_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_migration_record(&self, version: u32) -> Result<()> {
        sqlx::query("DELETE FROM schema_versions WHERE version = ?")
            .bind(i64::from(version))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn acquire_advisory_lock(&self, lock_key: i64) -> Result<bool> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.lock_ttl.as_secs()).unwrap_or(i64::MAX);
        let stale: Option<String> = sqlx::query_scalar(
            "DELETE FROM migration_locks WHERE lock_key = ? AND acquired_at <= ? RETURNING holder",
        )
        .bind(lock_key)
        .bind(now.saturating_sub(ttl))
        .fetch_optional(&self.pool)
        .await?;
        if let Some(previous) = stale {
            warn!(lock_key, previous_holder = %previous, "taking over stale migration lock");
        }

        let result = sqlx::query(
            "INSERT OR IGNORE INTO migration_locks (lock_key, holder, acquired_at) VALUES (?, ?, ?)",
        )
        .bind(lock_key)
        .bind(&self.holder)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_advisory_lock(&self, lock_key: i64) -> Result<()> {
        sqlx::query("DELETE FROM migration_locks WHERE lock_key = ? AND holder = ?")
            .bind(lock_key)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
