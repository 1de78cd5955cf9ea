//! Migration apply and rollback.
//!
//! The [`MigrationRunner`] drives a [`MigrationExecutor`] (the database
//! side) using the files a [`SchemaManager`] discovers. Every mutating
//! operation runs under a single advisory lock keyed by
//! [`MIGRATION_LOCK_KEY`], taken before applied records are read and
//! released on every exit path.
//!
//! # File format
//!
//! A migration file holds forward SQL, optionally followed by a rollback
//! section introduced by a `-- rollback:` marker (matched
//! case-insensitively):
//!
//! ```sql
//! CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
//!
//! -- rollback:
//! DROP TABLE tags;
//! ```
//!
//! # Failure semantics
//!
//! - Lock not acquired: unsuccessful [`MigrationResult`], no error.
//! - Critical drift: `SCHEMA_DRIFT` error, nothing executed.
//! - A migration fails: unsuccessful result listing the migrations that
//!   were applied before it. Later migrations are not attempted.
//! - Rollback with nothing applied, a missing file, or no rollback
//!   statements: `NO_MIGRATIONS`, `MIGRATION_FILE_NOT_FOUND`, or
//!   `NO_ROLLBACK_SQL`.

use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use second_brain_core::drift::{pending_migrations, MigrationInfo, MigrationRecord};
use second_brain_core::error::{codes, BrainError};
use serde::Serialize;
use tracing::{info, warn};

use crate::schema::SchemaManager;

/// Advisory lock key shared by every migration process.
pub const MIGRATION_LOCK_KEY: i64 = 728_349_261;

const ROLLBACK_MARKER: &str = "-- rollback:";

/// Database operations needed to apply and roll back migrations.
#[async_trait]
pub trait MigrationExecutor: Send + Sync {
    async fn execute_sql(&self, sql: &str) -> Result<()>;

    async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>>;

    async fn record_migration(&self, info: &MigrationInfo, execution_time_ms: i64) -> Result<()>;

    async fn remove_migration_record(&self, version: u32) -> Result<()>;

    /// Returns `false` if another holder owns the lock.
    async fn acquire_advisory_lock(&self, lock_key: i64) -> Result<bool>;

    async fn release_advisory_lock(&self, lock_key: i64) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MigrationResult {
    pub success: bool,
    pub applied: Vec<MigrationInfo>,
    pub rolled_back: Vec<MigrationInfo>,
    pub dry_run: bool,
    pub error: Option<String>,
    pub pending_count: usize,
}

impl MigrationResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Index of the rollback marker, matched ASCII case-insensitively.
fn marker_index(sql: &str) -> Option<usize> {
    sql.to_ascii_lowercase().find(ROLLBACK_MARKER)
}

/// SQL before the rollback marker, trailing whitespace trimmed. Without a
/// marker the whole file is returned unchanged.
pub fn extract_forward_sql(sql: &str) -> &str {
    match marker_index(sql) {
        Some(idx) => sql[..idx].trim_end(),
        None => sql,
    }
}

/// SQL after the rollback marker, or `None` if there is no marker or the
/// section holds only comments and blank lines.
pub fn extract_rollback_sql(sql: &str) -> Option<&str> {
    let idx = marker_index(sql)?;
    let rollback = sql[idx + ROLLBACK_MARKER.len()..].trim();
    let has_statement = rollback.lines().any(|line| {
        let line = line.trim();
        !line.is_empty() && !line.starts_with("--")
    });
    has_statement.then_some(rollback)
}

pub struct MigrationRunner<E> {
    schema: SchemaManager,
    executor: E,
}

impl<E: MigrationExecutor> MigrationRunner<E> {
    pub fn new(schema: SchemaManager, executor: E) -> Self {
        Self { schema, executor }
    }

    pub fn schema(&self) -> &SchemaManager {
        &self.schema
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Migrations on disk with no applied record, ascending by version.
    pub fn pending(&self, applied: &[MigrationRecord]) -> Result<Vec<MigrationInfo>> {
        let expected = self.schema.scan_migrations()?;
        Ok(pending_migrations(&expected, applied))
    }

    /// Apply every pending migration in version order.
    ///
    /// With `dry_run`, nothing is executed and no lock is taken: the
    /// result lists what would be applied.
    pub async fn apply_pending(&self, dry_run: bool) -> Result<MigrationResult> {
        if dry_run {
            return self.dry_run().await;
        }

        if !self.executor.acquire_advisory_lock(MIGRATION_LOCK_KEY).await? {
            warn!(lock_key = MIGRATION_LOCK_KEY, "migration lock held elsewhere");
            return Ok(MigrationResult::failed(
                "Could not acquire migration lock. Another migration may be running.",
            ));
        }

        let outcome = self.apply_locked().await;
        self.release(outcome).await
    }

    /// Roll back the highest applied version.
    pub async fn rollback_last(&self) -> Result<MigrationResult> {
        if !self.executor.acquire_advisory_lock(MIGRATION_LOCK_KEY).await? {
            warn!(lock_key = MIGRATION_LOCK_KEY, "migration lock held elsewhere");
            return Ok(MigrationResult::failed(
                "Could not acquire migration lock for rollback.",
            ));
        }

        let outcome = self.rollback_locked().await;
        self.release(outcome).await
    }

    async fn release(&self, outcome: Result<MigrationResult>) -> Result<MigrationResult> {
        let released = self.executor.release_advisory_lock(MIGRATION_LOCK_KEY).await;
        match (outcome, released) {
            (Ok(result), Ok(())) => Ok(result),
            (Ok(_), Err(e)) => Err(e.context("Failed to release migration lock")),
            (Err(e), released) => {
                if let Err(release_err) = released {
                    warn!(error = %release_err, "failed to release migration lock after error");
                }
                Err(e)
            }
        }
    }

    async fn apply_locked(&self) -> Result<MigrationResult> {
        let applied = self.executor.applied_migrations().await?;
        self.schema.validate_schema_integrity(&applied)?;

        let pending = self.pending(&applied)?;
        if pending.is_empty() {
            info!("no pending migrations");
            return Ok(MigrationResult {
                success: true,
                ..MigrationResult::default()
            });
        }

        let total = pending.len();
        let mut done: Vec<MigrationInfo> = Vec::with_capacity(total);
        for migration in pending {
            let path = self.schema.migrations_dir().join(&migration.filename);
            let sql = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read migration {}", path.display()))?;
            let forward = extract_forward_sql(&sql);

            let started = Instant::now();
            if let Err(e) = self.executor.execute_sql(forward).await {
                warn!(filename = %migration.filename, error = %e, "migration failed");
                return Ok(MigrationResult {
                    success: false,
                    pending_count: total - done.len(),
                    applied: done,
                    error: Some(format!("Migration {} failed: {}", migration.filename, e)),
                    ..MigrationResult::default()
                });
            }
            let elapsed_ms = started.elapsed().as_millis() as i64;

            self.executor.record_migration(&migration, elapsed_ms).await?;
            info!(
                filename = %migration.filename,
                version = migration.version,
                time_ms = elapsed_ms,
                "migration applied"
            );
            done.push(migration);
        }

        Ok(MigrationResult {
            success: true,
            applied: done,
            ..MigrationResult::default()
        })
    }

    async fn rollback_locked(&self) -> Result<MigrationResult> {
        let applied = self.executor.applied_migrations().await?;
        let Some(last) = applied.iter().max_by_key(|r| r.version) else {
            return Err(BrainError::schema(
                codes::NO_MIGRATIONS,
                "No applied migrations to rollback",
            )
            .into());
        };

        let expected = self.schema.scan_migrations()?;
        let Some(info) = expected.into_iter().find(|m| m.version == last.version) else {
            return Err(BrainError::schema(
                codes::MIGRATION_FILE_NOT_FOUND,
                format!("Migration file for version {} not found", last.version),
            )
            .with_context("version", last.version)
            .with_context("filename", last.filename.as_str())
            .into());
        };

        let path = self.schema.migrations_dir().join(&info.filename);
        let sql = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read migration {}", path.display()))?;
        let Some(rollback) = extract_rollback_sql(&sql) else {
            return Err(BrainError::schema(
                codes::NO_ROLLBACK_SQL,
                format!("No rollback section found in {}", info.filename),
            )
            .with_context("filename", info.filename.as_str())
            .into());
        };

        self.executor.execute_sql(rollback).await?;
        self.executor.remove_migration_record(last.version).await?;
        info!(filename = %info.filename, version = info.version, "migration rolled back");

        Ok(MigrationResult {
            success: true,
            rolled_back: vec![info],
            ..MigrationResult::default()
        })
    }

    async fn dry_run(&self) -> Result<MigrationResult> {
        let applied = self.executor.applied_migrations().await?;
        let pending = self.pending(&applied)?;
        for migration in &pending {
            info!(filename = %migration.filename, version = migration.version, "dry run would apply");
        }
        Ok(MigrationResult {
            success: true,
            pending_count: pending.len(),
            applied: pending,
            dry_run: true,
            ..MigrationResult::default()
        })
    }
}
