//! Concurrent chunk writes.
//!
//! Two mechanisms, for two kinds of writer:
//!
//! * [`OptimisticLockService`] guards edits of a known chunk. The caller
//!   passes the version it read; the update applies only if the row still
//!   carries that version, and bumps it by one.
//! * [`ChunkWriteManager`] serves ingestion jobs that upsert by content
//!   hash. The row with the newer `updated_at` wins, and every conflict is
//!   recorded as a [`ConflictAuditEntry`] naming winner and loser.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{codes, BrainError};

#[async_trait]
pub trait OptimisticLockExecutor: Send + Sync {
    async fn chunk_version(&self, chunk_id: &str) -> Result<Option<i64>, BrainError>;

    /// Apply `updates` and bump the version in one atomic step. Returns
    /// `false` when the stored version differs from `expected_version`.
    async fn update_if_version_matches(
        &self,
        chunk_id: &str,
        expected_version: i64,
        updates: &Map<String, Value>,
    ) -> Result<bool, BrainError>;
}

pub struct OptimisticLockService<'a> {
    executor: &'a dyn OptimisticLockExecutor,
}

impl<'a> OptimisticLockService<'a> {
    pub fn new(executor: &'a dyn OptimisticLockExecutor) -> Self {
        Self { executor }
    }

    /// Returns the new version. `STALE_VERSION` is retryable: re-read and
    /// try again.
    pub async fn update(
        &self,
        chunk_id: &str,
        expected_version: i64,
        updates: &Map<String, Value>,
    ) -> Result<i64, BrainError> {
        let current = self.executor.chunk_version(chunk_id).await?;
        if current.is_none() {
            return Err(
                BrainError::knowledge(codes::CHUNK_NOT_FOUND, format!("chunk {chunk_id} not found"))
                    .with_context("chunk_id", chunk_id),
            );
        }

        if !self
            .executor
            .update_if_version_matches(chunk_id, expected_version, updates)
            .await?
        {
            return Err(BrainError::knowledge(
                codes::STALE_VERSION,
                format!("stale version for chunk {chunk_id}: provided {expected_version}"),
            )
            .with_context("chunk_id", chunk_id)
            .with_context("expected_version", expected_version)
            .with_retry_hint(true));
        }
        Ok(expected_version + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkUpsertData {
    pub content_hash: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
    pub job_id: String,
}

/// What the store did with one [`ChunkUpsertData`].
///
/// `previous_*` are set only when a row with the hash already existed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsertResult {
    pub content_hash: String,
    pub was_conflict: bool,
    /// The incoming write won (it was at least as new as the stored row).
    pub conflict_resolved: bool,
    pub previous_updated_at: Option<DateTime<Utc>>,
    pub previous_job_id: Option<String>,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictAuditEntry {
    pub content_hash: String,
    pub winner_job_id: String,
    pub loser_job_id: String,
    pub winner_updated_at: DateTime<Utc>,
    pub loser_updated_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
}

#[async_trait]
pub trait ChunkWriteExecutor: Send + Sync {
    /// Insert, or overwrite when `data.updated_at` is not older than the
    /// stored row. Must be atomic per hash.
    async fn upsert_chunk(&self, data: &ChunkUpsertData) -> Result<UpsertResult, BrainError>;
    async fn log_conflict(&self, entry: &ConflictAuditEntry) -> Result<(), BrainError>;
    async fn conflict_log(&self) -> Result<Vec<ConflictAuditEntry>, BrainError>;
}

pub struct ChunkWriteManager<'a> {
    executor: &'a dyn ChunkWriteExecutor,
}

impl<'a> ChunkWriteManager<'a> {
    pub fn new(executor: &'a dyn ChunkWriteExecutor) -> Self {
        Self { executor }
    }

    pub async fn write_chunk(&self, data: &ChunkUpsertData) -> Result<UpsertResult, BrainError> {
        let result = self.executor.upsert_chunk(data).await.map_err(|e| {
            BrainError::knowledge(codes::CONCURRENT_WRITE_ERROR, "chunk upsert failed")
                .with_context("content_hash", data.content_hash.as_str())
                .with_context("job_id", data.job_id.as_str())
                .with_source(e)
        })?;

        if let Some(entry) = audit_entry(data, &result) {
            self.executor.log_conflict(&entry).await?;
        }
        Ok(result)
    }

    pub async fn audit_log(&self) -> Result<Vec<ConflictAuditEntry>, BrainError> {
        self.executor.conflict_log().await
    }
}

fn audit_entry(data: &ChunkUpsertData, result: &UpsertResult) -> Option<ConflictAuditEntry> {
    if !result.was_conflict {
        return None;
    }
    let previous_job = result.previous_job_id.clone()?;
    let previous_at = result.previous_updated_at?;
    let (winner_job_id, loser_job_id, winner_updated_at, loser_updated_at) = if result.conflict_resolved {
        (data.job_id.clone(), previous_job, data.updated_at, previous_at)
    } else {
        (previous_job, data.job_id.clone(), previous_at, data.updated_at)
    };
    Some(ConflictAuditEntry {
        content_hash: result.content_hash.clone(),
        winner_job_id,
        loser_job_id,
        winner_updated_at,
        loser_updated_at,
        resolved_at: Utc::now(),
    })
}
