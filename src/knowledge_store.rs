//! SQLite storage for knowledge documents and chunks.
//!
//! [`SqliteKnowledgeStore`] implements the chunk executor traits from
//! `second_brain_core` over the tables created by
//! `004_knowledge_chunks.sql`: dedup lookups, lifecycle status, versioned
//! edits and last-write-wins upserts. [`SqliteTransactionExecutor`] pins a
//! single connection so `BEGIN`, savepoints and the statements between
//! them all run on the same session.
//!
//! Timestamps are stored as unix milliseconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info};

use second_brain_core::dedup::{content_hash, ChunkDeduplicator, ChunkRecord};
use second_brain_core::error::codes;
use second_brain_core::knowledge::{ChunkStatus, KnowledgeChunk, KnowledgeDocument};
use second_brain_core::lifecycle::{ChunkLifecycleExecutor, ChunkStatusRecord};
use second_brain_core::sanitize::sanitize_message;
use second_brain_core::transaction::TransactionExecutor;
use second_brain_core::writes::{
    ChunkUpsertData, ChunkWriteExecutor, ConflictAuditEntry, OptimisticLockExecutor, UpsertResult,
};
use second_brain_core::BrainError;

fn store_error(operation: &str, error: sqlx::Error) -> BrainError {
    BrainError::knowledge(
        codes::KNOWLEDGE_ERROR,
        format!("{operation} failed: {}", sanitize_message(&error.to_string(), &[])),
    )
    .with_context("operation", operation)
    .with_source(error)
}

fn decode_error(operation: &str, detail: impl std::fmt::Display) -> BrainError {
    BrainError::knowledge(codes::KNOWLEDGE_ERROR, format!("{operation}: {detail}"))
        .with_context("operation", operation)
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, BrainError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| decode_error("decode timestamp", ms))
}

fn metadata_json(metadata: &Map<String, Value>) -> String {
    Value::Object(metadata.clone()).to_string()
}

fn parse_metadata(raw: &str) -> Result<Map<String, Value>, BrainError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Ok(Map::new()),
        Err(e) => Err(decode_error("decode metadata_json", e)),
    }
}

#[derive(Clone)]
pub struct SqliteKnowledgeStore {
    pool: SqlitePool,
}

impl SqliteKnowledgeStore {
    /// `pool` must already carry the knowledge tables (`brain migrate apply`).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_document(&self, doc: &KnowledgeDocument) -> Result<(), BrainError> {
        sqlx::query(
            "INSERT INTO knowledge_documents \
             (id, title, knowledge_type, source_origin, source_url, author, raw_content, metadata_json, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(doc.id.to_string())
        .bind(&doc.title)
        .bind(doc.knowledge_type.as_str())
        .bind(doc.source_origin.as_str())
        .bind(&doc.source_url)
        .bind(&doc.author)
        .bind(&doc.raw_content)
        .bind(metadata_json(&doc.metadata))
        .bind(doc.created_at.timestamp_millis())
        .bind(doc.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("insert document", e))?;
        Ok(())
    }

    /// Chunk count per status, for reporting.
    pub async fn count_chunks(&self, status: ChunkStatus) -> Result<i64, BrainError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_chunks WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| store_error("count chunks", e))
    }

    pub async fn chunk_embedding(&self, chunk_id: &str) -> Result<Option<Vec<f32>>, BrainError> {
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT embedding_json FROM knowledge_chunks WHERE id = ?")
                .bind(chunk_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| store_error("load embedding", e))?;
        match raw.flatten() {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| decode_error("decode embedding_json", e)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ChunkDeduplicator for SqliteKnowledgeStore {
    async fn find_by_content_hash(&self, hash: &str) -> Result<Option<ChunkRecord>, BrainError> {
        let row: Option<(String, String, String, String)> = sqlx::query_as(
            "SELECT id, content_hash, status, metadata_json FROM knowledge_chunks WHERE content_hash = ?",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_error("find chunk by hash", e))?;

        row.map(|(id, content_hash, status, metadata)| {
            Ok(ChunkRecord {
                id,
                content_hash,
                status: status.parse()?,
                metadata: parse_metadata(&metadata)?,
            })
        })
        .transpose()
    }

    async fn insert_chunk(
        &self,
        chunk: &KnowledgeChunk,
        embedding: Option<&[f32]>,
    ) -> Result<String, BrainError> {
        let hash = chunk
            .content_hash
            .clone()
            .unwrap_or_else(|| content_hash(&chunk.content));
        let embedding_json = embedding
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| decode_error("encode embedding", e))?;
        let id = chunk.id.to_string();
        let chunk_index = i64::try_from(chunk.chunk_index).unwrap_or(i64::MAX);

        sqlx::query(
            "INSERT INTO knowledge_chunks \
             (id, document_id, content, content_hash, knowledge_type, chunk_index, source_origin, status, version, embedding_json, metadata_json, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(chunk.document_id.map(|d| d.to_string()))
        .bind(&chunk.content)
        .bind(&hash)
        .bind(chunk.knowledge_type.as_str())
        .bind(chunk_index)
        .bind(chunk.source_origin.as_str())
        .bind(chunk.status.as_str())
        .bind(chunk.version)
        .bind(embedding_json)
        .bind(metadata_json(&chunk.metadata))
        .bind(chunk.created_at.timestamp_millis())
        .bind(chunk.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("insert chunk", e))?;

        debug!(chunk_id = %id, content_hash = %hash, "chunk inserted");
        Ok(id)
    }

    async fn update_metadata(&self, chunk_id: &str, metadata: &Map<String, Value>) -> Result<(), BrainError> {
        sqlx::query("UPDATE knowledge_chunks SET metadata_json = ?, updated_at = ? WHERE id = ?")
            .bind(metadata_json(metadata))
            .bind(Utc::now().timestamp_millis())
            .bind(chunk_id)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("update chunk metadata", e))?;
        Ok(())
    }

    async fn mark_superseded(&self, chunk_id: &str) -> Result<(), BrainError> {
        self.set_chunk_status(chunk_id, ChunkStatus::Superseded).await
    }
}

#[async_trait]
impl ChunkLifecycleExecutor for SqliteKnowledgeStore {
    async fn chunk_status(&self, chunk_id: &str) -> Result<Option<ChunkStatus>, BrainError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM knowledge_chunks WHERE id = ?")
                .bind(chunk_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| store_error("load chunk status", e))?;
        status.map(|s| s.parse()).transpose()
    }

    async fn set_chunk_status(&self, chunk_id: &str, status: ChunkStatus) -> Result<(), BrainError> {
        let result = sqlx::query("UPDATE knowledge_chunks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(chunk_id)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("update chunk status", e))?;
        if result.rows_affected() == 0 {
            return Err(
                BrainError::knowledge(codes::CHUNK_NOT_FOUND, format!("chunk {chunk_id} not found"))
                    .with_context("chunk_id", chunk_id),
            );
        }
        info!(chunk_id, status = status.as_str(), "chunk status changed");
        Ok(())
    }

    async fn active_chunks(&self, limit: usize) -> Result<Vec<ChunkStatusRecord>, BrainError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM knowledge_chunks WHERE status = 'active' \
             ORDER BY created_at, chunk_index LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("list active chunks", e))?;
        Ok(ids
            .into_iter()
            .map(|id| ChunkStatusRecord {
                id,
                status: ChunkStatus::Active,
            })
            .collect())
    }
}

#[async_trait]
impl OptimisticLockExecutor for SqliteKnowledgeStore {
    async fn chunk_version(&self, chunk_id: &str) -> Result<Option<i64>, BrainError> {
        sqlx::query_scalar("SELECT version FROM knowledge_chunks WHERE id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error("load chunk version", e))
    }

    /// Accepts `content` (string) and `metadata` (object) updates. A new
    /// `content` also refreshes `content_hash`.
    async fn update_if_version_matches(
        &self,
        chunk_id: &str,
        expected_version: i64,
        updates: &Map<String, Value>,
    ) -> Result<bool, BrainError> {
        if let Some(key) = updates.keys().find(|k| !matches!(k.as_str(), "content" | "metadata")) {
            return Err(BrainError::invalid_request(format!("cannot update chunk field '{key}'"))
                .with_context("field", key.as_str()));
        }
        let content = updates.get("content").and_then(Value::as_str);
        let metadata = updates.get("metadata").and_then(Value::as_object).map(metadata_json);

        let result = sqlx::query(
            "UPDATE knowledge_chunks SET \
                content = COALESCE(?, content), \
                content_hash = COALESCE(?, content_hash), \
                metadata_json = COALESCE(?, metadata_json), \
                version = version + 1, \
                updated_at = ? \
             WHERE id = ? AND version = ?",
        )
        .bind(content)
        .bind(content.map(content_hash))
        .bind(metadata)
        .bind(Utc::now().timestamp_millis())
        .bind(chunk_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("versioned chunk update", e))?;
        Ok(result.rows_affected() == 1)
    }
}

impl SqliteKnowledgeStore {
    async fn upsert_locked(
        conn: &mut SqliteConnection,
        data: &ChunkUpsertData,
    ) -> Result<UpsertResult, BrainError> {
        let previous: Option<(i64, Option<String>)> =
            sqlx::query_as("SELECT updated_at, job_id FROM knowledge_chunks WHERE content_hash = ?")
                .bind(&data.content_hash)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| store_error("load chunk for upsert", e))?;
        let incoming = data.updated_at.timestamp_millis();

        let Some((stored_at, stored_job)) = previous else {
            let chunk = KnowledgeChunk::new(data.content.clone());
            sqlx::query(
                "INSERT INTO knowledge_chunks \
                 (id, content, content_hash, knowledge_type, source_origin, metadata_json, job_id, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(chunk.id.to_string())
            .bind(&data.content)
            .bind(&data.content_hash)
            .bind(chunk.knowledge_type.as_str())
            .bind(chunk.source_origin.as_str())
            .bind(metadata_json(&data.metadata))
            .bind(&data.job_id)
            .bind(chunk.created_at.timestamp_millis())
            .bind(incoming)
            .execute(&mut *conn)
            .await
            .map_err(|e| store_error("insert chunk for upsert", e))?;
            return Ok(UpsertResult {
                content_hash: data.content_hash.clone(),
                was_conflict: false,
                conflict_resolved: false,
                previous_updated_at: None,
                previous_job_id: None,
                job_id: data.job_id.clone(),
            });
        };

        let wins = incoming >= stored_at;
        if wins {
            sqlx::query(
                "UPDATE knowledge_chunks SET content = ?, metadata_json = ?, job_id = ?, \
                 updated_at = ?, version = version + 1 WHERE content_hash = ?",
            )
            .bind(&data.content)
            .bind(metadata_json(&data.metadata))
            .bind(&data.job_id)
            .bind(incoming)
            .bind(&data.content_hash)
            .execute(&mut *conn)
            .await
            .map_err(|e| store_error("overwrite chunk for upsert", e))?;
        }
        Ok(UpsertResult {
            content_hash: data.content_hash.clone(),
            was_conflict: true,
            conflict_resolved: wins,
            previous_updated_at: Some(from_millis(stored_at)?),
            previous_job_id: stored_job,
            job_id: data.job_id.clone(),
        })
    }
}

#[async_trait]
impl ChunkWriteExecutor for SqliteKnowledgeStore {
    /// Runs under `BEGIN IMMEDIATE`, so the read and the write see the same row.
    async fn upsert_chunk(&self, data: &ChunkUpsertData) -> Result<UpsertResult, BrainError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| store_error("acquire connection", e))?;
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql("BEGIN IMMEDIATE"))
            .await
            .map_err(|e| store_error("begin upsert", e))?;

        match Self::upsert_locked(&mut conn, data).await {
            Ok(result) => {
                sqlx::Executor::execute(&mut *conn, sqlx::raw_sql("COMMIT"))
                    .await
                    .map_err(|e| store_error("commit upsert", e))?;
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback_error) = sqlx::Executor::execute(&mut *conn, sqlx::raw_sql("ROLLBACK")).await {
                    debug!(error = %rollback_error, "rollback after failed upsert");
                }
                Err(e)
            }
        }
    }

    async fn log_conflict(&self, entry: &ConflictAuditEntry) -> Result<(), BrainError> {
        sqlx::query(
            "INSERT INTO chunk_write_conflicts \
             (content_hash, winner_job_id, loser_job_id, winner_updated_at, loser_updated_at, resolved_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.content_hash)
        .bind(&entry.winner_job_id)
        .bind(&entry.loser_job_id)
        .bind(entry.winner_updated_at.timestamp_millis())
        .bind(entry.loser_updated_at.timestamp_millis())
        .bind(entry.resolved_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("log write conflict", e))?;
        info!(
            content_hash = %entry.content_hash,
            winner = %entry.winner_job_id,
            loser = %entry.loser_job_id,
            "chunk write conflict resolved"
        );
        Ok(())
    }

    async fn conflict_log(&self) -> Result<Vec<ConflictAuditEntry>, BrainError> {
        let rows: Vec<(String, String, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT content_hash, winner_job_id, loser_job_id, winner_updated_at, loser_updated_at, resolved_at \
             FROM chunk_write_conflicts ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_error("load conflict log", e))?;

        rows.into_iter()
            .map(|(content_hash, winner_job_id, loser_job_id, winner_at, loser_at, resolved_at)| {
                Ok(ConflictAuditEntry {
                    content_hash,
                    winner_job_id,
                    loser_job_id,
                    winner_updated_at: from_millis(winner_at)?,
                    loser_updated_at: from_millis(loser_at)?,
                    resolved_at: from_millis(resolved_at)?,
                })
            })
            .collect()
    }
}

/// [`TransactionExecutor`] bound to one pooled connection.
pub struct SqliteTransactionExecutor {
    conn: Mutex<PoolConnection<Sqlite>>,
}

impl SqliteTransactionExecutor {
    pub async fn new(pool: &SqlitePool) -> Result<Self, BrainError> {
        let conn = pool
            .acquire()
            .await
            .map_err(|e| store_error("acquire connection", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    async fn run(&self, operation: &str, sql: &str) -> Result<u64, BrainError> {
        let mut conn = self.conn.lock().await;
        let result = sqlx::Executor::execute(&mut **conn, sqlx::raw_sql(sql))
            .await
            .map_err(|e| {
                BrainError::transaction(format!(
                    "{operation} failed: {}",
                    sanitize_message(&e.to_string(), &[])
                ))
                .with_context("operation", operation)
                .with_source(e)
            })?;
        Ok(result.rows_affected())
    }
}

fn savepoint_sql(verb: &str, name: &str) -> Result<String, BrainError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BrainError::transaction(format!("invalid savepoint name '{name}'")));
    }
    Ok(format!("{verb} {name}"))
}

#[async_trait]
impl TransactionExecutor for SqliteTransactionExecutor {
    async fn begin(&self) -> Result<(), BrainError> {
        self.run("begin", "BEGIN").await.map(drop)
    }

    async fn commit(&self) -> Result<(), BrainError> {
        self.run("commit", "COMMIT").await.map(drop)
    }

    async fn rollback(&self) -> Result<(), BrainError> {
        self.run("rollback", "ROLLBACK").await.map(drop)
    }

    async fn create_savepoint(&self, name: &str) -> Result<(), BrainError> {
        self.run("savepoint", &savepoint_sql("SAVEPOINT", name)?).await.map(drop)
    }

    async fn release_savepoint(&self, name: &str) -> Result<(), BrainError> {
        self.run("release savepoint", &savepoint_sql("RELEASE SAVEPOINT", name)?)
            .await
            .map(drop)
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<(), BrainError> {
        self.run(
            "rollback to savepoint",
            &savepoint_sql("ROLLBACK TO SAVEPOINT", name)?,
        )
        .await
        .map(drop)
    }

    async fn execute(&self, sql: &str) -> Result<u64, BrainError> {
        self.run("execute", sql).await
    }
}
