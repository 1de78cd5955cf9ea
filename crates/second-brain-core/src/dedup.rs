//! Content-hash deduplication for chunk writes.
//!
//! Identical content is stored once. Writing a chunk whose SHA-256 already
//! exists merges the new metadata into the existing row instead of
//! inserting. When two writers race past the lookup, the loser's insert
//! fails on the unique hash and is resolved as a duplicate of the winner.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{codes, BrainError};
use crate::knowledge::{ChunkStatus, KnowledgeChunk};

/// Lowercase hex SHA-256 of `content`.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub id: String,
    pub content_hash: String,
    pub status: ChunkStatus,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeduplicationResult {
    pub content_hash: String,
    pub chunk_id: String,
    pub is_duplicate: bool,
    pub metadata_updated: bool,
}

#[async_trait]
pub trait ChunkDeduplicator: Send + Sync {
    async fn find_by_content_hash(&self, content_hash: &str) -> Result<Option<ChunkRecord>, BrainError>;

    /// Insert `chunk` (its `content_hash` is set) and return the stored id.
    /// Must fail when the hash already exists.
    async fn insert_chunk(
        &self,
        chunk: &KnowledgeChunk,
        embedding: Option<&[f32]>,
    ) -> Result<String, BrainError>;

    async fn update_metadata(&self, chunk_id: &str, metadata: &Map<String, Value>) -> Result<(), BrainError>;

    async fn mark_superseded(&self, chunk_id: &str) -> Result<(), BrainError>;
}

pub struct DeduplicationService<'a> {
    store: &'a dyn ChunkDeduplicator,
}

impl<'a> DeduplicationService<'a> {
    pub fn new(store: &'a dyn ChunkDeduplicator) -> Self {
        Self { store }
    }

    /// Store `chunk` unless its content is already present.
    pub async fn upsert_chunk(
        &self,
        mut chunk: KnowledgeChunk,
        embedding: Option<&[f32]>,
    ) -> Result<DeduplicationResult, BrainError> {
        let hash = content_hash(&chunk.content);
        if let Some(existing) = self.store.find_by_content_hash(&hash).await? {
            return self.merge_into(existing, &chunk.metadata).await;
        }

        chunk.content_hash = Some(hash.clone());
        match self.store.insert_chunk(&chunk, embedding).await {
            Ok(chunk_id) => Ok(DeduplicationResult {
                content_hash: hash,
                chunk_id,
                is_duplicate: false,
                metadata_updated: false,
            }),
            Err(insert_error) => match self.store.find_by_content_hash(&hash).await? {
                Some(existing) => self.merge_into(existing, &chunk.metadata).await,
                None => Err(BrainError::knowledge(
                    codes::DEDUPLICATION_ERROR,
                    "chunk insert failed and no row holds its hash",
                )
                .with_context("content_hash", hash)
                .with_source(insert_error)),
            },
        }
    }

    /// Mark `old_chunk_id` superseded, then store `replacement`.
    pub async fn supersede_chunk(
        &self,
        old_chunk_id: &str,
        replacement: KnowledgeChunk,
        embedding: Option<&[f32]>,
    ) -> Result<DeduplicationResult, BrainError> {
        self.store.mark_superseded(old_chunk_id).await?;
        self.upsert_chunk(replacement, embedding).await
    }

    async fn merge_into(
        &self,
        existing: ChunkRecord,
        metadata: &Map<String, Value>,
    ) -> Result<DeduplicationResult, BrainError> {
        let changed = metadata
            .iter()
            .any(|(k, v)| existing.metadata.get(k) != Some(v));
        if changed {
            let mut merged = existing.metadata.clone();
            merged.extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
            self.store.update_metadata(&existing.id, &merged).await?;
        }
        Ok(DeduplicationResult {
            content_hash: existing.content_hash,
            chunk_id: existing.id,
            is_duplicate: true,
            metadata_updated: changed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryChunks {
        rows: Mutex<Vec<ChunkRecord>>,
        /// Simulates a concurrent writer landing the same hash first.
        race_on_insert: AtomicBool,
        fail_insert: AtomicBool,
    }

    #[async_trait]
    impl ChunkDeduplicator for MemoryChunks {
        async fn find_by_content_hash(&self, content_hash: &str) -> Result<Option<ChunkRecord>, BrainError> {
            let rows = self.rows.lock().unwrap();
            Ok(rows.iter().find(|r| r.content_hash == content_hash).cloned())
        }

        async fn insert_chunk(
            &self,
            chunk: &KnowledgeChunk,
            _embedding: Option<&[f32]>,
        ) -> Result<String, BrainError> {
            let hash = chunk.content_hash.clone().unwrap();
            let mut rows = self.rows.lock().unwrap();
            if self.race_on_insert.load(Ordering::SeqCst) {
                rows.push(ChunkRecord {
                    id: "winner".into(),
                    content_hash: hash.clone(),
                    status: ChunkStatus::Active,
                    metadata: Map::new(),
                });
            }
            if self.fail_insert.load(Ordering::SeqCst) || rows.iter().any(|r| r.content_hash == hash) {
                return Err(BrainError::ingestion("UNIQUE constraint failed"));
            }
            rows.push(ChunkRecord {
                id: chunk.id.to_string(),
                content_hash: hash,
                status: ChunkStatus::Active,
                metadata: chunk.metadata.clone(),
            });
            Ok(chunk.id.to_string())
        }

        async fn update_metadata(&self, chunk_id: &str, metadata: &Map<String, Value>) -> Result<(), BrainError> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.iter_mut().find(|r| r.id == chunk_id) {
                row.metadata = metadata.clone();
            }
            Ok(())
        }

        async fn mark_superseded(&self, chunk_id: &str) -> Result<(), BrainError> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.iter_mut().find(|r| r.id == chunk_id) {
                row.status = ChunkStatus::Superseded;
            }
            Ok(())
        }
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_duplicate_hash_not_inserted_twice() {
        let store = MemoryChunks::default();
        let dedup = DeduplicationService::new(&store);

        let first = dedup.upsert_chunk(KnowledgeChunk::new("same text"), None).await.unwrap();
        assert!(!first.is_duplicate);

        let second = dedup
            .upsert_chunk(KnowledgeChunk::new("same text").with_metadata("source", "inbox"), None)
            .await
            .unwrap();
        assert!(second.is_duplicate);
        assert!(second.metadata_updated);
        assert_eq!(second.chunk_id, first.chunk_id);

        let rows = store.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metadata["source"], "inbox");
    }

    #[tokio::test]
    async fn test_unchanged_metadata_skips_update() {
        let store = MemoryChunks::default();
        let dedup = DeduplicationService::new(&store);
        dedup.upsert_chunk(KnowledgeChunk::new("x").with_metadata("a", 1), None).await.unwrap();
        let again = dedup.upsert_chunk(KnowledgeChunk::new("x").with_metadata("a", 1), None).await.unwrap();
        assert!(again.is_duplicate);
        assert!(!again.metadata_updated);
    }

    #[tokio::test]
    async fn test_lost_insert_race_resolves_to_winner() {
        let store = MemoryChunks::default();
        store.race_on_insert.store(true, Ordering::SeqCst);
        let dedup = DeduplicationService::new(&store);

        let out = dedup.upsert_chunk(KnowledgeChunk::new("contended"), None).await.unwrap();
        assert!(out.is_duplicate);
        assert_eq!(out.chunk_id, "winner");
    }

    #[tokio::test]
    async fn test_failed_insert_without_winner_is_an_error() {
        let store = MemoryChunks::default();
        store.fail_insert.store(true, Ordering::SeqCst);
        let dedup = DeduplicationService::new(&store);

        let err = dedup.upsert_chunk(KnowledgeChunk::new("doomed"), None).await.unwrap_err();
        assert_eq!(err.code(), codes::DEDUPLICATION_ERROR);
        assert_eq!(err.context()["content_hash"], content_hash("doomed"));
    }

    #[tokio::test]
    async fn test_supersede_marks_old_row() {
        let store = MemoryChunks::default();
        let dedup = DeduplicationService::new(&store);
        let old = dedup.upsert_chunk(KnowledgeChunk::new("v1"), None).await.unwrap();
        let new = dedup.supersede_chunk(&old.chunk_id, KnowledgeChunk::new("v2"), None).await.unwrap();

        let rows = store.rows.lock().unwrap();
        assert_eq!(rows[0].status, ChunkStatus::Superseded);
        assert_eq!(rows[1].id, new.chunk_id);
        assert_eq!(rows[1].status, ChunkStatus::Active);
    }
}
