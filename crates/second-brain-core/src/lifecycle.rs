//! Chunk lifecycle state machine.
//!
//! | From | Allowed targets |
//! |------|-----------------|
//! | `active` | `superseded`, `archived`, `deleted` |
//! | `superseded` | `deleted` |
//! | `archived` | `active`, `deleted` |
//! | `deleted` | `active` |
//!
//! Deletion is soft: a deleted chunk keeps its row and can be restored.
//! A superseded chunk cannot come back; its replacement carries the content.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{codes, BrainError};
use crate::knowledge::ChunkStatus;

/// Whether `from -> to` is a legal lifecycle step. Same-state steps are not.
pub fn is_valid_transition(from: ChunkStatus, to: ChunkStatus) -> bool {
    use ChunkStatus::*;
    matches!(
        (from, to),
        (Active, Superseded | Archived | Deleted)
            | (Superseded, Deleted)
            | (Archived, Active | Deleted)
            | (Deleted, Active)
    )
}

/// Targets reachable from `from` in one step.
pub fn allowed_targets(from: ChunkStatus) -> Vec<ChunkStatus> {
    [
        ChunkStatus::Active,
        ChunkStatus::Superseded,
        ChunkStatus::Archived,
        ChunkStatus::Deleted,
    ]
    .into_iter()
    .filter(|to| is_valid_transition(from, *to))
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkStatusRecord {
    pub id: String,
    pub status: ChunkStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionOutcome {
    pub chunk_id: String,
    pub from: ChunkStatus,
    pub to: ChunkStatus,
}

/// Storage seam for the lifecycle service.
#[async_trait]
pub trait ChunkLifecycleExecutor: Send + Sync {
    async fn chunk_status(&self, chunk_id: &str) -> Result<Option<ChunkStatus>, BrainError>;
    async fn set_chunk_status(&self, chunk_id: &str, status: ChunkStatus) -> Result<(), BrainError>;
    async fn active_chunks(&self, limit: usize) -> Result<Vec<ChunkStatusRecord>, BrainError>;
}

pub struct ChunkLifecycleService<'a> {
    executor: &'a dyn ChunkLifecycleExecutor,
}

impl<'a> ChunkLifecycleService<'a> {
    pub fn new(executor: &'a dyn ChunkLifecycleExecutor) -> Self {
        Self { executor }
    }

    /// Move `chunk_id` to `to`.
    ///
    /// Fails with `CHUNK_NOT_FOUND`, `NO_OP_TRANSITION` when the chunk is
    /// already in `to`, or `INVALID_TRANSITION` for a step outside the
    /// table. Nothing is written on failure.
    pub async fn transition(
        &self,
        chunk_id: &str,
        to: ChunkStatus,
    ) -> Result<TransitionOutcome, BrainError> {
        let from = self.executor.chunk_status(chunk_id).await?.ok_or_else(|| {
            BrainError::knowledge(codes::CHUNK_NOT_FOUND, format!("chunk {chunk_id} not found"))
                .with_context("chunk_id", chunk_id)
        })?;

        if from == to {
            return Err(BrainError::knowledge(
                codes::NO_OP_TRANSITION,
                format!("chunk {chunk_id} is already {to}"),
            )
            .with_context("chunk_id", chunk_id)
            .with_context("status", to.as_str()));
        }
        if !is_valid_transition(from, to) {
            let allowed: Vec<&str> = allowed_targets(from).iter().map(|s| s.as_str()).collect();
            return Err(BrainError::knowledge(
                codes::INVALID_TRANSITION,
                format!("cannot move chunk {chunk_id} from {from} to {to}"),
            )
            .with_context("chunk_id", chunk_id)
            .with_context("from", from.as_str())
            .with_context("to", to.as_str())
            .with_context("allowed", allowed));
        }

        self.executor.set_chunk_status(chunk_id, to).await?;
        Ok(TransitionOutcome {
            chunk_id: chunk_id.to_string(),
            from,
            to,
        })
    }

    pub async fn archive(&self, chunk_id: &str) -> Result<TransitionOutcome, BrainError> {
        self.transition(chunk_id, ChunkStatus::Archived).await
    }

    pub async fn delete(&self, chunk_id: &str) -> Result<TransitionOutcome, BrainError> {
        self.transition(chunk_id, ChunkStatus::Deleted).await
    }

    pub async fn restore(&self, chunk_id: &str) -> Result<TransitionOutcome, BrainError> {
        self.transition(chunk_id, ChunkStatus::Active).await
    }

    pub async fn supersede(&self, chunk_id: &str) -> Result<TransitionOutcome, BrainError> {
        self.transition(chunk_id, ChunkStatus::Superseded).await
    }

    pub async fn active_chunks(&self, limit: usize) -> Result<Vec<ChunkStatusRecord>, BrainError> {
        self.executor.active_chunks(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStatuses {
        rows: Mutex<BTreeMap<String, ChunkStatus>>,
        writes: Mutex<usize>,
    }

    impl MemoryStatuses {
        fn with(id: &str, status: ChunkStatus) -> Self {
            let store = Self::default();
            store.rows.lock().unwrap().insert(id.to_string(), status);
            store
        }
    }

    #[async_trait]
    impl ChunkLifecycleExecutor for MemoryStatuses {
        async fn chunk_status(&self, chunk_id: &str) -> Result<Option<ChunkStatus>, BrainError> {
            Ok(self.rows.lock().unwrap().get(chunk_id).copied())
        }

        async fn set_chunk_status(&self, chunk_id: &str, status: ChunkStatus) -> Result<(), BrainError> {
            *self.writes.lock().unwrap() += 1;
            self.rows.lock().unwrap().insert(chunk_id.to_string(), status);
            Ok(())
        }

        async fn active_chunks(&self, limit: usize) -> Result<Vec<ChunkStatusRecord>, BrainError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, s)| **s == ChunkStatus::Active)
                .take(limit)
                .map(|(id, status)| ChunkStatusRecord { id: id.clone(), status: *status })
                .collect())
        }
    }

    #[test]
    fn test_transition_table() {
        use ChunkStatus::*;
        assert!(is_valid_transition(Active, Archived));
        assert!(is_valid_transition(Deleted, Active));
        assert!(!is_valid_transition(Superseded, Active));
        assert!(!is_valid_transition(Archived, Superseded));
        assert!(!is_valid_transition(Active, Active));
        assert_eq!(allowed_targets(Superseded), vec![Deleted]);
        assert_eq!(allowed_targets(Archived), vec![Active, Deleted]);
    }

    #[tokio::test]
    async fn test_archive_then_restore() {
        let store = MemoryStatuses::with("c1", ChunkStatus::Active);
        let lifecycle = ChunkLifecycleService::new(&store);

        let out = lifecycle.archive("c1").await.unwrap();
        assert_eq!((out.from, out.to), (ChunkStatus::Active, ChunkStatus::Archived));
        assert!(lifecycle.active_chunks(10).await.unwrap().is_empty());

        lifecycle.restore("c1").await.unwrap();
        assert_eq!(lifecycle.active_chunks(10).await.unwrap()[0].id, "c1");
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected_without_write() {
        let store = MemoryStatuses::with("c1", ChunkStatus::Superseded);
        let lifecycle = ChunkLifecycleService::new(&store);

        let err = lifecycle.restore("c1").await.unwrap_err();
        assert_eq!(err.code(), codes::INVALID_TRANSITION);
        assert_eq!(err.context()["from"], "superseded");
        assert_eq!(err.context()["to"], "active");
        assert_eq!(err.context()["allowed"], serde_json::json!(["deleted"]));
        assert_eq!(*store.writes.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_no_op_and_missing_chunk() {
        let store = MemoryStatuses::with("c1", ChunkStatus::Archived);
        let lifecycle = ChunkLifecycleService::new(&store);

        let err = lifecycle.archive("c1").await.unwrap_err();
        assert_eq!(err.code(), codes::NO_OP_TRANSITION);

        let err = lifecycle.delete("missing").await.unwrap_err();
        assert_eq!(err.code(), codes::CHUNK_NOT_FOUND);
        assert_eq!(err.context()["chunk_id"], "missing");
    }
}
