//! # Second Brain Core
//!
//! Pure decision logic for the Second Brain retrieval backend: request and
//! response contracts, the error taxonomy, feature flags and provider
//! status, the retrieval router, the branch classifier, migration drift
//! detection, secret redaction, and the collaborator traits that provider
//! adapters implement.
//!
//! The knowledge side covers documents and chunks: markdown chunking,
//! content-hash dedup, the chunk lifecycle, versioned and last-write-wins
//! writes, and savepoint-aware transactions. Storage sits behind the
//! executor traits each of those modules declares.
//!
//! This crate contains no tokio, sqlx, HTTP client, or filesystem I/O.
//! Routing, classification and drift detection are deterministic for
//! identical inputs, which is what the orchestrator in the `second-brain`
//! crate relies on for replayable traces.

pub mod branch;
pub mod chunking;
pub mod dedup;
pub mod drift;
pub mod error;
pub mod flags;
pub mod knowledge;
pub mod lifecycle;
pub mod models;
pub mod provider;
pub mod router;
pub mod sanitize;
pub mod transaction;
pub mod writes;

pub use error::{BrainError, ErrorKind};
