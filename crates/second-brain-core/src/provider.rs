//! Collaborator traits implemented by provider adapters.
//!
//! The orchestration layer talks to every external system through one of
//! these traits, so tests can substitute in-process implementations and
//! the application crate owns all HTTP details.
//!
//! | Trait | Real implementation |
//! |-------|---------------------|
//! | [`SearchProvider`] | mem0 platform search, Supabase `match_vectors` RPC |
//! | [`Embedder`] | Voyage embeddings |
//! | [`Reranker`] | Voyage rerank |
//! | [`Synthesizer`] | Ollama chat |
//!
//! All methods return [`BrainError`] on failure. Callers decide whether a
//! failure is recoverable; the memory facade and rerank service always
//! recover by falling back to deterministic results.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::BrainError;
use crate::models::{ContextCandidate, Provider};

/// Embedding width expected by the vector store.
pub const EXPECTED_EMBEDDING_DIMS: usize = 1024;

/// Role of the text being embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Query,
    Document,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::Query => "query",
            InputType::Document => "document",
        }
    }
}

/// A search backend returning normalized candidates.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn provider(&self) -> Provider;

    /// Up to `top_k` candidates with confidences in `[0, 1]`.
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        threshold: f64,
    ) -> Result<Vec<ContextCandidate>, BrainError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;

    async fn embed(&self, text: &str, input_type: InputType) -> Result<Vec<f32>, BrainError>;
}

/// One result from an external reranker. `index` points into the
/// documents passed in; out-of-range indices and missing scores are
/// discarded by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankHit {
    pub index: i64,
    pub relevance_score: Option<f64>,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    fn model(&self) -> &str;

    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<RerankHit>, BrainError>;
}

/// Answer text plus adapter-specific metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub text: String,
    pub metadata: Map<String, Value>,
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Never fails: an unreachable model yields a deterministic fallback
    /// text with `metadata["fallback"] = true`.
    async fn synthesize(&self, query: &str, candidates: &[ContextCandidate]) -> Synthesis;
}
