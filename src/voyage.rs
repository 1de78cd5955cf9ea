//! Voyage AI embedding and rerank adapter.
//!
//! Implements [`Embedder`] over `POST /v1/embeddings` and [`Reranker`] over
//! `POST /v1/rerank`. Both authenticate with `Authorization: Bearer`.
//!
//! Embedding failures carry an `embed_error` context entry so the memory
//! facade can report why it fell back:
//!
//! | `embed_error` | Cause |
//! |---------------|-------|
//! | `embedding_disabled` | `voyage.embed_enabled = false` |
//! | `client_unavailable` | no API key configured |
//! | `empty_embeddings` | the API returned no vectors |
//! | error type name | transport or HTTP failure |

use anyhow::Result;
use async_trait::async_trait;
use second_brain_core::error::BrainError;
use second_brain_core::provider::{Embedder, InputType, RerankHit, Reranker};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::VoyageConfig;
use crate::http::{build_client, failure_type, join_url, number, post_json};

const PROVIDER: &str = "voyage";

pub struct VoyageClient {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    embed_enabled: bool,
    embed_model: String,
    rerank_model: String,
}

impl VoyageClient {
    pub fn new(config: &VoyageConfig) -> Result<Self> {
        Ok(Self {
            http: build_client(config.timeout_secs)?,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            base_url: config.base_url.clone(),
            embed_enabled: config.embed_enabled,
            embed_model: config.embed_model.clone(),
            rerank_model: config.rerank_model.clone(),
        })
    }

    /// Same client with embedding switched on regardless of config. The
    /// Supabase search path needs query vectors even when standalone
    /// embedding is off.
    pub fn with_embedding_enabled(mut self) -> Self {
        self.embed_enabled = true;
        self
    }

    fn embed_error(&self, reason: &str, message: &str) -> BrainError {
        BrainError::provider(PROVIDER, message.to_string())
            .with_context("embed_error", reason)
            .with_context("embed_model", self.embed_model.as_str())
    }

    fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }
}

#[async_trait]
impl Embedder for VoyageClient {
    fn model(&self) -> &str {
        &self.embed_model
    }

    async fn embed(&self, text: &str, input_type: InputType) -> Result<Vec<f32>, BrainError> {
        if !self.embed_enabled {
            return Err(self.embed_error("embedding_disabled", "Voyage embedding is disabled"));
        }
        let Some(key) = self.api_key() else {
            return Err(self.embed_error("client_unavailable", "VOYAGE_API_KEY is not configured"));
        };

        let body = json!({
            "input": [text],
            "model": self.embed_model,
            "input_type": input_type.as_str(),
        });
        let request = self
            .http
            .post(join_url(&self.base_url, "/v1/embeddings"))
            .bearer_auth(key);

        let response = post_json(PROVIDER, request, &body, &[key]).await.map_err(|e| {
            let reason = failure_type(&e);
            e.with_context("embed_error", reason)
        })?;

        let vector: Vec<f32> = response
            .get("data")
            .and_then(Value::as_array)
            .and_then(|data| data.first())
            .and_then(|item| item.get("embedding"))
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect()
            })
            .unwrap_or_default();

        if vector.is_empty() {
            return Err(self.embed_error("empty_embeddings", "Voyage returned no embeddings"));
        }
        debug!(
            model = %self.embed_model,
            dims = vector.len(),
            total_tokens = response.pointer("/usage/total_tokens").and_then(serde_json::Value::as_u64),
            "voyage embedding"
        );
        Ok(vector)
    }
}

#[async_trait]
impl Reranker for VoyageClient {
    fn model(&self) -> &str {
        &self.rerank_model
    }

    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<RerankHit>, BrainError> {
        let Some(key) = self.api_key() else {
            return Err(BrainError::provider(PROVIDER, "VOYAGE_API_KEY is not configured")
                .with_context("error_type", "client_unavailable"));
        };

        let body = json!({
            "query": query,
            "documents": documents,
            "model": self.rerank_model,
            "top_k": top_k,
        });
        let request = self
            .http
            .post(join_url(&self.base_url, "/v1/rerank"))
            .bearer_auth(key);
        let response = post_json(PROVIDER, request, &body, &[key]).await?;
        Ok(parse_rerank_hits(&response))
    }
}

/// `data[]` entries as hits. Entries without an integer `index` are
/// dropped; a missing or non-numeric score is kept as `None` for the
/// caller to discard.
fn parse_rerank_hits(response: &Value) -> Vec<RerankHit> {
    response
        .get("data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(RerankHit {
                        index: item.get("index").and_then(Value::as_i64)?,
                        relevance_score: number(item, "relevance_score"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use second_brain_core::error::ErrorKind;

    fn client(embed_enabled: bool, api_key: Option<&str>) -> VoyageClient {
        let config = VoyageConfig {
            embed_enabled,
            api_key: api_key.map(str::to_string),
            ..VoyageConfig::default()
        };
        VoyageClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_embed_disabled() {
        let err = client(false, Some("k"))
            .embed("q", InputType::Query)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert_eq!(err.context()["embed_error"], "embedding_disabled");
    }

    #[tokio::test]
    async fn test_embed_without_key() {
        let err = client(false, None)
            .with_embedding_enabled()
            .embed("q", InputType::Query)
            .await
            .unwrap_err();
        assert_eq!(err.context()["embed_error"], "client_unavailable");
    }

    #[tokio::test]
    async fn test_rerank_without_key() {
        let err = client(false, Some(""))
            .rerank("q", &["a".to_string()], 1)
            .await
            .unwrap_err();
        assert_eq!(err.context()["error_type"], "client_unavailable");
    }

    #[test]
    fn test_parse_rerank_hits() {
        let response = json!({"data": [
            {"index": 1, "relevance_score": 0.9},
            {"index": 0, "relevance_score": "bad"},
            {"relevance_score": 0.5},
        ]});
        let hits = parse_rerank_hits(&response);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0], RerankHit { index: 1, relevance_score: Some(0.9) });
        assert_eq!(hits[1].relevance_score, None);
    }
}
