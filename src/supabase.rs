//! Supabase pgvector search adapter.
//!
//! The query is embedded first, then sent to the `match_vectors` RPC
//! (configurable) through PostgREST:
//!
//! ```text
//! POST {url}/rest/v1/rpc/{rpc_function}
//! {"query_embedding": [...1024 floats...], "match_count": top_k}
//! ```
//!
//! RPC calls go through a [`ConnectionPool`], so transient failures are
//! retried and a failing database trips the circuit breaker.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use second_brain_core::error::{codes, BrainError};
use second_brain_core::models::{ContextCandidate, Provider};
use second_brain_core::provider::{Embedder, InputType, SearchProvider, EXPECTED_EMBEDDING_DIMS};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::SupabaseConfig;
use crate::http::{build_client, join_url, number, post_json};
use crate::pool::{ConnectionPool, PoolConfig};

pub struct SupabaseSearch {
    http: reqwest::Client,
    url: String,
    key: String,
    rpc_function: String,
    pool: ConnectionPool,
    embedder: Arc<dyn Embedder>,
}

impl SupabaseSearch {
    /// `None` when the real provider is disabled or credentials are missing.
    pub fn from_config(
        config: &SupabaseConfig,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Option<Self>> {
        if !config.use_real_provider {
            return Ok(None);
        }
        let (Some(url), Some(key)) = (
            config.url.clone().filter(|u| !u.is_empty()),
            config.key.clone().filter(|k| !k.is_empty()),
        ) else {
            return Ok(None);
        };
        Ok(Some(Self {
            http: build_client(config.timeout_secs)?,
            url,
            key,
            rpc_function: config.rpc_function.clone(),
            pool: ConnectionPool::new("supabase", PoolConfig::from(config)),
            embedder,
        }))
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, BrainError> {
        let embedding = self
            .embedder
            .embed(query, InputType::Query)
            .await
            .map_err(|e| e.with_context("fallback_reason", "embedding_failed"))?;
        check_dimensions(&embedding)?;
        Ok(embedding)
    }

    async fn call_rpc(&self, embedding: &[f32], top_k: usize) -> Result<Value, BrainError> {
        let endpoint = join_url(&self.url, &format!("/rest/v1/rpc/{}", self.rpc_function));
        let body = json!({ "query_embedding": embedding, "match_count": top_k });
        let secrets = [self.key.as_str(), self.url.as_str()];

        self.pool
            .execute_with_retry(|| {
                let request = self
                    .http
                    .post(&endpoint)
                    .header("apikey", &self.key)
                    .bearer_auth(&self.key);
                let (body, secrets) = (&body, &secrets);
                async move { post_json("supabase", request, body, secrets).await }
            })
            .await
    }
}

/// Vectors must match the `vector(1024)` column.
pub fn check_dimensions(embedding: &[f32]) -> Result<(), BrainError> {
    if embedding.len() == EXPECTED_EMBEDDING_DIMS {
        return Ok(());
    }
    Err(BrainError::provider(
        "supabase",
        format!(
            "Embedding dimension mismatch: expected {}, got {}",
            EXPECTED_EMBEDDING_DIMS,
            embedding.len()
        ),
    )
    .with_code(codes::EMBEDDING_DIMENSION_MISMATCH)
    .with_context("expected_dims", EXPECTED_EMBEDDING_DIMS)
    .with_context("actual_dims", embedding.len())
    .with_context("fallback_reason", "embedding_failed"))
}

#[async_trait]
impl SearchProvider for SupabaseSearch {
    fn provider(&self) -> Provider {
        Provider::Supabase
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        _threshold: f64,
    ) -> Result<Vec<ContextCandidate>, BrainError> {
        let embedding = self.embed_query(query).await?;
        let response = self.call_rpc(&embedding, top_k).await?;
        let rows = response.as_array().map(Vec::as_slice).unwrap_or_default();
        debug!(rows = rows.len(), "supabase rpc returned");
        Ok(normalize_rows(rows, top_k))
    }
}

/// Normalize `match_vectors` rows. Content comes from `metadata.content`,
/// then `metadata.text`.
pub fn normalize_rows(rows: &[Value], top_k: usize) -> Vec<ContextCandidate> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let confidence = number(row, "similarity").unwrap_or(0.0);
            let id = match row.get("id") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => format!("supa-{}", i),
                Some(other) => other.to_string(),
            };

            let mut metadata = Map::new();
            metadata.insert("real_provider".to_string(), Value::Bool(true));
            let mut content = String::new();
            if let Some(Value::Object(raw)) = row.get("metadata") {
                content = raw
                    .get("content")
                    .or_else(|| raw.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                metadata.extend(raw.clone());
            }

            ContextCandidate::new(id, content, "supabase", confidence).with_metadata(metadata)
        })
        .take(top_k)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_rows() {
        let rows = vec![
            json!({"id": "doc-1", "similarity": 0.91, "metadata": {"content": "alpha", "document_id": "d1"}}),
            json!({"similarity": "bad", "metadata": {"text": "beta"}}),
            json!({"id": 7, "similarity": -0.2}),
        ];
        let out = normalize_rows(&rows, 5);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].content(), "alpha");
        assert_eq!(out[0].metadata()["document_id"], "d1");
        assert_eq!(out[1].id(), "supa-1");
        assert_eq!(out[1].content(), "beta");
        assert_eq!(out[1].confidence(), 0.0);
        assert_eq!(out[2].id(), "7");
        assert_eq!(out[2].content(), "");
        assert_eq!(out[2].confidence(), 0.0);
    }

    #[test]
    fn test_dimension_check() {
        assert!(check_dimensions(&vec![0.0; EXPECTED_EMBEDDING_DIMS]).is_ok());
        let err = check_dimensions(&[0.1, 0.2]).unwrap_err();
        assert_eq!(err.code(), codes::EMBEDDING_DIMENSION_MISMATCH);
        assert_eq!(err.context()["actual_dims"], 2);
    }

    #[test]
    fn test_disabled_without_credentials() {
        struct NoEmbed;
        #[async_trait]
        impl Embedder for NoEmbed {
            fn model(&self) -> &str {
                "none"
            }
            async fn embed(&self, _: &str, _: InputType) -> Result<Vec<f32>, BrainError> {
                Err(BrainError::provider("voyage", "unused"))
            }
        }
        let config = SupabaseConfig {
            use_real_provider: true,
            url: Some("https://x.supabase.co".to_string()),
            ..SupabaseConfig::default()
        };
        assert!(SupabaseSearch::from_config(&config, Arc::new(NoEmbed))
            .unwrap()
            .is_none());
    }
}
