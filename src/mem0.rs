//! mem0 platform search adapter.
//!
//! Calls `POST {base_url}/v1/memories/search/` with `Authorization: Token`.
//! Results may be a bare array or wrapped in `{"results": [...]}`.

use anyhow::Result;
use async_trait::async_trait;
use second_brain_core::error::BrainError;
use second_brain_core::models::{ContextCandidate, Provider};
use second_brain_core::provider::SearchProvider;
use serde_json::{json, Map, Value};

use crate::config::Mem0Config;
use crate::http::{build_client, join_url, number, post_json};

pub struct Mem0Search {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    user_id: Option<String>,
}

impl Mem0Search {
    /// `None` when the real provider is disabled or no API key is set.
    pub fn from_config(config: &Mem0Config) -> Result<Option<Self>> {
        let api_key = match &config.api_key {
            Some(key) if config.use_real_provider && !key.is_empty() => key.clone(),
            _ => return Ok(None),
        };
        Ok(Some(Self {
            http: build_client(config.timeout_secs)?,
            base_url: config.base_url.clone(),
            api_key,
            user_id: config.user_id.clone(),
        }))
    }
}

#[async_trait]
impl SearchProvider for Mem0Search {
    fn provider(&self) -> Provider {
        Provider::Mem0
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        _threshold: f64,
    ) -> Result<Vec<ContextCandidate>, BrainError> {
        let mut body = json!({ "query": query, "limit": top_k });
        if let Some(user_id) = &self.user_id {
            body["user_id"] = Value::from(user_id.as_str());
        }
        let request = self
            .http
            .post(join_url(&self.base_url, "/v1/memories/search/"))
            .header("Authorization", format!("Token {}", self.api_key));

        let response = post_json("mem0", request, &body, &[self.api_key.as_str()]).await?;
        Ok(normalize_results(&response, top_k))
    }
}

/// Normalize mem0 search results. Non-object entries are skipped.
pub fn normalize_results(response: &Value, top_k: usize) -> Vec<ContextCandidate> {
    let items = match response {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => obj
            .get("results")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[][..],
    };

    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| {
            let obj = item.as_object()?;
            let id = obj
                .get("id")
                .map(value_text)
                .unwrap_or_else(|| format!("mem0-{}", i));
            let content = obj
                .get("memory")
                .or_else(|| obj.get("content"))
                .map(value_text)
                .unwrap_or_default();
            let score = number(item, "score")
                .or_else(|| number(item, "confidence"))
                .unwrap_or(0.0);

            let mut metadata = Map::new();
            metadata.insert("real_provider".to_string(), Value::Bool(true));
            if let Some(Value::Object(raw)) = obj.get("metadata") {
                metadata.extend(raw.clone());
            }

            Some(ContextCandidate::new(id, content, "mem0", score).with_metadata(metadata))
        })
        .take(top_k)
        .collect()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_defaults_and_clamping() {
        let response = json!([
            {"memory": "prefers rust", "score": 1.7, "metadata": {"category": "prefs"}},
            {"id": 42, "content": "fallback content", "confidence": "0.3"},
            "not an object",
            {"id": "m3", "memory": "third", "score": null},
        ]);
        let out = normalize_results(&response, 10);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].id(), "mem0-0");
        assert_eq!(out[0].confidence(), 1.0);
        assert_eq!(out[0].metadata()["category"], "prefs");
        assert_eq!(out[0].metadata()["real_provider"], true);
        assert_eq!(out[1].id(), "42");
        assert_eq!(out[1].content(), "fallback content");
        assert_eq!(out[1].confidence(), 0.3);
        assert_eq!(out[2].confidence(), 0.0);
        assert!(out.iter().all(|c| c.source() == "mem0"));
    }

    #[test]
    fn test_normalize_wrapped_and_capped() {
        let response = json!({"results": [
            {"id": "a", "memory": "x", "score": 0.9},
            {"id": "b", "memory": "y", "score": 0.8},
        ]});
        let out = normalize_results(&response, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id(), "a");
    }

    #[test]
    fn test_disabled_without_key() {
        let config = Mem0Config {
            use_real_provider: true,
            ..Mem0Config::default()
        };
        assert!(Mem0Search::from_config(&config).unwrap().is_none());
    }
}
