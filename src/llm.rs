//! Answer synthesis through an Ollama chat endpoint.
//!
//! [`OllamaSynthesizer`] sends the retrieved context as a numbered block
//! together with the question to `POST {base_url}/api/chat` (non
//! streaming). When the call fails or the model answers with nothing, it
//! returns a deterministic excerpt of the context instead, so synthesis
//! never fails.

use anyhow::Result;
use async_trait::async_trait;
use second_brain_core::models::ContextCandidate;
use second_brain_core::provider::{Synthesis, Synthesizer};
use second_brain_core::sanitize::{sanitize_message, truncate_chars};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::config::LlmConfig;
use crate::http::{build_client, failure_type, join_url, post_json};

const SYSTEM_PROMPT: &str = "You are a personal knowledge assistant. Answer the user's question \
using ONLY the provided context from their notes. Be specific, cite which note the information \
comes from when possible. If the context doesn't contain enough information to answer, say so \
honestly.";

const NO_CONTEXT_BLOCK: &str = "(No relevant context found in your notes.)";
const FALLBACK_QUOTES: usize = 3;
const FALLBACK_QUOTE_CHARS: usize = 300;

pub struct OllamaSynthesizer {
    http: reqwest::Client,
    base_url: String,
    model: String,
    system_prompt: String,
}

impl OllamaSynthesizer {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            http: build_client(config.timeout_secs)?,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            system_prompt: SYSTEM_PROMPT.to_string(),
        })
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// True when `GET /api/tags` answers 200.
    pub async fn health_check(&self) -> bool {
        match self.http.get(join_url(&self.base_url, "/api/tags")).send().await {
            Ok(resp) => resp.status().as_u16() == 200,
            Err(_) => false,
        }
    }

    fn base_metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("llm_provider".to_string(), Value::from("ollama"));
        metadata.insert("model".to_string(), Value::from(self.model.as_str()));
        metadata.insert("base_url".to_string(), Value::from(self.base_url.as_str()));
        metadata
    }

    fn fallback(
        &self,
        query: &str,
        candidates: &[ContextCandidate],
        mut metadata: Map<String, Value>,
        reason: &str,
    ) -> Synthesis {
        metadata.insert("fallback".to_string(), Value::Bool(true));
        metadata.insert("reason".to_string(), Value::from(reason));
        Synthesis {
            text: fallback_response(query, candidates),
            metadata,
        }
    }
}

#[async_trait]
impl Synthesizer for OllamaSynthesizer {
    async fn synthesize(&self, query: &str, candidates: &[ContextCandidate]) -> Synthesis {
        let mut metadata = self.base_metadata();
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": self.system_prompt},
                {"role": "user", "content": user_message(query, candidates)},
            ],
            "stream": false,
        });

        let request = self.http.post(join_url(&self.base_url, "/api/chat"));
        let response = match post_json("ollama", request, &body, &[]).await {
            Ok(response) => response,
            Err(e) => {
                let reason = failure_type(&e);
                warn!(
                    reason = %reason,
                    error = %sanitize_message(e.message(), &[]),
                    "ollama synthesis failed"
                );
                return self.fallback(query, candidates, metadata, &reason);
            }
        };

        let answer = response
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if answer.is_empty() {
            return self.fallback(query, candidates, metadata, "empty_response");
        }

        for key in ["total_duration", "eval_count"] {
            metadata.insert(key.to_string(), response.get(key).cloned().unwrap_or(Value::Null));
        }
        Synthesis {
            text: answer.to_string(),
            metadata,
        }
    }
}

/// Numbered context block:
///
/// ```text
/// [1] (source: mem0, confidence: 0.85, doc: notes-42)
/// content
///
/// ---
///
/// [2] ...
/// ```
pub fn build_context_block(candidates: &[ContextCandidate]) -> String {
    if candidates.is_empty() {
        return NO_CONTEXT_BLOCK.to_string();
    }
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let mut header = format!(
                "[{}] (source: {}, confidence: {:.2}",
                i + 1,
                c.source(),
                c.confidence()
            );
            if let Some(doc) = c
                .metadata()
                .get("document_id")
                .and_then(Value::as_str)
                .filter(|d| !d.is_empty())
            {
                header.push_str(&format!(", doc: {}", doc));
            }
            header.push(')');
            format!("{}\n{}", header, c.content())
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

fn user_message(query: &str, candidates: &[ContextCandidate]) -> String {
    format!(
        "Context from your notes:\n\n{}\n\nQuestion: {}",
        build_context_block(candidates),
        query
    )
}

/// Text returned when the model cannot be used: the top three candidates,
/// each cut to 300 characters.
pub fn fallback_response(_query: &str, candidates: &[ContextCandidate]) -> String {
    if candidates.is_empty() {
        return "I couldn't find relevant context for your query and the LLM is unavailable."
            .to_string();
    }
    let quotes: Vec<String> = candidates
        .iter()
        .take(FALLBACK_QUOTES)
        .enumerate()
        .map(|(i, c)| format!("[{}] {}", i + 1, quote(c.content())))
        .collect();
    format!(
        "(LLM unavailable \u{2014} showing raw retrieved context)\n\n{}",
        quotes.join("\n\n")
    )
}

/// `content` capped at 300 characters, with `...` when cut.
pub fn quote(content: &str) -> String {
    if content.chars().count() > FALLBACK_QUOTE_CHARS {
        format!("{}...", truncate_chars(content, FALLBACK_QUOTE_CHARS))
    } else {
        content.to_string()
    }
}
