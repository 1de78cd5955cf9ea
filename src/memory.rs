//! Provider facade: one search call, normalized candidates, never an error.
//!
//! [`MemoryService::search`] picks one of three paths, in order:
//!
//! 1. **Mock data** set through [`MemoryService::set_mock_data`]: returned
//!    sorted by confidence and cut to `top_k`. No threshold filtering; the
//!    branch classifier sees low-confidence candidates too.
//! 2. **Real backend** (a [`SearchProvider`]): failures switch to the
//!    deterministic fallback and record `fallback_reason`, `error_type`
//!    and a sanitized `error_message`.
//! 3. **Deterministic fallback** keyed on the query text, used when no
//!    backend is configured (`fallback_reason = "real_provider_disabled"`).
//!
//! Mock data `Some(vec![])` is an explicit empty result set. Clearing the
//! mock returns the service to paths 2 and 3.

use std::sync::{Arc, Mutex, PoisonError};

use second_brain_core::error::BrainError;
use second_brain_core::models::{
    ContextCandidate, Provider, ProviderMetadata, DEFAULT_THRESHOLD,
};
use second_brain_core::provider::SearchProvider;
use second_brain_core::sanitize::sanitize_message;
use serde_json::Value;
use tracing::{debug, warn};

use crate::http::failure_type;

pub struct MemoryService {
    provider: Provider,
    backend: Option<Arc<dyn SearchProvider>>,
    secrets: Vec<String>,
    mock_data: Mutex<Option<Vec<ContextCandidate>>>,
}

impl MemoryService {
    /// Service with no real backend: deterministic fallback only.
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            backend: None,
            secrets: Vec::new(),
            mock_data: Mutex::new(None),
        }
    }

    pub fn with_backend(provider: Provider, backend: Arc<dyn SearchProvider>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new(provider)
        }
    }

    /// Values redacted from any error text this service records.
    pub fn with_secrets(mut self, secrets: Vec<String>) -> Self {
        self.secrets = secrets.into_iter().filter(|s| !s.is_empty()).collect();
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    pub fn set_mock_data(&self, data: Vec<ContextCandidate>) {
        *self.mock_data.lock().unwrap_or_else(PoisonError::into_inner) = Some(data);
    }

    /// Leave mock mode. This is not the same as `set_mock_data(vec![])`.
    pub fn clear_mock_data(&self) {
        *self.mock_data.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn mock_snapshot(&self) -> Option<Vec<ContextCandidate>> {
        self.mock_data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        threshold: f64,
        rerank_hint: bool,
    ) -> (Vec<ContextCandidate>, ProviderMetadata) {
        let mut metadata = ProviderMetadata::for_provider(self.provider);
        let query = query.trim();
        if query.is_empty() {
            metadata.query_empty = true;
            return (Vec::new(), metadata);
        }
        let top_k = top_k.max(1);
        let threshold = if threshold.is_finite() {
            threshold.clamp(0.0, 1.0)
        } else {
            DEFAULT_THRESHOLD
        };

        let results = if let Some(mut mock) = self.mock_snapshot() {
            metadata.mock_mode = true;
            mock.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));
            mock.truncate(top_k);
            mock
        } else if let Some(backend) = &self.backend {
            match backend.search(query, top_k, threshold).await {
                Ok(mut found) => {
                    found.truncate(top_k);
                    metadata.real_provider = true;
                    found
                }
                Err(e) => {
                    self.record_failure(&mut metadata, &e);
                    self.fallback(query)
                }
            }
        } else {
            metadata.fallback = true;
            metadata.fallback_reason = Some("real_provider_disabled".to_string());
            self.fallback(query)
        };

        metadata.raw_count = results.len();
        if self.provider == Provider::Mem0 && !metadata.mock_mode {
            metadata.rerank_applied = Some(rerank_hint);
        }
        debug!(
            provider = %self.provider,
            raw_count = metadata.raw_count,
            mock_mode = metadata.mock_mode,
            real_provider = metadata.real_provider,
            "memory search"
        );
        (results, metadata)
    }

    fn record_failure(&self, metadata: &mut ProviderMetadata, err: &BrainError) {
        let secrets: Vec<&str> = self.secrets.iter().map(String::as_str).collect();
        let reason = err
            .context()
            .get("fallback_reason")
            .and_then(Value::as_str)
            .unwrap_or("provider_error")
            .to_string();
        let error_type = failure_type(err);
        let message = sanitize_message(err.message(), &secrets);
        warn!(
            provider = %self.provider,
            reason = %reason,
            error_type = %error_type,
            "provider search failed, using fallback"
        );

        if let Some(embed_error) = err.context().get("embed_error") {
            metadata.extra.insert("embed_error".to_string(), embed_error.clone());
        }
        metadata.fallback = true;
        metadata.used_fallback = true;
        metadata.fallback_reason = Some(reason);
        metadata.error_type = Some(error_type);
        metadata.error_message = Some(message);
    }

    fn fallback(&self, query: &str) -> Vec<ContextCandidate> {
        fallback_candidates(query, self.provider)
    }
}

/// Canned results for a query, keyed on substrings of its lower-cased text.
///
/// | Query contains | Result |
/// |----------------|--------|
/// | `empty`, `no candidate` | nothing |
/// | `low confidence` | one result at 0.45 |
/// | `degraded` | one result at 0.50 |
/// | anything else | two results at 0.85 and 0.72 |
pub fn fallback_candidates(query: &str, provider: Provider) -> Vec<ContextCandidate> {
    let lower = query.to_lowercase();
    let source = provider.as_str();
    let mock = |id: &str, content: String, confidence: f64| {
        ContextCandidate::new(id, content, source, confidence).with_meta("mock", true)
    };

    if lower.contains("empty") || lower.contains("no candidate") {
        Vec::new()
    } else if lower.contains("low confidence") {
        vec![mock("mock-low-1", format!("Low confidence result for: {}", query), 0.45)
            .with_meta("low_conf", true)]
    } else if lower.contains("degraded") {
        vec![mock("mock-degraded-1", format!("Degraded result for: {}", query), 0.5)
            .with_meta("degraded", true)]
    } else {
        vec![
            mock("mock-1", format!("High confidence result for: {}", query), 0.85),
            mock("mock-2", format!("Secondary result for: {}", query), 0.72),
        ]
    }
}

/// Builds the memory service for a routed provider.
pub trait MemoryServiceFactory: Send + Sync {
    fn create(&self, provider: Provider) -> Result<Arc<MemoryService>, BrainError>;
}

/// Factory wiring each provider to its configured backend, if any.
#[derive(Default)]
pub struct ConfiguredMemoryFactory {
    mem0: Option<Arc<dyn SearchProvider>>,
    supabase: Option<Arc<dyn SearchProvider>>,
    secrets: Vec<String>,
}

impl ConfiguredMemoryFactory {
    pub fn new(
        mem0: Option<Arc<dyn SearchProvider>>,
        supabase: Option<Arc<dyn SearchProvider>>,
        secrets: Vec<String>,
    ) -> Self {
        Self {
            mem0,
            supabase,
            secrets,
        }
    }
}

impl MemoryServiceFactory for ConfiguredMemoryFactory {
    fn create(&self, provider: Provider) -> Result<Arc<MemoryService>, BrainError> {
        let backend = match provider {
            Provider::Mem0 => self.mem0.clone(),
            Provider::Supabase => self.supabase.clone(),
            Provider::Graphiti => None,
        };
        let service = match backend {
            Some(backend) => MemoryService::with_backend(provider, backend),
            None => MemoryService::new(provider),
        };
        Ok(Arc::new(service.with_secrets(self.secrets.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FailingBackend;

    #[async_trait]
    impl SearchProvider for FailingBackend {
        fn provider(&self) -> Provider {
            Provider::Mem0
        }
        async fn search(
            &self,
            _query: &str,
            _top_k: usize,
            _threshold: f64,
        ) -> Result<Vec<ContextCandidate>, BrainError> {
            Err(BrainError::provider("mem0", "401 for key m0-secretsecretsecret1234")
                .with_context("error_type", "HttpStatus"))
        }
    }

    struct FixedBackend(Vec<ContextCandidate>);

    #[async_trait]
    impl SearchProvider for FixedBackend {
        fn provider(&self) -> Provider {
            Provider::Supabase
        }
        async fn search(
            &self,
            _query: &str,
            _top_k: usize,
            _threshold: f64,
        ) -> Result<Vec<ContextCandidate>, BrainError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_empty_query() {
        let svc = MemoryService::new(Provider::Mem0);
        let (cands, meta) = svc.search("   ", 5, 0.6, true).await;
        assert!(cands.is_empty());
        assert!(meta.query_empty);
    }

    #[tokio::test]
    async fn test_fallback_keywords() {
        let svc = MemoryService::new(Provider::Mem0);
        let (cands, meta) = svc.search("an empty set test", 5, 0.6, true).await;
        assert!(cands.is_empty());
        assert_eq!(meta.fallback_reason.as_deref(), Some("real_provider_disabled"));
        assert_eq!(meta.rerank_applied, Some(true));

        let (cands, _) = svc.search("LOW CONFIDENCE please", 5, 0.6, true).await;
        assert_eq!(cands[0].id(), "mock-low-1");
        assert_eq!(cands[0].confidence(), 0.45);

        let (cands, _) = svc.search("degraded path", 5, 0.6, true).await;
        assert_eq!(cands[0].confidence(), 0.5);

        let (cands, meta) = svc.search("what did I note about rust", 5, 0.6, false).await;
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].source(), "mem0");
        assert_eq!(meta.raw_count, 2);
        assert_eq!(meta.rerank_applied, Some(false));
    }

    #[tokio::test]
    async fn test_mock_sorted_truncated_unfiltered() {
        let svc = MemoryService::new(Provider::Supabase);
        svc.set_mock_data(vec![
            ContextCandidate::new("a", "a", "supabase", 0.1),
            ContextCandidate::new("b", "b", "supabase", 0.9),
            ContextCandidate::new("c", "c", "supabase", 0.5),
        ]);
        let (cands, meta) = svc.search("anything", 2, 0.99, true).await;
        let ids: Vec<&str> = cands.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(meta.mock_mode);
        assert_eq!(meta.rerank_applied, None);
    }

    #[tokio::test]
    async fn test_empty_mock_differs_from_cleared() {
        let svc = MemoryService::new(Provider::Mem0);
        svc.set_mock_data(Vec::new());
        let (cands, meta) = svc.search("normal query", 5, 0.6, true).await;
        assert!(cands.is_empty());
        assert!(meta.mock_mode);

        svc.clear_mock_data();
        let (cands, meta) = svc.search("normal query", 5, 0.6, true).await;
        assert_eq!(cands.len(), 2);
        assert!(!meta.mock_mode);
    }

    #[tokio::test]
    async fn test_backend_failure_falls_back_sanitized() {
        let svc = MemoryService::with_backend(Provider::Mem0, Arc::new(FailingBackend));
        let (cands, meta) = svc.search("normal query", 5, 0.6, true).await;
        assert_eq!(cands.len(), 2);
        assert_eq!(meta.fallback_reason.as_deref(), Some("provider_error"));
        assert_eq!(meta.error_type.as_deref(), Some("HttpStatus"));
        let message = meta.error_message.unwrap();
        assert!(!message.contains("m0-secret"));
        assert!(message.chars().count() <= 200);
    }

    #[tokio::test]
    async fn test_backend_success() {
        let rows = vec![ContextCandidate::new("s1", "vec hit", "supabase", 0.8)];
        let svc = MemoryService::with_backend(Provider::Supabase, Arc::new(FixedBackend(rows)));
        let (cands, meta) = svc.search("q", 5, f64::NAN, true).await;
        assert_eq!(cands[0].id(), "s1");
        assert!(meta.real_provider);
        assert_eq!(meta.rerank_applied, None);
    }

    #[test]
    fn test_factory_graphiti_has_no_backend() {
        let factory = ConfiguredMemoryFactory::new(Some(Arc::new(FailingBackend)), None, vec![]);
        assert!(factory.create(Provider::Mem0).unwrap().has_backend());
        assert!(!factory.create(Provider::Supabase).unwrap().has_backend());
        assert!(!factory.create(Provider::Graphiti).unwrap().has_backend());
    }
}
