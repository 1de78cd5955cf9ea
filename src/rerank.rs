//! External rerank stage.
//!
//! [`RerankService::rerank`] is bypassed (type `none`) when disabled or
//! when there are fewer than two candidates. Otherwise it calls the
//! configured [`Reranker`] and falls back to a deterministic term-overlap
//! score when the reranker is absent, fails, or returns nothing usable.
//! The output is always a fresh candidate list; the input is not modified.

use std::collections::HashSet;
use std::sync::Arc;

use second_brain_core::models::{ContextCandidate, RerankMetadata, RerankType};
use second_brain_core::provider::Reranker;
use tracing::{debug, warn};

use crate::http::failure_type;

/// Confidence added per query term that also appears in the content.
pub const MOCK_OVERLAP_BONUS: f64 = 0.05;

pub struct RerankService {
    enabled: bool,
    model: String,
    reranker: Option<Arc<dyn Reranker>>,
}

impl RerankService {
    pub fn new(enabled: bool, model: impl Into<String>) -> Self {
        Self {
            enabled,
            model: model.into(),
            reranker: None,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn rerank(
        &self,
        query: &str,
        candidates: &[ContextCandidate],
        top_k: usize,
    ) -> (Vec<ContextCandidate>, RerankMetadata) {
        let mut metadata = RerankMetadata {
            rerank_type: RerankType::None,
            rerank_model: Some(self.model.clone()),
            candidates_in: candidates.len(),
            ..RerankMetadata::default()
        };

        let bypass = if !self.enabled {
            Some("disabled")
        } else if candidates.is_empty() {
            Some("no_candidates")
        } else if candidates.len() == 1 {
            Some("single_candidate")
        } else {
            None
        };
        if let Some(reason) = bypass {
            metadata.bypass_reason = Some(reason.to_string());
            metadata.candidates_out = candidates.len();
            return (candidates.to_vec(), metadata);
        }

        metadata.rerank_type = RerankType::External;
        let top_k = top_k.max(1);

        if let Some(reranker) = &self.reranker {
            match real_rerank(reranker.as_ref(), query, candidates, top_k).await {
                Ok(reranked) => {
                    metadata.real_rerank = true;
                    metadata.candidates_out = reranked.len();
                    return (reranked, metadata);
                }
                Err(reason) => {
                    debug!(reason = %reason, "real rerank unusable, using overlap scoring");
                    metadata.fallback_reason = Some(reason);
                }
            }
        }

        let reranked = mock_rerank(query, candidates, top_k);
        metadata.candidates_out = reranked.len();
        (reranked, metadata)
    }
}

/// Map reranker hits back onto `candidates`. `Err` carries the reason the
/// result cannot be used.
async fn real_rerank(
    reranker: &dyn Reranker,
    query: &str,
    candidates: &[ContextCandidate],
    top_k: usize,
) -> Result<Vec<ContextCandidate>, String> {
    let documents: Vec<String> = candidates.iter().map(|c| c.content().to_string()).collect();
    let hits = reranker
        .rerank(query, &documents, top_k)
        .await
        .map_err(|e| {
            warn!(model = reranker.model(), error_type = %failure_type(&e), "rerank failed");
            failure_type(&e)
        })?;

    let reranked: Vec<ContextCandidate> = hits
        .iter()
        .filter_map(|hit| {
            let Some(original) = usize::try_from(hit.index)
                .ok()
                .and_then(|i| candidates.get(i))
            else {
                warn!(index = hit.index, count = candidates.len(), "rerank returned invalid index");
                return None;
            };
            let Some(score) = hit.relevance_score.filter(|s| s.is_finite()) else {
                warn!(index = hit.index, "rerank returned invalid relevance score");
                return None;
            };
            Some(
                original
                    .with_confidence(score)
                    .with_meta("rerank_adjusted", true)
                    .with_meta("original_confidence", original.confidence()),
            )
        })
        .collect();

    if reranked.is_empty() {
        return Err("empty_results".to_string());
    }
    Ok(reranked)
}

/// Raise each confidence by [`MOCK_OVERLAP_BONUS`] per distinct shared
/// lower-cased whitespace token, capped at 1.0, then sort descending
/// (stable) and keep `top_k`.
pub fn mock_rerank(query: &str, candidates: &[ContextCandidate], top_k: usize) -> Vec<ContextCandidate> {
    let query_lower = query.to_lowercase();
    let query_terms: HashSet<&str> = query_lower.split_whitespace().collect();

    let mut scored: Vec<ContextCandidate> = candidates
        .iter()
        .map(|c| {
            let content_lower = c.content().to_lowercase();
            let overlap = content_lower
                .split_whitespace()
                .collect::<HashSet<_>>()
                .intersection(&query_terms)
                .count();
            let adjusted = (c.confidence() + overlap as f64 * MOCK_OVERLAP_BONUS).min(1.0);
            c.with_confidence(adjusted).with_meta("rerank_adjusted", true)
        })
        .collect();

    scored.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));
    scored.truncate(top_k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use second_brain_core::error::BrainError;
    use second_brain_core::provider::RerankHit;

    fn cand(id: &str, content: &str, confidence: f64) -> ContextCandidate {
        ContextCandidate::new(id, content, "supabase", confidence)
    }

    struct ScriptedReranker(Result<Vec<RerankHit>, ()>);

    #[async_trait]
    impl Reranker for ScriptedReranker {
        fn model(&self) -> &str {
            "scripted"
        }
        async fn rerank(
            &self,
            _query: &str,
            _documents: &[String],
            _top_k: usize,
        ) -> Result<Vec<RerankHit>, BrainError> {
            self.0
                .clone()
                .map_err(|_| BrainError::provider("voyage", "boom"))
        }
    }

    #[tokio::test]
    async fn test_bypass_reasons() {
        let on = RerankService::new(true, "rerank-2");
        let off = RerankService::new(false, "rerank-2");
        let two = vec![cand("a", "x", 0.5), cand("b", "y", 0.6)];

        let (out, meta) = off.rerank("q", &two, 5).await;
        assert_eq!(out, two);
        assert_eq!(meta.bypass_reason.as_deref(), Some("disabled"));
        assert_eq!(meta.rerank_type, RerankType::None);

        let (_, meta) = on.rerank("q", &[], 5).await;
        assert_eq!(meta.bypass_reason.as_deref(), Some("no_candidates"));

        let (_, meta) = on.rerank("q", &two[..1], 5).await;
        assert_eq!(meta.bypass_reason.as_deref(), Some("single_candidate"));
    }

    #[tokio::test]
    async fn test_mock_overlap_bonus_and_order() {
        let svc = RerankService::new(true, "rerank-2");
        let input = vec![
            cand("a", "nothing shared here", 0.75),
            cand("b", "Rust async runtime rust", 0.60),
        ];
        let (out, meta) = svc.rerank("rust async", &input, 5).await;
        assert_eq!(meta.rerank_type, RerankType::External);
        assert!(!meta.real_rerank);
        assert_eq!(out[0].id(), "a");
        assert!((out[1].confidence() - 0.70).abs() < 1e-9);
        assert_eq!(out[1].metadata()["rerank_adjusted"], true);
        assert_eq!(input[1].confidence(), 0.60);
    }

    #[test]
    fn test_mock_caps_and_truncates() {
        let out = mock_rerank("a b c", &[cand("x", "a b c", 0.99), cand("y", "z", 0.1)], 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence(), 1.0);
    }

    #[tokio::test]
    async fn test_real_rerank_maps_and_skips_invalid() {
        let hits = vec![
            RerankHit { index: 1, relevance_score: Some(1.4) },
            RerankHit { index: 9, relevance_score: Some(0.5) },
            RerankHit { index: 0, relevance_score: None },
            RerankHit { index: -1, relevance_score: Some(0.5) },
        ];
        let svc = RerankService::new(true, "rerank-2")
            .with_reranker(Arc::new(ScriptedReranker(Ok(hits))));
        let input = vec![cand("a", "x", 0.5), cand("b", "y", 0.6)];
        let (out, meta) = svc.rerank("q", &input, 5).await;
        assert!(meta.real_rerank);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id(), "b");
        assert_eq!(out[0].confidence(), 1.0);
        assert_eq!(out[0].metadata()["original_confidence"], 0.6);
    }

    #[tokio::test]
    async fn test_real_rerank_failure_uses_mock() {
        let svc = RerankService::new(true, "rerank-2")
            .with_reranker(Arc::new(ScriptedReranker(Err(()))));
        let input = vec![cand("a", "x", 0.5), cand("b", "y", 0.6)];
        let (out, meta) = svc.rerank("q", &input, 5).await;
        assert!(!meta.real_rerank);
        assert_eq!(meta.fallback_reason.as_deref(), Some("ProviderError"));
        assert_eq!(out.len(), 2);

        let svc = RerankService::new(true, "rerank-2")
            .with_reranker(Arc::new(ScriptedReranker(Ok(vec![]))));
        let (_, meta) = svc.rerank("q", &input, 5).await;
        assert_eq!(meta.fallback_reason.as_deref(), Some("empty_results"));
    }
}
