//! Service wiring.
//!
//! [`Services::from_config`] builds every retrieval component once from a
//! [`Config`] and hands out shared references. Nothing here is global:
//! tests and the CLI each construct their own `Services`.

use std::sync::Arc;

use anyhow::{Context, Result};
use second_brain_core::flags::{FeatureFlags, ProviderStatusSnapshot};
use second_brain_core::models::Provider;
use second_brain_core::provider::{Embedder, Reranker, SearchProvider, Synthesizer};
use tracing::{debug, info};

use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::llm::OllamaSynthesizer;
use crate::mem0::Mem0Search;
use crate::memory::{ConfiguredMemoryFactory, MemoryServiceFactory};
use crate::planner::Planner;
use crate::recall::{RecallFlow, RecallOrchestrator};
use crate::rerank::RerankService;
use crate::supabase::SupabaseSearch;
use crate::trace::TraceCollector;
use crate::voyage::VoyageClient;

pub struct Services {
    pub flags: FeatureFlags,
    pub status: ProviderStatusSnapshot,
    pub traces: Option<Arc<TraceCollector>>,
    pub conversations: Arc<ConversationStore>,
    pub recall: Arc<RecallOrchestrator>,
    pub planner: Planner,
    /// Shared by the Supabase embedder and the external reranker.
    pub voyage: Arc<VoyageClient>,
}

impl Services {
    pub fn from_config(config: &Config) -> Result<Self> {
        let flags = config.feature_flags.clone();
        let status = config.provider_status_snapshot()?;
        let secrets = collect_secrets(config);

        let voyage = Arc::new(
            VoyageClient::new(&config.voyage)
                .context("Failed to build Voyage client")?
                .with_embedding_enabled(),
        );
        let embedder: Arc<dyn Embedder> = Arc::clone(&voyage) as Arc<dyn Embedder>;

        let mem0: Option<Arc<dyn SearchProvider>> = Mem0Search::from_config(&config.mem0)?
            .map(|s| Arc::new(s) as Arc<dyn SearchProvider>);
        let supabase: Option<Arc<dyn SearchProvider>> =
            SupabaseSearch::from_config(&config.supabase, embedder)?
                .map(|s| Arc::new(s) as Arc<dyn SearchProvider>);
        info!(
            mem0_backend = mem0.is_some(),
            supabase_backend = supabase.is_some(),
            real_rerank = config.voyage.use_real_rerank,
            llm = config.llm.enabled,
            "building services"
        );

        let factory = ConfiguredMemoryFactory::new(mem0, supabase, secrets);
        let memory = factory
            .create(Provider::Mem0)
            .context("Failed to create default memory service")?;
        let factory: Arc<dyn MemoryServiceFactory> = Arc::new(factory);

        let mut rerank =
            RerankService::new(flags.external_rerank_enabled, config.voyage.rerank_model.clone());
        if config.voyage.use_real_rerank {
            rerank = rerank.with_reranker(Arc::clone(&voyage) as Arc<dyn Reranker>);
        }

        let traces = config
            .trace
            .enabled
            .then(|| Arc::new(TraceCollector::new(config.trace.max_traces)));

        let conversations = Arc::new(
            ConversationStore::new(config.conversation.max_turns, config.conversation.max_sessions)
                .context("Invalid conversation limits")?,
        );

        let mut recall = RecallOrchestrator::new(
            memory,
            factory,
            Arc::new(rerank),
            flags.clone(),
            status.clone(),
        );
        if let Some(traces) = &traces {
            recall = recall.with_trace_collector(Arc::clone(traces));
        }
        let recall = Arc::new(recall);

        let mut planner = Planner::new(
            Arc::clone(&recall) as Arc<dyn RecallFlow>,
            Arc::clone(&conversations),
        );
        if let Some(traces) = &traces {
            planner = planner.with_trace_collector(Arc::clone(traces));
        }
        if config.llm.enabled {
            let llm = OllamaSynthesizer::new(&config.llm).context("Failed to build LLM client")?;
            debug!(model = llm.model(), "LLM synthesis enabled");
            planner = planner.with_synthesizer(Arc::new(llm) as Arc<dyn Synthesizer>);
        }

        Ok(Self {
            flags,
            status,
            traces,
            conversations,
            recall,
            planner,
            voyage,
        })
    }
}

/// Every configured credential, for redaction in error messages.
pub fn collect_secrets(config: &Config) -> Vec<String> {
    [
        config.mem0.api_key.as_ref(),
        config.supabase.key.as_ref(),
        config.voyage.api_key.as_ref(),
    ]
    .into_iter()
    .flatten()
    .filter(|s| !s.is_empty())
    .cloned()
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use second_brain_core::models::{Branch, Mode, RetrievalRequest};
    use second_brain_core::provider::InputType;

    #[test]
    fn test_collect_secrets() {
        let mut config = Config::minimal();
        config.mem0.api_key = Some("m0-key".to_string());
        config.voyage.api_key = Some(String::new());
        assert_eq!(collect_secrets(&config), vec!["m0-key".to_string()]);
    }

    #[tokio::test]
    async fn test_minimal_config_runs_on_fallback_path() {
        let services = Services::from_config(&Config::minimal()).unwrap();
        let response = services
            .recall
            .run(&RetrievalRequest::with_defaults("what did I note about sqlx"))
            .await
            .unwrap();
        assert_eq!(response.context_packet.branch(), Branch::RerankBypassed);
        assert_eq!(services.traces.as_ref().unwrap().count(), 1);

        let reply = services
            .planner
            .chat("what did I note about sqlx", Some("s"), Mode::Conversation, 5, 0.6)
            .await
            .unwrap();
        assert_eq!(reply.branch_code, "RERANK_BYPASSED");
        assert!(services.conversations.has_session("s"));
    }

    #[test]
    fn test_traces_disabled() {
        let mut config = Config::minimal();
        config.trace.enabled = false;
        let services = Services::from_config(&config).unwrap();
        assert!(services.traces.is_none());
    }

    #[tokio::test]
    async fn test_one_voyage_client_serves_embed_and_rerank() {
        let mut config = Config::minimal();
        config.voyage.use_real_rerank = true;
        config.voyage.embed_enabled = false;
        let services = Services::from_config(&config).unwrap();

        // Held by `Services` and by the rerank stage.
        assert_eq!(Arc::strong_count(&services.voyage), 2);

        // Embedding stays on for the vector search path even when the
        // standalone flag is off; the missing key is what stops it here.
        let err = services.voyage.embed("q", InputType::Query).await.unwrap_err();
        assert_eq!(err.context()["embed_error"], "client_unavailable");
    }
}
