//! One retrieval pass: route, retrieve, rerank, classify.
//!
//! ```text
//!   RetrievalRequest
//!        │
//!        ▼
//!   route(request, status, flags) ──── provider: None ──▶ EMPTY_SET ("none")
//!        │
//!        ▼
//!   MemoryService::search  (mock / real backend / deterministic fallback)
//!        │
//!        ▼
//!   rerank policy
//!     mem0            → provider-native, external rerank bypassed
//!     no candidates   → none
//!     rerank disabled → none
//!     otherwise       → RerankService::rerank
//!        │
//!        ▼
//!   determine_branch (or force_branch in validation mode)
//!        │
//!        ▼
//!   RetrievalResponse + optional trace
//! ```
//!
//! A failure anywhere in the pass is recorded as an error trace and
//! returned as a retryable `RETRIEVAL_ERROR`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use second_brain_core::branch::{determine_branch, emit_empty_set, force_branch};
use second_brain_core::error::{codes, BrainError};
use second_brain_core::flags::{FeatureFlags, ProviderStatusSnapshot};
use second_brain_core::models::{
    provider_label, Branch, ContextCandidate, ContextPacket, NextAction, Provider,
    ProviderMetadata, RerankMetadata, RerankType, RetrievalRequest, RetrievalResponse,
    RoutingMetadata,
};
use second_brain_core::router::{route, RouteDecision};
use second_brain_core::sanitize::sanitize_message;
use tracing::{debug, info, warn};

use crate::memory::{MemoryService, MemoryServiceFactory};
use crate::rerank::RerankService;
use crate::trace::{RetrievalTrace, TraceCollector};

/// Validation hooks. `force_branch` only applies with `validation_mode`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub validation_mode: bool,
    pub force_branch: Option<Branch>,
}

impl RunOptions {
    pub fn forced(branch: Branch) -> Self {
        Self {
            validation_mode: true,
            force_branch: Some(branch),
        }
    }

    fn forced_branch(&self) -> Option<Branch> {
        self.force_branch.filter(|_| self.validation_mode)
    }
}

/// The retrieval call the planner depends on.
#[async_trait]
pub trait RecallFlow: Send + Sync {
    async fn run(&self, request: &RetrievalRequest) -> Result<RetrievalResponse, BrainError>;
}

pub const BYPASS_MEM0_POLICY: &str = "mem0-default-policy";
pub const BYPASS_RERANK_DISABLED: &str = "external_rerank_disabled";
pub const BYPASS_NO_CANDIDATES: &str = "no_candidates";

pub struct RecallOrchestrator {
    memory: Arc<MemoryService>,
    factory: Arc<dyn MemoryServiceFactory>,
    rerank: Arc<RerankService>,
    flags: FeatureFlags,
    status: ProviderStatusSnapshot,
    traces: Option<Arc<TraceCollector>>,
}

struct RerankOutcome {
    candidates: Vec<ContextCandidate>,
    rerank_type: RerankType,
    bypass_reason: Option<String>,
    metadata: Option<RerankMetadata>,
}

struct PassOutcome {
    response: RetrievalResponse,
    raw_count: usize,
    rerank_bypass_reason: Option<String>,
}

impl RecallOrchestrator {
    pub fn new(
        memory: Arc<MemoryService>,
        factory: Arc<dyn MemoryServiceFactory>,
        rerank: Arc<RerankService>,
        flags: FeatureFlags,
        status: ProviderStatusSnapshot,
    ) -> Self {
        Self {
            memory,
            factory,
            rerank,
            flags,
            status,
            traces: None,
        }
    }

    pub fn with_trace_collector(mut self, traces: Arc<TraceCollector>) -> Self {
        self.traces = Some(traces);
        self
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.flags
    }

    pub fn status(&self) -> &ProviderStatusSnapshot {
        &self.status
    }

    pub fn trace_collector(&self) -> Option<&Arc<TraceCollector>> {
        self.traces.as_ref()
    }

    pub async fn run(&self, request: &RetrievalRequest) -> Result<RetrievalResponse, BrainError> {
        self.run_with(request, RunOptions::default()).await
    }

    pub async fn run_with(
        &self,
        request: &RetrievalRequest,
        options: RunOptions,
    ) -> Result<RetrievalResponse, BrainError> {
        let started = Instant::now();
        match self.pass(request, options).await {
            Ok(outcome) => {
                let mut response = outcome.response;
                if let Some(traces) = &self.traces {
                    let trace = self.success_trace(
                        request,
                        &response,
                        outcome.raw_count,
                        outcome.rerank_bypass_reason,
                        started,
                    );
                    response.routing_metadata.trace_id = Some(trace.trace_id.clone());
                    traces.record(trace);
                }
                info!(
                    provider = %response.context_packet.provider(),
                    branch = %response.context_packet.branch(),
                    action = %response.next_action.action(),
                    candidates = response.context_packet.candidates().len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "recall complete"
                );
                Ok(response)
            }
            Err(e) => {
                warn!(error_type = e.kind().type_name(), code = e.code(), "recall failed");
                if let Some(traces) = &self.traces {
                    traces.record(error_trace(request, &e, started));
                }
                Err(retrieval_error(request, e))
            }
        }
    }

    fn resolve_memory(&self, provider: Provider) -> Result<Arc<MemoryService>, BrainError> {
        if self.memory.provider() == provider {
            return Ok(Arc::clone(&self.memory));
        }
        debug!(provider = %provider, "creating provider-specific memory service");
        self.factory.create(provider)
    }

    async fn pass(
        &self,
        request: &RetrievalRequest,
        options: RunOptions,
    ) -> Result<PassOutcome, BrainError> {
        let decision = route(request, &self.status, &self.flags);
        let Some(provider) = decision.provider else {
            return Ok(self.no_provider(request));
        };
        let skip = decision.skip_external_rerank;

        let memory = self.resolve_memory(provider)?;
        let (candidates, provider_metadata) = memory
            .search(request.query(), request.top_k(), request.threshold(), !skip)
            .await;
        let raw_count = candidates.len();

        let reranked = self.apply_rerank_policy(request, candidates, skip).await;
        let forced = options.forced_branch();
        let (packet, next_action) = match forced {
            Some(branch) => force_branch(
                branch,
                reranked.candidates,
                Some(provider),
                skip,
                request.threshold(),
            ),
            None => determine_branch(reranked.candidates, request.threshold(), skip, Some(provider)),
        };

        let routing = self.routing_metadata(
            request,
            &decision,
            &reranked.rerank_type,
            reranked.bypass_reason.clone(),
            Some(provider_metadata),
            reranked.metadata,
            forced,
        );

        Ok(PassOutcome {
            response: RetrievalResponse {
                context_packet: packet,
                next_action,
                routing_metadata: routing,
            },
            raw_count,
            rerank_bypass_reason: reranked.bypass_reason,
        })
    }

    async fn apply_rerank_policy(
        &self,
        request: &RetrievalRequest,
        candidates: Vec<ContextCandidate>,
        skip_external_rerank: bool,
    ) -> RerankOutcome {
        let bypass = |rerank_type, reason: &str, candidates| RerankOutcome {
            candidates,
            rerank_type,
            bypass_reason: Some(reason.to_string()),
            metadata: None,
        };

        if skip_external_rerank {
            return bypass(RerankType::ProviderNative, BYPASS_MEM0_POLICY, candidates);
        }
        if candidates.is_empty() {
            return bypass(RerankType::None, BYPASS_NO_CANDIDATES, candidates);
        }
        if !self.flags.external_rerank_enabled {
            return bypass(RerankType::None, BYPASS_RERANK_DISABLED, candidates);
        }

        let (reranked, metadata) = self
            .rerank
            .rerank(request.query(), &candidates, request.top_k())
            .await;
        RerankOutcome {
            candidates: reranked,
            rerank_type: metadata.rerank_type,
            bypass_reason: metadata.bypass_reason.clone(),
            metadata: Some(metadata),
        }
    }

    fn no_provider(&self, request: &RetrievalRequest) -> PassOutcome {
        let (packet, next_action) = emit_empty_set(provider_label(None));
        let decision = RouteDecision {
            provider: None,
            skip_external_rerank: false,
        };
        let routing =
            self.routing_metadata(request, &decision, &RerankType::None, None, None, None, None);
        PassOutcome {
            response: RetrievalResponse {
                context_packet: packet,
                next_action,
                routing_metadata: routing,
            },
            raw_count: 0,
            rerank_bypass_reason: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn routing_metadata(
        &self,
        request: &RetrievalRequest,
        decision: &RouteDecision,
        rerank_type: &RerankType,
        rerank_bypass_reason: Option<String>,
        provider_metadata: Option<ProviderMetadata>,
        rerank_metadata: Option<RerankMetadata>,
        forced: Option<Branch>,
    ) -> RoutingMetadata {
        let mut routing = RoutingMetadata::new(
            provider_label(decision.provider),
            request.mode(),
            &self.flags,
            &self.status,
        );
        routing.skip_external_rerank = decision.skip_external_rerank;
        routing.rerank_type = *rerank_type;
        routing.rerank_bypass_reason = rerank_bypass_reason;
        routing.provider_metadata = provider_metadata;
        routing.rerank_metadata = rerank_metadata;
        if let Some(branch) = forced {
            routing.validation_mode = true;
            routing.forced_branch = Some(branch);
        }
        routing
    }

    fn success_trace(
        &self,
        request: &RetrievalRequest,
        response: &RetrievalResponse,
        raw_count: usize,
        rerank_bypass_reason: Option<String>,
        started: Instant,
    ) -> RetrievalTrace {
        let packet: &ContextPacket = &response.context_packet;
        let action: &NextAction = &response.next_action;
        let routing = &response.routing_metadata;

        let mut trace = base_trace(request, started);
        trace.selected_provider = routing.selected_provider.clone();
        trace.feature_flags_snapshot = Some(self.flags.clone());
        trace.provider_status_snapshot = Some(self.status.clone());
        trace.raw_candidate_count = raw_count;
        trace.final_candidate_count = packet.candidates().len();
        trace.top_confidence = packet.summary().top_confidence();
        trace.rerank_type = routing.rerank_type;
        trace.rerank_bypass_reason = rerank_bypass_reason;
        trace.skip_external_rerank = routing.skip_external_rerank;
        trace.branch_code = packet.branch().as_str().to_string();
        trace.action = action.action().as_str().to_string();
        trace.reason = action.reason().to_string();
        trace.validation_mode = routing.validation_mode;
        trace.forced_branch = routing.forced_branch.map(|b| b.as_str().to_string());
        trace
    }
}

#[async_trait]
impl RecallFlow for RecallOrchestrator {
    async fn run(&self, request: &RetrievalRequest) -> Result<RetrievalResponse, BrainError> {
        RecallOrchestrator::run(self, request).await
    }
}

fn base_trace(request: &RetrievalRequest, started: Instant) -> RetrievalTrace {
    let mut trace = RetrievalTrace::new(
        request.query(),
        request.mode(),
        request.top_k(),
        request.threshold(),
    );
    trace.provider_override = request.provider_override();
    trace.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    trace
}

fn error_trace(request: &RetrievalRequest, err: &BrainError, started: Instant) -> RetrievalTrace {
    base_trace(request, started).into_error(
        err.kind().type_name(),
        sanitize_message(&err.to_string(), &[]),
    )
}

/// Wrap a failure from inside the pass as a retryable `RETRIEVAL_ERROR`.
fn retrieval_error(request: &RetrievalRequest, err: BrainError) -> BrainError {
    let provider = request
        .provider_override()
        .map(|p| p.as_str())
        .unwrap_or("unknown");
    BrainError::retrieval(format!("Retrieval failed: {}", err.message()))
        .with_code(codes::RETRIEVAL_ERROR)
        .with_context("original_error_type", err.kind().type_name())
        .with_context("provider", provider)
        .with_context("query_length", request.query().chars().count())
        .with_retry_hint(true)
        .with_source(err)
}
