//! Chat loop on top of recall.
//!
//! [`Planner::chat`] records the user turn, runs one retrieval, turns the
//! resulting [`Action`] into a user-facing reply and records the assistant
//! turn. Retrieval failures never escape: they become a fixed
//! `RETRIEVAL_ERROR` reply with an error trace.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use second_brain_core::error::BrainError;
use second_brain_core::models::{Action, ContextPacket, Mode, RetrievalRequest, RetrievalResponse};
use second_brain_core::provider::Synthesizer;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, info_span, warn, Instrument};

use crate::conversation::{ConversationStore, ConversationTurn};
use crate::llm::quote;
use crate::recall::RecallFlow;
use crate::trace::{RetrievalTrace, TraceCollector};

/// Branch code of the reply produced when retrieval itself fails.
pub const RETRIEVAL_ERROR_BRANCH: &str = "RETRIEVAL_ERROR";

const PROCEED_QUOTES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannerResponse {
    pub response_text: String,
    pub action_taken: Action,
    pub branch_code: String,
    pub session_id: String,
    pub suggestions: Vec<String>,
    pub candidates_used: usize,
    pub confidence: f64,
    pub retrieval_metadata: Value,
}

pub struct Planner {
    recall: Arc<dyn RecallFlow>,
    conversations: Arc<ConversationStore>,
    traces: Option<Arc<TraceCollector>>,
    llm: Option<Arc<dyn Synthesizer>>,
}

impl Planner {
    pub fn new(recall: Arc<dyn RecallFlow>, conversations: Arc<ConversationStore>) -> Self {
        Self {
            recall,
            conversations,
            traces: None,
            llm: None,
        }
    }

    pub fn with_trace_collector(mut self, traces: Arc<TraceCollector>) -> Self {
        self.traces = Some(traces);
        self
    }

    pub fn with_synthesizer(mut self, llm: Arc<dyn Synthesizer>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    /// Query → retrieval → interpretation → reply, within one session.
    pub async fn chat(
        &self,
        query: &str,
        session_id: Option<&str>,
        mode: Mode,
        top_k: usize,
        threshold: f64,
    ) -> Result<PlannerResponse> {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        let span = info_span!("planner_chat", correlation_id = %format!("planner-{}", &hex[..8]));
        self.chat_inner(query, session_id, mode, top_k, threshold)
            .instrument(span)
            .await
    }

    async fn chat_inner(
        &self,
        query: &str,
        session_id: Option<&str>,
        mode: Mode,
        top_k: usize,
        threshold: f64,
    ) -> Result<PlannerResponse> {
        let preview: String = query.chars().take(100).collect();
        info!(query = %preview, session_id = ?session_id, mode = %mode, "planner chat start");

        let state = self.conversations.get_or_create(session_id);
        self.conversations
            .add_turn(&state.session_id, ConversationTurn::user(query))?;

        let started = Instant::now();
        let retrieved = match RetrievalRequest::new(query, mode, top_k, threshold) {
            Ok(request) => self.recall.run(&request).await,
            Err(e) => Err(e),
        };
        let response = match retrieved {
            Ok(retrieval) => self.interpret(&retrieval, &state.session_id).await?,
            Err(e) => {
                warn!(error_type = e.kind().type_name(), code = e.code(), "planner retrieval failed");
                self.record_error_trace(query, mode, top_k, threshold, started, &e);
                retrieval_error_response(&state.session_id, &e)
            }
        };

        self.conversations.add_turn(
            &state.session_id,
            ConversationTurn::assistant(
                response.response_text.clone(),
                &response.branch_code,
                response.action_taken,
            ),
        )?;
        info!(
            branch = %response.branch_code,
            action = %response.action_taken,
            candidates = response.candidates_used,
            "planner chat complete"
        );
        Ok(response)
    }

    async fn interpret(&self, retrieval: &RetrievalResponse, session_id: &str) -> Result<PlannerResponse> {
        let packet = &retrieval.context_packet;
        let mut metadata = Map::new();
        metadata.insert("provider".to_string(), json!(packet.provider()));
        metadata.insert(
            "rerank_applied".to_string(),
            json!(packet.summary().rerank_applied()),
        );
        metadata.insert(
            "routing".to_string(),
            serde_json::to_value(&retrieval.routing_metadata)?,
        );

        let reply = Reply {
            packet,
            branch_code: retrieval.next_action.branch().as_str(),
            session_id,
        };
        let response = match retrieval.next_action.action() {
            Action::Proceed => self.format_proceed(reply, metadata).await,
            Action::Clarify => reply.clarify(metadata),
            Action::Fallback => reply.fallback(metadata),
            Action::Escalate => reply.escalate(metadata),
        };
        Ok(response)
    }

    async fn format_proceed(&self, reply: Reply<'_>, mut metadata: Map<String, Value>) -> PlannerResponse {
        let candidates = reply.packet.candidates();
        if candidates.is_empty() {
            return reply.fallback(metadata);
        }

        let text = match &self.llm {
            Some(llm) => {
                let query = self
                    .conversations
                    .get(reply.session_id)
                    .and_then(|s| s.last_user_message().map(str::to_string))
                    .unwrap_or_default();
                let synthesis = llm.synthesize(&query, candidates).await;
                metadata.insert("llm".to_string(), Value::Object(synthesis.metadata));
                synthesis.text
            }
            None => {
                let quotes: Vec<String> = candidates
                    .iter()
                    .take(PROCEED_QUOTES)
                    .enumerate()
                    .map(|(i, c)| format!("[{}] {}", i + 1, quote(c.content())))
                    .collect();
                format!(
                    "Based on {} retrieved context(s) (top confidence: {:.2}):\n\n{}",
                    candidates.len(),
                    reply.packet.summary().top_confidence(),
                    quotes.join("\n\n")
                )
            }
        };
        reply.build(
            text,
            Action::Proceed,
            Vec::new(),
            candidates.len(),
            reply.packet.summary().top_confidence(),
            metadata,
        )
    }

    fn record_error_trace(
        &self,
        query: &str,
        mode: Mode,
        top_k: usize,
        threshold: f64,
        started: Instant,
        err: &BrainError,
    ) {
        let Some(traces) = &self.traces else {
            return;
        };
        let mut trace = RetrievalTrace::new(query, mode, top_k, threshold)
            .into_error(err.kind().type_name(), "retrieval_failed".to_string());
        trace.branch_code = RETRIEVAL_ERROR_BRANCH.to_string();
        trace.reason = "planner_retrieval_exception".to_string();
        trace.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        traces.record(trace);
    }
}

/// Shared inputs of the per-action formatters.
#[derive(Clone, Copy)]
struct Reply<'a> {
    packet: &'a ContextPacket,
    branch_code: &'a str,
    session_id: &'a str,
}

impl Reply<'_> {
    fn build(
        &self,
        response_text: String,
        action_taken: Action,
        suggestions: Vec<&str>,
        candidates_used: usize,
        confidence: f64,
        metadata: Map<String, Value>,
    ) -> PlannerResponse {
        PlannerResponse {
            response_text,
            action_taken,
            branch_code: self.branch_code.to_string(),
            session_id: self.session_id.to_string(),
            suggestions: suggestions.into_iter().map(str::to_string).collect(),
            candidates_used,
            confidence,
            retrieval_metadata: Value::Object(metadata),
        }
    }

    fn clarify(&self, metadata: Map<String, Value>) -> PlannerResponse {
        let top = self.packet.summary().top_confidence();
        self.build(
            format!(
                "I found some results but confidence is low ({top:.2}). \
                 Could you provide more detail about what you're looking for?"
            ),
            Action::Clarify,
            vec![
                "Try being more specific about the topic",
                "Include keywords from the content you're looking for",
                "Narrow the scope to a particular source or time period",
            ],
            self.packet.candidates().len(),
            top,
            metadata,
        )
    }

    fn fallback(&self, metadata: Map<String, Value>) -> PlannerResponse {
        self.build(
            "I couldn't find relevant context for your query. \
             Try rephrasing or providing more context."
                .to_string(),
            Action::Fallback,
            vec![
                "Rephrase your question with different keywords",
                "Provide more context about what you need",
                "Try a broader search term",
            ],
            0,
            0.0,
            metadata,
        )
    }

    fn escalate(&self, metadata: Map<String, Value>) -> PlannerResponse {
        self.build(
            "The retrieved context doesn't seem to match your query intent. \
             This may require manual review or a different approach."
                .to_string(),
            Action::Escalate,
            vec![
                "Try specifying the exact topic or domain",
                "Check if the content has been ingested into the system",
            ],
            self.packet.candidates().len(),
            self.packet.summary().top_confidence(),
            metadata,
        )
    }
}

fn retrieval_error_response(session_id: &str, err: &BrainError) -> PlannerResponse {
    PlannerResponse {
        response_text: "I hit a retrieval issue while processing your request. \
                        Please try again or rephrase your query."
            .to_string(),
        action_taken: Action::Fallback,
        branch_code: RETRIEVAL_ERROR_BRANCH.to_string(),
        session_id: session_id.to_string(),
        suggestions: vec![
            "Retry the same query in a moment".to_string(),
            "Rephrase with simpler or more specific terms".to_string(),
            "Try a broader search term".to_string(),
        ],
        candidates_used: 0,
        confidence: 0.0,
        retrieval_metadata: json!({
            "provider": "unknown",
            "rerank_applied": false,
            "routing": {},
            "error_type": err.kind().type_name(),
            "error_message": "retrieval_failed",
        }),
    }
}
