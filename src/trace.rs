//! In-memory retrieval traces.
//!
//! One [`RetrievalTrace`] is recorded per recall run (including failed
//! runs). The [`TraceCollector`] keeps the newest `max_traces` records and
//! can forward each record to a callback, invoked after the record is
//! stored and outside the collector's lock.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use second_brain_core::flags::{FeatureFlags, ProviderStatusSnapshot};
use second_brain_core::models::{Mode, Provider, RerankType};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Ok,
    Error,
}

/// Branch code recorded for runs that failed before classification.
pub const ERROR_BRANCH_CODE: &str = "ERROR";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalTrace {
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: f64,

    pub query: String,
    pub mode: Mode,
    pub top_k: usize,
    pub threshold: f64,
    pub provider_override: Option<Provider>,

    pub selected_provider: String,
    pub feature_flags_snapshot: Option<FeatureFlags>,
    pub provider_status_snapshot: Option<ProviderStatusSnapshot>,

    pub raw_candidate_count: usize,
    pub final_candidate_count: usize,
    pub top_confidence: f64,

    pub rerank_type: RerankType,
    pub rerank_bypass_reason: Option<String>,
    pub skip_external_rerank: bool,

    pub branch_code: String,
    pub action: String,
    pub reason: String,

    pub validation_mode: bool,
    pub forced_branch: Option<String>,

    pub status: TraceStatus,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl RetrievalTrace {
    /// A fresh `ok` trace with a new id and the current timestamp.
    /// Callers fill in the remaining fields.
    pub fn new(query: &str, mode: Mode, top_k: usize, threshold: f64) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            duration_ms: 0.0,
            query: query.to_string(),
            mode,
            top_k,
            threshold,
            provider_override: None,
            selected_provider: "unknown".to_string(),
            feature_flags_snapshot: None,
            provider_status_snapshot: None,
            raw_candidate_count: 0,
            final_candidate_count: 0,
            top_confidence: 0.0,
            rerank_type: RerankType::None,
            rerank_bypass_reason: None,
            skip_external_rerank: false,
            branch_code: ERROR_BRANCH_CODE.to_string(),
            action: "fallback".to_string(),
            reason: String::new(),
            validation_mode: false,
            forced_branch: None,
            status: TraceStatus::Ok,
            error_type: None,
            error_message: None,
        }
    }

    /// Mark as failed with an already sanitized message.
    pub fn into_error(mut self, error_type: &str, message: String) -> Self {
        self.status = TraceStatus::Error;
        self.branch_code = ERROR_BRANCH_CODE.to_string();
        self.action = "fallback".to_string();
        self.reason = error_type.to_string();
        self.error_type = Some(error_type.to_string());
        self.error_message = Some(message);
        self
    }
}

pub type TraceCallback = Box<dyn Fn(&RetrievalTrace) + Send + Sync>;

pub struct TraceCollector {
    max_traces: usize,
    traces: Mutex<VecDeque<RetrievalTrace>>,
    callback: Option<TraceCallback>,
}

impl TraceCollector {
    pub fn new(max_traces: usize) -> Self {
        Self {
            max_traces: max_traces.max(1),
            traces: Mutex::new(VecDeque::new()),
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: TraceCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<RetrievalTrace>> {
        self.traces.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `trace`, evicting the oldest record at capacity.
    pub fn record(&self, trace: RetrievalTrace) {
        let forwarded = self.callback.as_ref().map(|_| trace.clone());
        {
            let mut traces = self.lock();
            while traces.len() >= self.max_traces {
                traces.pop_front();
            }
            traces.push_back(trace);
        }
        if let (Some(callback), Some(trace)) = (&self.callback, forwarded) {
            callback(&trace);
        }
    }

    /// Every stored trace, oldest first.
    pub fn traces(&self) -> Vec<RetrievalTrace> {
        self.lock().iter().cloned().collect()
    }

    pub fn get_by_id(&self, trace_id: &str) -> Option<RetrievalTrace> {
        self.lock().iter().find(|t| t.trace_id == trace_id).cloned()
    }

    /// The `n` newest traces, oldest first.
    pub fn latest(&self, n: usize) -> Vec<RetrievalTrace> {
        let traces = self.lock();
        let skip = traces.len().saturating_sub(n);
        traces.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }
}

impl Default for TraceCollector {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn trace(query: &str) -> RetrievalTrace {
        RetrievalTrace::new(query, Mode::Conversation, 5, 0.6)
    }

    #[test]
    fn test_evicts_oldest_at_capacity() {
        let collector = TraceCollector::new(2);
        collector.record(trace("a"));
        collector.record(trace("b"));
        collector.record(trace("c"));
        let queries: Vec<String> = collector.traces().into_iter().map(|t| t.query).collect();
        assert_eq!(queries, vec!["b", "c"]);
        assert_eq!(collector.count(), 2);
    }

    #[test]
    fn test_latest_and_lookup() {
        let collector = TraceCollector::default();
        let first = trace("a");
        let id = first.trace_id.clone();
        collector.record(first);
        collector.record(trace("b"));
        collector.record(trace("c"));

        let latest: Vec<String> = collector.latest(2).into_iter().map(|t| t.query).collect();
        assert_eq!(latest, vec!["b", "c"]);
        assert_eq!(collector.latest(10).len(), 3);
        assert!(collector.latest(0).is_empty());
        assert_eq!(collector.get_by_id(&id).unwrap().query, "a");
        assert!(collector.get_by_id("missing").is_none());

        collector.clear();
        assert_eq!(collector.count(), 0);
    }

    #[test]
    fn test_callback_runs_after_store() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let collector = TraceCollector::new(10).with_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        collector.record(trace("a"));
        collector.record(trace("b"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_error_trace() {
        let t = trace("q").into_error("ProviderError", "boom".to_string());
        assert_eq!(t.status, TraceStatus::Error);
        assert_eq!(t.branch_code, ERROR_BRANCH_CODE);
        assert_eq!(t.error_message.as_deref(), Some("boom"));
    }
}
