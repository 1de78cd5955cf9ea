//! Request, candidate, and response contracts.
//!
//! These types are the shared vocabulary of the retrieval pipeline. A
//! [`RetrievalRequest`] goes in, a [`RetrievalResponse`] comes out, and in
//! between every component passes [`ContextCandidate`] values by value.
//!
//! Candidates are never mutated after construction: rerank and forced
//! validation branches build new candidates through
//! [`ContextCandidate::with_confidence`]. The response types
//! ([`ContextPacket`], [`NextAction`], [`ConfidenceSummary`]) have no public
//! constructors; only the branch classifier in [`crate::branch`] builds
//! them, which keeps every branch code paired with its action.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BrainError;
use crate::flags::{FeatureFlags, ProviderStatusSnapshot};

/// Default number of candidates requested.
pub const DEFAULT_TOP_K: usize = 5;
/// Default minimum confidence for a candidate set to count as confident.
pub const DEFAULT_THRESHOLD: f64 = 0.6;

/// Clamp a score into `[0.0, 1.0]`. `NaN` maps to `0.0`.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = BrainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(BrainError::invalid_request(format!(
                        concat!("unknown ", stringify!($name), ": '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

pub(crate) use string_enum;

/// Retrieval mode. Drives provider preference in the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Fast,
    Accurate,
    #[default]
    Conversation,
}

string_enum!(Mode {
    Fast => "fast",
    Accurate => "accurate",
    Conversation => "conversation",
});

/// A retrieval backend.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Mem0,
    Supabase,
    Graphiti,
}

string_enum!(Provider {
    Mem0 => "mem0",
    Supabase => "supabase",
    Graphiti => "graphiti",
});

/// Label used in packets and traces for an optional provider.
pub fn provider_label(provider: Option<Provider>) -> &'static str {
    provider.map(|p| p.as_str()).unwrap_or("none")
}

/// Health reported for a provider in a status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderHealth {
    Available,
    Unavailable,
    Degraded,
}

string_enum!(ProviderHealth {
    Available => "available",
    Unavailable => "unavailable",
    Degraded => "degraded",
});

/// Outcome category of a retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Branch {
    EmptySet,
    LowConfidence,
    ChannelMismatch,
    RerankBypassed,
    Success,
}

string_enum!(Branch {
    EmptySet => "EMPTY_SET",
    LowConfidence => "LOW_CONFIDENCE",
    ChannelMismatch => "CHANNEL_MISMATCH",
    RerankBypassed => "RERANK_BYPASSED",
    Success => "SUCCESS",
});

impl Branch {
    /// The only action a packet with this branch may carry.
    pub fn action(&self) -> Action {
        match self {
            Branch::EmptySet => Action::Fallback,
            Branch::LowConfidence => Action::Clarify,
            Branch::ChannelMismatch => Action::Escalate,
            Branch::RerankBypassed | Branch::Success => Action::Proceed,
        }
    }
}

/// What the planner should do with a retrieval result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Proceed,
    Clarify,
    Fallback,
    Escalate,
}

string_enum!(Action {
    Proceed => "proceed",
    Clarify => "clarify",
    Fallback => "fallback",
    Escalate => "escalate",
});

/// How ranking was applied to the final candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RerankType {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "external")]
    External,
    #[serde(rename = "provider-native")]
    ProviderNative,
}

string_enum!(RerankType {
    None => "none",
    External => "external",
    ProviderNative => "provider-native",
});

/// Validated retrieval request. Fields are read-only after construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalRequest {
    query: String,
    mode: Mode,
    top_k: usize,
    threshold: f64,
    provider_override: Option<Provider>,
}

impl RetrievalRequest {
    /// Build a request, rejecting `top_k == 0` and thresholds outside `[0, 1]`.
    pub fn new(
        query: impl Into<String>,
        mode: Mode,
        top_k: usize,
        threshold: f64,
    ) -> Result<Self, BrainError> {
        if top_k == 0 {
            return Err(BrainError::invalid_request("top_k must be >= 1"));
        }
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(BrainError::invalid_request(format!(
                "threshold must be in [0.0, 1.0], got {threshold}"
            )));
        }
        Ok(Self {
            query: query.into(),
            mode,
            top_k,
            threshold,
            provider_override: None,
        })
    }

    /// Request with the default mode, `top_k`, and threshold.
    pub fn with_defaults(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            mode: Mode::default(),
            top_k: DEFAULT_TOP_K,
            threshold: DEFAULT_THRESHOLD,
            provider_override: None,
        }
    }

    pub fn with_provider_override(mut self, provider: Provider) -> Self {
        self.provider_override = Some(provider);
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn provider_override(&self) -> Option<Provider> {
        self.provider_override
    }
}

/// A single retrieved item with a normalized confidence in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextCandidate {
    id: String,
    content: String,
    source: String,
    confidence: f64,
    metadata: Map<String, Value>,
}

impl ContextCandidate {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        source: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            source: source.into(),
            confidence: clamp_confidence(confidence),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Copy of this candidate with a different (clamped) confidence.
    pub fn with_confidence(&self, confidence: f64) -> Self {
        Self {
            confidence: clamp_confidence(confidence),
            ..self.clone()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }
}

/// Confidence facts for a packet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfidenceSummary {
    pub(crate) top_confidence: f64,
    pub(crate) candidate_count: usize,
    pub(crate) threshold_met: bool,
    pub(crate) rerank_applied: bool,
}

impl ConfidenceSummary {
    pub fn top_confidence(&self) -> f64 {
        self.top_confidence
    }

    pub fn candidate_count(&self) -> usize {
        self.candidate_count
    }

    pub fn threshold_met(&self) -> bool {
        self.threshold_met
    }

    pub fn rerank_applied(&self) -> bool {
        self.rerank_applied
    }
}

/// Final candidate set plus its branch classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextPacket {
    pub(crate) candidates: Vec<ContextCandidate>,
    pub(crate) summary: ConfidenceSummary,
    pub(crate) provider: String,
    pub(crate) branch: Branch,
    pub(crate) timestamp: DateTime<Utc>,
}

impl ContextPacket {
    pub fn candidates(&self) -> &[ContextCandidate] {
        &self.candidates
    }

    pub fn summary(&self) -> &ConfidenceSummary {
        &self.summary
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn branch(&self) -> Branch {
        self.branch
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Planner instruction paired with a [`ContextPacket`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextAction {
    pub(crate) action: Action,
    pub(crate) reason: String,
    pub(crate) branch: Branch,
    pub(crate) suggestion: Option<String>,
}

impl NextAction {
    pub fn action(&self) -> Action {
        self.action
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn branch(&self) -> Branch {
        self.branch
    }

    pub fn suggestion(&self) -> Option<&str> {
        self.suggestion.as_deref()
    }
}

/// Metadata reported by the memory facade for one search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub provider: String,
    pub raw_count: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mock_mode: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub query_empty: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub used_fallback: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub real_provider: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_applied: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl ProviderMetadata {
    pub fn for_provider(provider: Provider) -> Self {
        Self {
            provider: provider.as_str().to_string(),
            ..Self::default()
        }
    }
}

/// Metadata reported by the rerank stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerankMetadata {
    pub rerank_type: RerankType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass_reason: Option<String>,
    #[serde(default)]
    pub real_rerank: bool,
    #[serde(default)]
    pub candidates_in: usize,
    #[serde(default)]
    pub candidates_out: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

/// Diagnostic metadata attached to every [`RetrievalResponse`].
///
/// Named fields are always present. `extra` is additive-only: use
/// [`RoutingMetadata::add_extra`], which never overwrites an existing key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingMetadata {
    pub selected_provider: String,
    pub mode: Mode,
    pub skip_external_rerank: bool,
    pub rerank_type: RerankType,
    pub rerank_bypass_reason: Option<String>,
    pub feature_flags_snapshot: FeatureFlags,
    pub provider_status_snapshot: ProviderStatusSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<ProviderMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_metadata: Option<RerankMetadata>,
    pub validation_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced_branch: Option<Branch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl RoutingMetadata {
    pub fn new(
        selected_provider: &str,
        mode: Mode,
        flags: &FeatureFlags,
        status: &ProviderStatusSnapshot,
    ) -> Self {
        Self {
            selected_provider: selected_provider.to_string(),
            mode,
            skip_external_rerank: false,
            rerank_type: RerankType::None,
            rerank_bypass_reason: None,
            feature_flags_snapshot: flags.clone(),
            provider_status_snapshot: status.clone(),
            provider_metadata: None,
            rerank_metadata: None,
            validation_mode: false,
            forced_branch: None,
            trace_id: None,
            extra: Map::new(),
        }
    }

    /// Insert an extra key. Returns `false` (and changes nothing) if the key
    /// already exists.
    pub fn add_extra(&mut self, key: &str, value: impl Into<Value>) -> bool {
        if self.extra.contains_key(key) {
            return false;
        }
        self.extra.insert(key.to_string(), value.into());
        true
    }

    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }
}

/// Output of one recall run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResponse {
    pub context_packet: ContextPacket,
    pub next_action: NextAction,
    pub routing_metadata: RoutingMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        assert!(RetrievalRequest::new("q", Mode::Fast, 0, 0.5).is_err());
        assert!(RetrievalRequest::new("q", Mode::Fast, 1, 1.5).is_err());
        assert!(RetrievalRequest::new("q", Mode::Fast, 1, f64::NAN).is_err());
        let req = RetrievalRequest::new("q", Mode::Fast, 3, 0.0).unwrap();
        assert_eq!(req.top_k(), 3);
        assert_eq!(req.provider_override(), None);
    }

    #[test]
    fn test_candidate_confidence_is_clamped() {
        assert_eq!(ContextCandidate::new("a", "b", "c", 1.7).confidence(), 1.0);
        assert_eq!(ContextCandidate::new("a", "b", "c", -0.2).confidence(), 0.0);
        assert_eq!(ContextCandidate::new("a", "b", "c", f64::NAN).confidence(), 0.0);
    }

    #[test]
    fn test_with_confidence_keeps_other_fields() {
        let c = ContextCandidate::new("a", "body", "mem0", 0.9).with_meta("k", 1);
        let low = c.with_confidence(0.4);
        assert_eq!(low.id(), "a");
        assert_eq!(low.metadata()["k"], 1);
        assert_eq!(low.confidence(), 0.4);
        assert_eq!(c.confidence(), 0.9);
    }

    #[test]
    fn test_enum_string_forms() {
        assert_eq!("provider-native".parse::<RerankType>().unwrap(), RerankType::ProviderNative);
        assert_eq!(Branch::RerankBypassed.as_str(), "RERANK_BYPASSED");
        assert_eq!(
            serde_json::to_value(Branch::EmptySet).unwrap(),
            serde_json::json!("EMPTY_SET")
        );
        assert_eq!(
            serde_json::to_value(RerankType::ProviderNative).unwrap(),
            serde_json::json!("provider-native")
        );
        assert!("MEM0".parse::<Provider>().is_err());
    }

    #[test]
    fn test_branch_action_table() {
        assert_eq!(Branch::EmptySet.action(), Action::Fallback);
        assert_eq!(Branch::LowConfidence.action(), Action::Clarify);
        assert_eq!(Branch::ChannelMismatch.action(), Action::Escalate);
        assert_eq!(Branch::RerankBypassed.action(), Action::Proceed);
        assert_eq!(Branch::Success.action(), Action::Proceed);
    }

    #[test]
    fn test_routing_extra_is_additive() {
        let mut meta = RoutingMetadata::new(
            "mem0",
            Mode::Conversation,
            &FeatureFlags::default(),
            &ProviderStatusSnapshot::default(),
        );
        assert!(meta.add_extra("note", "first"));
        assert!(!meta.add_extra("note", "second"));
        assert_eq!(meta.extra()["note"], "first");
    }
}
