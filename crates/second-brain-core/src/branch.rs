//! Branch classification.
//!
//! Builds the [`ContextPacket`] / [`NextAction`] pair for a candidate set.
//! The emitters in this module are the only constructors of those types,
//! so every packet carries the action its branch dictates:
//!
//! | Branch | Action | `threshold_met` | `rerank_applied` |
//! |--------|--------|-----------------|------------------|
//! | `EMPTY_SET` | fallback | false | false |
//! | `LOW_CONFIDENCE` | clarify | false | false |
//! | `CHANNEL_MISMATCH` | escalate | false | false |
//! | `RERANK_BYPASSED` | proceed | top >= threshold | true |
//! | `SUCCESS` | proceed | true | as supplied |
//!
//! [`determine_branch`] checks, in order: empty set, top confidence below
//! threshold, mem0 with rerank bypassed, success. Low confidence always
//! wins over rerank bypass. `CHANNEL_MISMATCH` is only produced by
//! [`force_branch`].

use chrono::Utc;

use crate::models::{
    provider_label, Action, Branch, ConfidenceSummary, ContextCandidate, ContextPacket,
    NextAction, Provider,
};

/// Channel reported by forced `CHANNEL_MISMATCH` packets.
pub const FORCED_EXPECTED_CHANNEL: &str = "test_channel";
/// Confidence given to candidates by a forced `LOW_CONFIDENCE` branch.
pub const FORCED_LOW_CONFIDENCE: f64 = 0.4;
const FORCED_BYPASS_CONFIDENCE: f64 = 0.85;
const FORCED_SUCCESS_CONFIDENCE: f64 = 0.9;

/// Highest candidate confidence, or `0.0` for an empty slice.
pub fn top_confidence(candidates: &[ContextCandidate]) -> f64 {
    candidates
        .iter()
        .map(ContextCandidate::confidence)
        .fold(0.0, f64::max)
}

fn packet(
    branch: Branch,
    candidates: Vec<ContextCandidate>,
    top: f64,
    threshold_met: bool,
    rerank_applied: bool,
    provider: &str,
) -> ContextPacket {
    ContextPacket {
        summary: ConfidenceSummary {
            top_confidence: top,
            candidate_count: candidates.len(),
            threshold_met,
            rerank_applied,
        },
        candidates,
        provider: provider.to_string(),
        branch,
        timestamp: Utc::now(),
    }
}

fn action(branch: Branch, reason: String, suggestion: Option<&str>) -> NextAction {
    NextAction {
        action: branch.action(),
        reason,
        branch,
        suggestion: suggestion.map(str::to_string),
    }
}

pub fn emit_empty_set(provider: &str) -> (ContextPacket, NextAction) {
    (
        packet(Branch::EmptySet, Vec::new(), 0.0, false, false, provider),
        action(
            Branch::EmptySet,
            "No context candidates retrieved from any provider".to_string(),
            Some("Ask user to rephrase query or provide more context"),
        ),
    )
}

pub fn emit_low_confidence(
    candidates: Vec<ContextCandidate>,
    top: f64,
    threshold: f64,
    provider: &str,
) -> (ContextPacket, NextAction) {
    (
        packet(Branch::LowConfidence, candidates, top, false, false, provider),
        action(
            Branch::LowConfidence,
            format!("Top confidence {top:.2} below threshold {threshold:.2}"),
            Some("Request clarification on query intent or narrow scope"),
        ),
    )
}

pub fn emit_channel_mismatch(
    candidates: Vec<ContextCandidate>,
    expected_channel: &str,
    provider: &str,
) -> (ContextPacket, NextAction) {
    let top = top_confidence(&candidates);
    (
        packet(Branch::ChannelMismatch, candidates, top, false, false, provider),
        action(
            Branch::ChannelMismatch,
            format!("Retrieved context doesn't match expected channel: {expected_channel}"),
            Some("Escalate to human or trigger intent reclassification"),
        ),
    )
}

pub fn emit_rerank_bypassed(
    candidates: Vec<ContextCandidate>,
    threshold: f64,
    provider: &str,
) -> (ContextPacket, NextAction) {
    let top = top_confidence(&candidates);
    (
        packet(Branch::RerankBypassed, candidates, top, top >= threshold, true, provider),
        action(
            Branch::RerankBypassed,
            "Provider-native rerank applied, external rerank bypassed per policy".to_string(),
            None,
        ),
    )
}

pub fn emit_success(
    candidates: Vec<ContextCandidate>,
    rerank_applied: bool,
    provider: &str,
) -> (ContextPacket, NextAction) {
    let top = top_confidence(&candidates);
    let reason = format!("Retrieved {} high-confidence candidates", candidates.len());
    (
        packet(Branch::Success, candidates, top, true, rerank_applied, provider),
        action(Branch::Success, reason, None),
    )
}

/// Classify a candidate set.
pub fn determine_branch(
    candidates: Vec<ContextCandidate>,
    threshold: f64,
    rerank_bypassed: bool,
    provider: Option<Provider>,
) -> (ContextPacket, NextAction) {
    let label = provider_label(provider);
    if candidates.is_empty() {
        return emit_empty_set(label);
    }
    let top = top_confidence(&candidates);
    if top < threshold {
        return emit_low_confidence(candidates, top, threshold, label);
    }
    if rerank_bypassed && provider == Some(Provider::Mem0) {
        return emit_rerank_bypassed(candidates, threshold, label);
    }
    emit_success(candidates, rerank_bypassed, label)
}

/// Produce a specific branch regardless of the candidates. Validation only.
///
/// Candidates are rewritten or synthesized so the forced packet is
/// internally consistent: `LOW_CONFIDENCE` lowers every confidence to
/// [`FORCED_LOW_CONFIDENCE`], and the proceed branches add a single
/// `forced` candidate when none were retrieved.
pub fn force_branch(
    branch: Branch,
    candidates: Vec<ContextCandidate>,
    provider: Option<Provider>,
    skip_external_rerank: bool,
    threshold: f64,
) -> (ContextPacket, NextAction) {
    let label = provider_label(provider);
    let or_forced = |candidates: Vec<ContextCandidate>, content: &str, confidence: f64| {
        if candidates.is_empty() {
            vec![ContextCandidate::new("forced", content, label, confidence)]
        } else {
            candidates
        }
    };

    match branch {
        Branch::EmptySet => emit_empty_set(label),
        Branch::LowConfidence => {
            let lowered = candidates
                .iter()
                .map(|c| c.with_confidence(FORCED_LOW_CONFIDENCE))
                .collect();
            emit_low_confidence(lowered, FORCED_LOW_CONFIDENCE, threshold, label)
        }
        Branch::ChannelMismatch => {
            emit_channel_mismatch(candidates, FORCED_EXPECTED_CHANNEL, label)
        }
        Branch::RerankBypassed => emit_rerank_bypassed(
            or_forced(candidates, "Forced rerank bypass", FORCED_BYPASS_CONFIDENCE),
            threshold,
            label,
        ),
        Branch::Success => emit_success(
            or_forced(candidates, "Forced success", FORCED_SUCCESS_CONFIDENCE),
            skip_external_rerank,
            label,
        ),
    }
}

/// True when `action` is the one `branch` requires.
pub fn is_consistent(branch: Branch, action: Action) -> bool {
    branch.action() == action
}
