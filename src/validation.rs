//! Deterministic branch scenarios for operator validation.
//!
//! Each [`BranchScenario`] pins a request, provider status and feature
//! flags to the branch, action and rerank type a recall run must produce on
//! the deterministic fallback path (no real providers configured).
//! `brain scenarios` runs the catalogue through [`run_scenario`].

use std::sync::Arc;

use second_brain_core::error::BrainError;
use second_brain_core::flags::{FeatureFlags, ProviderStatusSnapshot};
use second_brain_core::models::{
    Action, Branch, Mode, Provider, ProviderHealth, RerankType, RetrievalRequest,
    DEFAULT_THRESHOLD,
};
use serde::Serialize;
use serde_json::Value;

use crate::memory::{ConfiguredMemoryFactory, MemoryService};
use crate::recall::{RecallOrchestrator, RunOptions};
use crate::rerank::RerankService;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchScenario {
    pub id: &'static str,
    pub description: &'static str,
    pub query: &'static str,
    pub mode: Mode,
    pub top_k: usize,
    pub threshold: f64,
    pub provider_status: ProviderStatusSnapshot,
    pub feature_flags: FeatureFlags,
    pub expected_branch: Branch,
    pub expected_action: Action,
    pub expected_rerank_type: RerankType,
    /// Run in validation mode, forcing `expected_branch`.
    pub forced: bool,
    pub tags: Vec<&'static str>,
    pub notes: &'static str,
}

impl BranchScenario {
    fn new(id: &'static str, description: &'static str, query: &'static str) -> Self {
        Self {
            id,
            description,
            query,
            mode: Mode::Conversation,
            top_k: 5,
            threshold: DEFAULT_THRESHOLD,
            provider_status: ProviderStatusSnapshot::new(),
            feature_flags: FeatureFlags::default(),
            expected_branch: Branch::Success,
            expected_action: Action::Proceed,
            expected_rerank_type: RerankType::None,
            forced: false,
            tags: Vec::new(),
            notes: "",
        }
    }

    fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    fn status(mut self, entries: &[(Provider, ProviderHealth)]) -> Self {
        for (provider, health) in entries {
            self.provider_status.set(*provider, *health);
        }
        self
    }

    fn flags(mut self, mem0: bool, supabase: bool) -> Self {
        self.feature_flags.mem0_enabled = mem0;
        self.feature_flags.supabase_enabled = supabase;
        self
    }

    fn expect(mut self, branch: Branch, rerank_type: RerankType) -> Self {
        self.expected_branch = branch;
        self.expected_action = branch.action();
        self.expected_rerank_type = rerank_type;
        self
    }

    fn tags(mut self, tags: &[&'static str]) -> Self {
        self.tags = tags.to_vec();
        self
    }

    fn notes(mut self, notes: &'static str) -> Self {
        self.notes = notes;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| *t == tag)
    }

    pub fn request(&self) -> Result<RetrievalRequest, BrainError> {
        RetrievalRequest::new(self.query, self.mode, self.top_k, self.threshold)
    }
}

pub fn all_scenarios() -> Vec<BranchScenario> {
    use Provider::{Mem0, Supabase};
    use ProviderHealth::{Available, Degraded, Unavailable};

    let mut override_on = BranchScenario::new("S025", "Mem0 external override on", "mem0 override query")
        .status(&[(Mem0, Available)])
        .expect(Branch::RerankBypassed, RerankType::ProviderNative)
        .tags(&["policy"])
        .notes("Mem0 policy still skips external even with override flag");
    override_on
        .feature_flags
        .extra
        .insert("mem0_external_override".to_string(), Value::Bool(true));

    let mut rerank_disabled = BranchScenario::new("S022", "Rerank service disabled", "rerank disabled query")
        .mode(Mode::Fast)
        .status(&[(Mem0, Unavailable), (Supabase, Available)])
        .flags(false, true)
        .expect(Branch::Success, RerankType::None)
        .tags(&["policy"]);
    rerank_disabled.feature_flags.external_rerank_enabled = false;

    let mut channel_mismatch =
        BranchScenario::new("S027", "Channel mismatch forced validation", "channel mismatch query")
            .status(&[(Mem0, Available)])
            .expect(Branch::ChannelMismatch, RerankType::ProviderNative)
            .tags(&["edge", "validation"])
            .notes("Requires validation mode and a forced branch");
    channel_mismatch.forced = true;

    vec![
        BranchScenario::new("S001", "Conversation Mem0 high confidence", "test high confidence query")
            .status(&[(Mem0, Available), (Supabase, Available)])
            .expect(Branch::RerankBypassed, RerankType::ProviderNative)
            .tags(&["smoke", "policy"]),
        BranchScenario::new("S002", "Conversation Mem0 no candidates", "empty set query")
            .status(&[(Mem0, Available)])
            .flags(true, false)
            .expect(Branch::EmptySet, RerankType::ProviderNative)
            .tags(&["smoke", "edge"]),
        BranchScenario::new("S003", "Conversation Mem0 low confidence", "low confidence query")
            .status(&[(Mem0, Available)])
            .expect(Branch::LowConfidence, RerankType::ProviderNative)
            .tags(&["smoke", "edge"]),
        BranchScenario::new("S004", "Conversation Supabase high confidence", "supabase query")
            .status(&[(Mem0, Unavailable), (Supabase, Available)])
            .flags(false, true)
            .expect(Branch::Success, RerankType::External)
            .tags(&["smoke"]),
        rerank_disabled,
        override_on,
        BranchScenario::new("S026", "Mem0 external override off default", "mem0 default query")
            .status(&[(Mem0, Available)])
            .expect(Branch::RerankBypassed, RerankType::ProviderNative)
            .tags(&["policy"]),
        BranchScenario::new("S015", "Mem0 degraded, Supabase available fallback", "degraded mem0 query")
            .status(&[(Mem0, Degraded), (Supabase, Available)])
            .expect(Branch::LowConfidence, RerankType::None)
            .tags(&["degraded"])
            .notes("Routes to supabase when mem0 is degraded; single candidate skips rerank"),
        BranchScenario::new("S016", "Mem0 available, Supabase degraded", "mem0 primary query")
            .status(&[(Mem0, Available), (Supabase, Degraded)])
            .expect(Branch::RerankBypassed, RerankType::ProviderNative)
            .tags(&["degraded"]),
        BranchScenario::new("S013", "All providers disabled", "no providers query")
            .flags(false, false)
            .expect(Branch::EmptySet, RerankType::None)
            .tags(&["edge"]),
        BranchScenario::new("S014", "All providers unavailable", "all unavailable query")
            .status(&[(Mem0, Unavailable), (Supabase, Unavailable)])
            .expect(Branch::EmptySet, RerankType::None)
            .tags(&["edge"]),
        channel_mismatch,
        BranchScenario::new("S048", "Deterministic replay test 1", "deterministic test query")
            .status(&[(Mem0, Available)])
            .expect(Branch::RerankBypassed, RerankType::ProviderNative)
            .tags(&["policy", "deterministic"]),
    ]
}

pub fn scenario_by_id(id: &str) -> Option<BranchScenario> {
    all_scenarios().into_iter().find(|s| s.id == id)
}

pub fn scenarios_by_tag(tag: &str) -> Vec<BranchScenario> {
    all_scenarios().into_iter().filter(|s| s.has_tag(tag)).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioOutcome {
    pub id: &'static str,
    pub passed: bool,
    pub branch: Branch,
    pub action: Action,
    pub rerank_type: RerankType,
    pub selected_provider: String,
    pub mismatches: Vec<String>,
}

/// Run one scenario through a fresh orchestrator with no real backends.
pub async fn run_scenario(scenario: &BranchScenario) -> Result<ScenarioOutcome, BrainError> {
    let flags = scenario.feature_flags.clone();
    let rerank = RerankService::new(flags.external_rerank_enabled, "rerank-2");
    let orchestrator = RecallOrchestrator::new(
        Arc::new(MemoryService::new(Provider::Mem0)),
        Arc::new(ConfiguredMemoryFactory::default()),
        Arc::new(rerank),
        flags,
        scenario.provider_status.clone(),
    );
    let options = if scenario.forced {
        RunOptions::forced(scenario.expected_branch)
    } else {
        RunOptions::default()
    };
    let response = orchestrator.run_with(&scenario.request()?, options).await?;

    let branch = response.context_packet.branch();
    let action = response.next_action.action();
    let rerank_type = response.routing_metadata.rerank_type;
    let mut mismatches = Vec::new();
    if branch != scenario.expected_branch {
        mismatches.push(format!("branch: expected {}, got {}", scenario.expected_branch, branch));
    }
    if action != scenario.expected_action {
        mismatches.push(format!("action: expected {}, got {}", scenario.expected_action, action));
    }
    if rerank_type != scenario.expected_rerank_type {
        mismatches.push(format!(
            "rerank_type: expected {}, got {}",
            scenario.expected_rerank_type, rerank_type
        ));
    }

    Ok(ScenarioOutcome {
        id: scenario.id,
        passed: mismatches.is_empty(),
        branch,
        action,
        rerank_type,
        selected_provider: response.routing_metadata.selected_provider,
        mismatches,
    })
}
