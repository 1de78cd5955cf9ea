//! Feature flags and provider status snapshots.
//!
//! Both are plain values passed into the router per request. Nothing here
//! is global: the application builds one [`FeatureFlags`] and one
//! [`ProviderStatusSnapshot`] from its configuration and hands copies to
//! the orchestrator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Provider, ProviderHealth};

/// Provider on/off switches plus the external rerank toggle.
///
/// Unknown keys are kept in `extra` and ignored by routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default = "default_true")]
    pub mem0_enabled: bool,
    #[serde(default = "default_true")]
    pub supabase_enabled: bool,
    #[serde(default)]
    pub graphiti_enabled: bool,
    #[serde(default = "default_true")]
    pub external_rerank_enabled: bool,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_true() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            mem0_enabled: true,
            supabase_enabled: true,
            graphiti_enabled: false,
            external_rerank_enabled: true,
            extra: BTreeMap::new(),
        }
    }
}

impl FeatureFlags {
    /// Enabled providers in routing order: graphiti, mem0, supabase.
    pub fn eligible_providers(&self) -> Vec<Provider> {
        let mut eligible = Vec::with_capacity(3);
        if self.graphiti_enabled {
            eligible.push(Provider::Graphiti);
        }
        if self.mem0_enabled {
            eligible.push(Provider::Mem0);
        }
        if self.supabase_enabled {
            eligible.push(Provider::Supabase);
        }
        eligible
    }

    /// All providers disabled.
    pub fn none_enabled() -> Self {
        Self {
            mem0_enabled: false,
            supabase_enabled: false,
            graphiti_enabled: false,
            ..Self::default()
        }
    }
}

/// Reported health per provider.
///
/// A provider missing from the snapshot is treated as
/// [`ProviderHealth::Available`] by [`ProviderStatusSnapshot::health`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderStatusSnapshot {
    statuses: BTreeMap<Provider, ProviderHealth>,
}

impl ProviderStatusSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot with every provider set to `health`.
    pub fn all(health: ProviderHealth) -> Self {
        Self::new()
            .with(Provider::Mem0, health)
            .with(Provider::Supabase, health)
            .with(Provider::Graphiti, health)
    }

    pub fn with(mut self, provider: Provider, health: ProviderHealth) -> Self {
        self.statuses.insert(provider, health);
        self
    }

    pub fn set(&mut self, provider: Provider, health: ProviderHealth) {
        self.statuses.insert(provider, health);
    }

    /// Explicitly reported health, if any.
    pub fn reported(&self, provider: Provider) -> Option<ProviderHealth> {
        self.statuses.get(&provider).copied()
    }

    /// Normalized health: missing means available.
    pub fn health(&self, provider: Provider) -> ProviderHealth {
        self.reported(provider).unwrap_or(ProviderHealth::Available)
    }
}
