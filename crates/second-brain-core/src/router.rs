//! Provider selection.
//!
//! [`route`] is a pure function of the request, the status snapshot, and
//! the feature flags. It never fails: when no provider can serve the
//! request it returns a decision with `provider: None` and the
//! orchestrator answers with an empty set.
//!
//! # Algorithm
//!
//! 1. Eligible providers come from the flags, in the order graphiti,
//!    mem0, supabase.
//! 2. Status is normalized: an eligible provider missing from the
//!    snapshot counts as available.
//! 3. An override is honored only when it is eligible and exactly
//!    available. Otherwise routing falls through to mode selection.
//! 4. Mode preference:
//!    - `conversation`: mem0, then supabase
//!    - `fast`: first available of mem0, supabase, graphiti
//!    - `accurate`: first available in eligible order
//! 5. Fallback for every mode: first eligible provider that is available
//!    or degraded.
//!
//! External rerank is skipped exactly when mem0 is selected, since mem0
//! ranks natively.

use serde::Serialize;

use crate::flags::{FeatureFlags, ProviderStatusSnapshot};
use crate::models::{Mode, Provider, ProviderHealth, RetrievalRequest};

const FAST_ORDER: [Provider; 3] = [Provider::Mem0, Provider::Supabase, Provider::Graphiti];
const CONVERSATION_ORDER: [Provider; 2] = [Provider::Mem0, Provider::Supabase];

/// Result of [`route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub provider: Option<Provider>,
    pub skip_external_rerank: bool,
}

impl RouteDecision {
    fn selected(provider: Option<Provider>) -> Self {
        Self {
            provider,
            skip_external_rerank: provider == Some(Provider::Mem0),
        }
    }
}

/// Select a provider for `request`.
pub fn route(
    request: &RetrievalRequest,
    status: &ProviderStatusSnapshot,
    flags: &FeatureFlags,
) -> RouteDecision {
    let eligible = flags.eligible_providers();
    let is_available = |p: &Provider| status.health(*p) == ProviderHealth::Available;

    if let Some(wanted) = request.provider_override() {
        if eligible.contains(&wanted) && is_available(&wanted) {
            return RouteDecision::selected(Some(wanted));
        }
    }

    let preferred = match request.mode() {
        Mode::Conversation => CONVERSATION_ORDER
            .iter()
            .find(|p| eligible.contains(p) && is_available(p))
            .copied(),
        Mode::Fast => FAST_ORDER
            .iter()
            .find(|p| eligible.contains(p) && is_available(p))
            .copied(),
        Mode::Accurate => eligible.iter().find(|p| is_available(p)).copied(),
    };

    let provider = preferred.or_else(|| {
        eligible
            .iter()
            .find(|p| {
                matches!(
                    status.health(**p),
                    ProviderHealth::Available | ProviderHealth::Degraded
                )
            })
            .copied()
    });

    RouteDecision::selected(provider)
}
