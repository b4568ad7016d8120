//! Model catalog with cost/quality tiers and deterministic fallback order.
//!
//! Pure lookup: the registry is built once at startup from configuration and
//! never mutated by the router. Tenant allow-lists filter the catalog; the
//! tier order is total and downgrades are monotonic.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::provider::CompletionModel;
use crate::task::TenantId;

/// Ordered capability/cost class. `Reasoning` is the most capable and most
/// expensive; `Local` the least. The router only ever moves down this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Reasoning,
    Generation,
    Conversation,
    Classification,
    Local,
}

impl ModelTier {
    /// Capability rank; higher is more capable.
    pub fn rank(self) -> u8 {
        match self {
            Self::Reasoning => 4,
            Self::Generation => 3,
            Self::Conversation => 2,
            Self::Classification => 1,
            Self::Local => 0,
        }
    }

    /// The next cheaper tier in the total order, or `None` at the bottom.
    pub fn next_cheaper(self) -> Option<ModelTier> {
        match self {
            Self::Reasoning => Some(Self::Generation),
            Self::Generation => Some(Self::Conversation),
            Self::Conversation => Some(Self::Classification),
            Self::Classification => Some(Self::Local),
            Self::Local => None,
        }
    }

    pub fn as_key(self) -> &'static str {
        match self {
            Self::Reasoning => "reasoning",
            Self::Generation => "generation",
            Self::Conversation => "conversation",
            Self::Classification => "classification",
            Self::Local => "local",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model_id: String,
    pub tier: ModelTier,
    pub provider: String,
}

/// Catalog of completion models grouped by tier, with per-tenant allow-lists.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    by_tier: HashMap<ModelTier, Vec<ModelDescriptor>>,
    adapters: HashMap<String, Arc<dyn CompletionModel>>,
    tenant_allow_lists: HashMap<String, HashSet<String>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model and its adapter. Within a tier, registration order is
    /// the preference order: the first registered model is the tier primary.
    pub fn register(
        &mut self,
        descriptor: ModelDescriptor,
        adapter: Arc<dyn CompletionModel>,
    ) -> &mut Self {
        self.adapters.insert(descriptor.model_id.clone(), adapter);
        self.by_tier.entry(descriptor.tier).or_default().push(descriptor);
        self
    }

    /// Restrict a tenant to an explicit model allow-list. Tenants without an
    /// entry see the full catalog.
    pub fn allow_for_tenant(
        &mut self,
        tenant_id: impl Into<String>,
        model_ids: impl IntoIterator<Item = String>,
    ) -> &mut Self {
        self.tenant_allow_lists.insert(tenant_id.into(), model_ids.into_iter().collect());
        self
    }

    fn tenant_allows(&self, tenant_id: Option<&TenantId>, model_id: &str) -> bool {
        let Some(tenant_id) = tenant_id else {
            return true;
        };
        match self.tenant_allow_lists.get(&tenant_id.0) {
            Some(allowed) => allowed.contains(model_id),
            None => true,
        }
    }

    /// Ordered models for one tier, filtered by the tenant allow-list.
    pub fn models_for_tier(
        &self,
        tier: ModelTier,
        tenant_id: Option<&TenantId>,
    ) -> Vec<ModelDescriptor> {
        self.by_tier
            .get(&tier)
            .map(|models| {
                models
                    .iter()
                    .filter(|descriptor| self.tenant_allows(tenant_id, &descriptor.model_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn adapter(&self, model_id: &str) -> Option<Arc<dyn CompletionModel>> {
        self.adapters.get(model_id).cloned()
    }

    /// The fallback for `current_model_id` within `tier`:
    /// (a) the next model in the same tier's ordered list,
    /// (b) else the next cheaper tier's primary,
    /// (c) else none.
    pub fn fallback_for(
        &self,
        tier: ModelTier,
        tenant_id: Option<&TenantId>,
        current_model_id: &str,
    ) -> Option<ModelDescriptor> {
        let same_tier = self.models_for_tier(tier, tenant_id);
        if let Some(position) =
            same_tier.iter().position(|descriptor| descriptor.model_id == current_model_id)
        {
            if let Some(next) = same_tier.get(position + 1) {
                return Some(next.clone());
            }
        }

        let mut cheaper = tier.next_cheaper();
        while let Some(next_tier) = cheaper {
            if let Some(primary) = self.models_for_tier(next_tier, tenant_id).into_iter().next() {
                return Some(primary);
            }
            cheaper = next_tier.next_cheaper();
        }
        None
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("tiers", &self.by_tier.keys().collect::<Vec<_>>())
            .field("models", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
