use crate::llm::TaskCategory;
use crate::resilience::key_pool::{KeyRotationPool, QuotaReset};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CAPABLE_TIER_EXHAUSTED: &str = "capable tier quota exhausted";

/// Model quality/cost level offered by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Capable,
    Fast,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelTier::Capable => f.write_str("capable"),
            ModelTier::Fast => f.write_str("fast"),
        }
    }
}

/// Exhaustion record for one (provider, tier) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierExhaustion {
    pub exhausted_until: Option<DateTime<Utc>>,
}

impl TierExhaustion {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.exhausted_until.is_some_and(|until| until > now)
    }
}

/// Tier and model chosen for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierSelection {
    pub tier: ModelTier,
    pub model_id: String,
    /// Set when a complex task was demoted to the fast tier.
    pub fallback_reason: Option<String>,
}

/// Chooses between the capable and fast model of one provider.
#[derive(Debug)]
pub struct ModelTierSelector {
    capable_model: String,
    fast_model: String,
    reset: QuotaReset,
    /// Only the capable tier is ever demoted from.
    capable: Arc<Mutex<TierExhaustion>>,
}

impl ModelTierSelector {
    pub fn new(
        capable_model: impl Into<String>,
        fast_model: impl Into<String>,
        reset: QuotaReset,
    ) -> Self {
        Self {
            capable_model: capable_model.into(),
            fast_model: fast_model.into(),
            reset,
            capable: Arc::new(Mutex::new(TierExhaustion::default())),
        }
    }

    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Capable => &self.capable_model,
            ModelTier::Fast => &self.fast_model,
        }
    }

    /// Complex tasks get the capable tier unless it is exhausted; simple
    /// tasks always get the fast tier.
    pub async fn select_model(&self, category: TaskCategory) -> TierSelection {
        match category {
            TaskCategory::Simple => self.selection(ModelTier::Fast, None),
            TaskCategory::Complex => {
                let capable = self.capable.lock().await;
                if capable.is_active_at(Utc::now()) {
                    self.selection(ModelTier::Fast, Some(CAPABLE_TIER_EXHAUSTED))
                } else {
                    self.selection(ModelTier::Capable, None)
                }
            }
        }
    }

    /// Fast-tier selection carrying the demotion reason.
    pub fn demoted_selection(&self) -> TierSelection {
        self.selection(ModelTier::Fast, Some(CAPABLE_TIER_EXHAUSTED))
    }

    fn selection(&self, tier: ModelTier, fallback_reason: Option<&str>) -> TierSelection {
        TierSelection {
            tier,
            model_id: self.model_for(tier).to_string(),
            fallback_reason: fallback_reason.map(str::to_string),
        }
    }

    pub async fn capable_exhaustion(&self) -> TierExhaustion {
        *self.capable.lock().await
    }

    pub async fn is_capable_exhausted(&self) -> bool {
        self.capable_exhaustion().await.is_active_at(Utc::now())
    }

    #[cfg(test)]
    pub(crate) async fn set_capable_exhausted_until(&self, until: DateTime<Utc>) {
        self.capable.lock().await.exhausted_until = Some(until);
    }

    /// Demote the provider to its fast tier after the capable tier ran out of quota.
    ///
    /// The capable tier is marked exhausted until the next reset boundary. The
    /// fast tier is a separate quota pool, so its credential pool is reset
    /// before first use, but only by the request that performs the transition.
    /// Returns whether this call performed it.
    pub async fn degrade_to_fast(&self, fast_pool: &KeyRotationPool) -> bool {
        let now = Utc::now();
        let until = self.reset.next_boundary(now);

        // Held across the pool reset so a second demotion cannot interleave.
        let mut capable = self.capable.lock().await;
        if capable.is_active_at(now) {
            info!(
                "Capable tier ({}) already marked exhausted, using {}",
                self.capable_model, self.fast_model
            );
            return false;
        }

        capable.exhausted_until = Some(until);
        warn!(
            "Capable tier ({}) exhausted until {}, falling back to {}",
            self.capable_model, until, self.fast_model
        );
        fast_pool.reset_all().await;
        true
    }

}
