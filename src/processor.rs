//! Execution engine.
//!
//! For each request the [`Processor`] picks a provider, a model tier and a
//! credential, then drives the retry engine. Failures move the request
//! through the following states:
//!
//! ```text
//! SELECT_TIER -> SELECT_KEY -> CALL -> DONE
//!                                 \-> CLASSIFY -> RETRY        -> CALL
//!                                              -> DEGRADE_KEY  -> SELECT_KEY
//!                                              -> DEGRADE_TIER -> SELECT_TIER
//!                                              -> FAIL
//! ```
//!
//! Retryable outcomes stay inside the retry engine. `QuotaExhausted` marks
//! the key and rotates; an empty capable-tier pool demotes the request to the
//! fast tier once. Everything else is returned to the caller unchanged.

use crate::config::RelayConfig;
use crate::llm::{
    LLMProvider, LLMProviderFactory, ProviderFailure, ProviderReply, ProviderSettings,
    RequestSpec, ResponseMetadata, TierFallback,
};
use crate::resilience::{
    ClassifiedFailure, ErrorClassifier, KeyRotationPool, ModelTier, ModelTierSelector, Outcome,
    PoolStatus, ProviderCredentialSet, QuotaReset, RetryEngine, RetryError, RetryPolicy, Sleeper,
    TierSelection, mask_key,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Caller-facing failure of [`Processor::execute`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("{provider} ({tier}) rejected the token budget after {attempts} attempt(s): {failure}")]
    TokenLimitExceeded {
        provider: String,
        tier: ModelTier,
        attempts: u32,
        failure: ClassifiedFailure,
    },
    #[error("{provider} ({tier}) blocked the content after {attempts} attempt(s): {failure}")]
    SafetyBlocked {
        provider: String,
        tier: ModelTier,
        attempts: u32,
        failure: ClassifiedFailure,
    },
    #[error("{provider} ({tier}) failed after {attempts} attempt(s): {failure}")]
    Fatal {
        provider: String,
        tier: ModelTier,
        attempts: u32,
        failure: ClassifiedFailure,
    },
    /// Every key, tier and retry was used up.
    #[error(
        "{provider} ({tier}) exhausted all keys, tiers and retries after {attempts} attempt(s), last outcome: {last_outcome}"
    )]
    Exhausted {
        provider: String,
        tier: ModelTier,
        attempts: u32,
        last_outcome: Outcome,
        last_failure: Option<ClassifiedFailure>,
    },
    #[error("provider '{provider}' is unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },
}

impl ExecutionError {
    fn terminal(provider: &str, tier: ModelTier, attempts: u32, failure: ClassifiedFailure) -> Self {
        let provider = provider.to_string();
        match failure.outcome {
            Outcome::TokenLimitExceeded => Self::TokenLimitExceeded {
                provider,
                tier,
                attempts,
                failure,
            },
            Outcome::SafetyBlocked => Self::SafetyBlocked {
                provider,
                tier,
                attempts,
                failure,
            },
            _ => Self::Fatal {
                provider,
                tier,
                attempts,
                failure,
            },
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            Self::TokenLimitExceeded { provider, .. }
            | Self::SafetyBlocked { provider, .. }
            | Self::Fatal { provider, .. }
            | Self::Exhausted { provider, .. }
            | Self::ProviderUnavailable { provider, .. } => provider,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::TokenLimitExceeded { attempts, .. }
            | Self::SafetyBlocked { attempts, .. }
            | Self::Fatal { attempts, .. }
            | Self::Exhausted { attempts, .. } => *attempts,
            Self::ProviderUnavailable { .. } => 0,
        }
    }

    /// Last classified outcome, if any call was made.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Self::TokenLimitExceeded { failure, .. }
            | Self::SafetyBlocked { failure, .. }
            | Self::Fatal { failure, .. } => Some(failure.outcome),
            Self::Exhausted { last_outcome, .. } => Some(*last_outcome),
            Self::ProviderUnavailable { .. } => None,
        }
    }
}

/// Per-provider counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Calls beyond the first within one retry loop.
    pub retries: u64,
    pub key_degradations: u64,
    pub tier_degradations: u64,
    pub total_tokens: u64,
}

/// Point-in-time health of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub configured: bool,
    pub is_default: bool,
    pub capable_model: String,
    pub fast_model: String,
    pub capable_pool: Option<PoolStatus>,
    pub fast_pool: Option<PoolStatus>,
    pub capable_exhausted_until: Option<DateTime<Utc>>,
}

struct TierPools {
    capable: KeyRotationPool,
    fast: KeyRotationPool,
}

impl TierPools {
    fn get(&self, tier: ModelTier) -> &KeyRotationPool {
        match tier {
            ModelTier::Capable => &self.capable,
            ModelTier::Fast => &self.fast,
        }
    }
}

/// Process-lifetime state for one provider.
struct ProviderSlot {
    provider: Arc<dyn LLMProvider>,
    selector: ModelTierSelector,
    pools: Option<TierPools>,
}

impl ProviderSlot {
    fn new(provider: Arc<dyn LLMProvider>, settings: &ProviderSettings, reset: QuotaReset) -> Self {
        let selector = ModelTierSelector::new(settings.capable_model(), settings.fast_model(), reset);

        let capable = ProviderCredentialSet::from_keys(settings.keys_for(ModelTier::Capable));
        let fast = ProviderCredentialSet::from_keys(settings.keys_for(ModelTier::Fast));
        let pools = match (capable, fast) {
            (Some(capable), Some(fast)) => Some(TierPools {
                capable: KeyRotationPool::new(
                    format!("{}/{}", settings.name, ModelTier::Capable),
                    capable,
                    reset,
                ),
                fast: KeyRotationPool::new(
                    format!("{}/{}", settings.name, ModelTier::Fast),
                    fast,
                    reset,
                ),
            }),
            _ => None,
        };

        Self {
            provider,
            selector,
            pools,
        }
    }

    fn is_configured(&self) -> bool {
        self.pools.is_some() && self.provider.is_configured()
    }
}

/// Execution engine façade.
///
/// Providers are registered up front; afterwards the processor is used by
/// shared reference from any number of concurrent tasks.
pub struct Processor {
    slots: HashMap<String, ProviderSlot>,
    default_provider: Option<String>,
    policy: RetryPolicy,
    quota_reset: QuotaReset,
    retry: RetryEngine,
    stats: DashMap<String, ProviderStats>,
}

impl Processor {
    pub fn new(policy: RetryPolicy, quota_reset: QuotaReset) -> Self {
        Self {
            slots: HashMap::new(),
            default_provider: None,
            policy,
            quota_reset,
            retry: RetryEngine::new(),
            stats: DashMap::new(),
        }
    }

    /// Build a processor with every enabled provider in `config`.
    pub fn from_config(config: &RelayConfig) -> Result<Self, ProviderFailure> {
        let mut processor = Self::new(config.retry.clone(), config.quota_reset);
        for settings in config.providers.iter().filter(|s| s.enabled) {
            let provider = LLMProviderFactory::create_provider(settings)?;
            processor.register(provider, settings);
        }
        processor.set_default_provider(&config.default_provider);
        Ok(processor)
    }

    /// Replace how the retry engine waits between attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.retry = RetryEngine::with_sleeper(sleeper);
        self
    }

    /// Register a provider under `settings.name`. The first registration
    /// becomes the default provider unless one is set explicitly.
    pub fn register(&mut self, provider: Arc<dyn LLMProvider>, settings: &ProviderSettings) {
        let slot = ProviderSlot::new(provider, settings, self.quota_reset);
        if !slot.is_configured() {
            warn!(
                "Provider {} has no usable credentials, requests to it will be refused",
                settings.name
            );
        }
        debug!(
            "Registered provider {} (capable: {}, fast: {})",
            settings.name,
            settings.capable_model(),
            settings.fast_model()
        );

        if self.default_provider.is_none() {
            self.default_provider = Some(settings.name.clone());
        }
        self.slots.insert(settings.name.clone(), slot);
    }

    pub fn set_default_provider(&mut self, name: &str) {
        self.default_provider = Some(name.to_string());
    }

    pub fn default_provider(&self) -> Option<&str> {
        self.default_provider.as_deref()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_configured(&self, provider: &str) -> bool {
        self.slots.get(provider).is_some_and(ProviderSlot::is_configured)
    }

    /// Execute one request against its provider.
    pub async fn execute(&self, spec: &RequestSpec) -> Result<ResponseMetadata, ExecutionError> {
        let started = Instant::now();
        let name = spec
            .provider
            .as_deref()
            .or(self.default_provider.as_deref())
            .ok_or_else(|| ExecutionError::ProviderUnavailable {
                provider: String::new(),
                reason: "no provider named and no default configured".to_string(),
            })?;

        let slot = self
            .slots
            .get(name)
            .ok_or_else(|| ExecutionError::ProviderUnavailable {
                provider: name.to_string(),
                reason: "provider is not registered".to_string(),
            })?;
        let pools = match &slot.pools {
            Some(pools) if slot.provider.is_configured() => pools,
            _ => {
                return Err(ExecutionError::ProviderUnavailable {
                    provider: name.to_string(),
                    reason: "provider is disabled or has no valid credentials".to_string(),
                });
            }
        };

        self.record(name, |s| s.requests += 1);
        let result = self.run(name, slot, pools, spec, started).await;

        match &result {
            Ok(response) => {
                let tokens = response.token_usage.total_tokens;
                self.record(name, |s| {
                    s.successes += 1;
                    s.total_tokens += tokens;
                });
            }
            Err(e) => {
                self.record(name, |s| s.failures += 1);
                error!("Request {} failed: {}", spec.id, e);
            }
        }
        result
    }

    async fn run(
        &self,
        name: &str,
        slot: &ProviderSlot,
        pools: &TierPools,
        spec: &RequestSpec,
        started: Instant,
    ) -> Result<ResponseMetadata, ExecutionError> {
        let mut attempts = 0u32;
        let mut last_failure: Option<ClassifiedFailure> = None;

        // SELECT_TIER
        let mut selection = slot.selector.select_model(spec.category).await;
        let mut demoted = selection.fallback_reason.is_some();
        if let Some(reason) = &selection.fallback_reason {
            info!(
                "Request {} on {} uses {} ({})",
                spec.id, name, selection.model_id, reason
            );
        } else {
            debug!(
                "Request {} on {} uses {} tier model {}",
                spec.id, name, selection.tier, selection.model_id
            );
        }

        loop {
            let pool = pools.get(selection.tier);

            // SELECT_KEY
            while let Some(key) = pool.current_key().await {
                let result = self
                    .retry
                    .execute_with_retry(&self.policy, || {
                        self.call(slot, spec, &selection.model_id, &key)
                    })
                    .await;

                match result {
                    Ok(retried) => {
                        attempts += retried.attempts;
                        self.record_retries(name, retried.attempts);
                        return Ok(self.finish(
                            name,
                            spec,
                            &selection,
                            retried.value,
                            attempts,
                            started,
                        ));
                    }
                    Err(retry_error) => {
                        attempts += retry_error.attempts();
                        self.record_retries(name, retry_error.attempts());

                        match retry_error {
                            RetryError::NonRetryable { failure, .. }
                                if failure.outcome == Outcome::QuotaExhausted =>
                            {
                                // DEGRADE_KEY
                                pool.mark_exhausted(&key, pool.next_reset()).await;
                                self.record(name, |s| s.key_degradations += 1);
                                warn!(
                                    "Key {} on {} out of quota, rotating",
                                    mask_key(&key),
                                    pool.label()
                                );
                                last_failure = Some(failure);
                            }
                            RetryError::NonRetryable { failure, .. } => {
                                return Err(ExecutionError::terminal(
                                    name,
                                    selection.tier,
                                    attempts,
                                    failure,
                                ));
                            }
                            RetryError::Exhausted { last, .. } => {
                                return Err(ExecutionError::Exhausted {
                                    provider: name.to_string(),
                                    tier: selection.tier,
                                    attempts,
                                    last_outcome: last.outcome,
                                    last_failure: Some(last),
                                });
                            }
                        }
                    }
                }
            }

            if selection.tier == ModelTier::Capable && !demoted {
                // DEGRADE_TIER
                demoted = true;
                if slot.selector.degrade_to_fast(&pools.fast).await {
                    self.record(name, |s| s.tier_degradations += 1);
                }
                selection = slot.selector.demoted_selection();
                info!(
                    "Request {} on {} demoted to {}",
                    spec.id, name, selection.model_id
                );
                continue;
            }

            warn!(
                "Request {} on {}: every {} tier key is exhausted",
                spec.id, name, selection.tier
            );
            return Err(ExecutionError::Exhausted {
                provider: name.to_string(),
                tier: selection.tier,
                attempts,
                last_outcome: last_failure
                    .as_ref()
                    .map_or(Outcome::QuotaExhausted, |f| f.outcome),
                last_failure,
            });
        }
    }

    /// One bounded provider call, classified on failure.
    async fn call(
        &self,
        slot: &ProviderSlot,
        spec: &RequestSpec,
        model: &str,
        key: &str,
    ) -> Result<ProviderReply, ClassifiedFailure> {
        let timeout = slot.provider.request_timeout();
        let outcome =
            match tokio::time::timeout(timeout, slot.provider.execute_prompt(spec, model, key))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderFailure::Timeout(timeout)),
            };

        outcome.map_err(|failure| {
            let classified = ErrorClassifier::classify(&failure);
            debug!(
                "{} call with key {} classified as {}: {}",
                model,
                mask_key(key),
                classified.outcome,
                failure
            );
            classified
        })
    }

    fn finish(
        &self,
        name: &str,
        spec: &RequestSpec,
        selection: &TierSelection,
        reply: ProviderReply,
        attempts: u32,
        started: Instant,
    ) -> ResponseMetadata {
        let reasoning = reply.reasoning.constrained_to(spec.wants_deep_reasoning);
        let web_search = reply.web_search.constrained_to(spec.wants_web_search);

        if let Some(reason) = reasoning.reason() {
            info!("Request {}: deep reasoning not applied ({})", spec.id, reason);
        }
        if let Some(reason) = web_search.reason() {
            info!("Request {}: web search not applied ({})", spec.id, reason);
        }

        let tier_fallback = match &selection.fallback_reason {
            Some(reason) => TierFallback::applied(reason.clone()),
            None => TierFallback::none(),
        };
        let reasoning_trace = reply.reasoning_trace.filter(|_| reasoning.is_applied());
        let sources = if web_search.is_applied() {
            reply.sources
        } else {
            Vec::new()
        };

        ResponseMetadata {
            request_id: spec.id,
            text: reply.text,
            provider: name.to_string(),
            model_used: reply.model_used,
            tier: selection.tier,
            reasoning,
            web_search,
            tier_fallback,
            reasoning_trace,
            sources,
            token_usage: reply.token_usage,
            attempts,
            execution_time: started.elapsed(),
        }
    }

    fn record<F>(&self, provider: &str, update: F)
    where
        F: FnOnce(&mut ProviderStats),
    {
        let mut entry = self.stats.entry(provider.to_string()).or_default();
        update(entry.value_mut());
    }

    fn record_retries(&self, provider: &str, attempts: u32) {
        let retries = u64::from(attempts.saturating_sub(1));
        if retries > 0 {
            self.record(provider, |s| s.retries += retries);
        }
    }

    pub async fn translate(
        &self,
        text: &str,
        target_language: &str,
    ) -> Result<ResponseMetadata, ExecutionError> {
        self.execute(&RequestSpec::translation(text, target_language))
            .await
    }

    pub async fn analyze(&self, text: &str) -> Result<ResponseMetadata, ExecutionError> {
        self.execute(&RequestSpec::analysis(text)).await
    }

    pub async fn answer_question(
        &self,
        question: &str,
        context: Option<&str>,
    ) -> Result<ResponseMetadata, ExecutionError> {
        self.execute(&RequestSpec::question(question, context)).await
    }

    /// Snapshot of the per-provider counters.
    pub fn stats(&self) -> BTreeMap<String, ProviderStats> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn provider_stats(&self, provider: &str) -> ProviderStats {
        self.stats
            .get(provider)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Configured state, usable keys per tier and capable-tier exhaustion of
    /// every registered provider, sorted by name.
    pub async fn provider_status(&self) -> Vec<ProviderHealth> {
        let mut report = Vec::with_capacity(self.slots.len());

        for name in self.provider_names() {
            let Some(slot) = self.slots.get(&name) else {
                continue;
            };
            let (capable_pool, fast_pool) = match &slot.pools {
                Some(pools) => (Some(pools.capable.status().await), Some(pools.fast.status().await)),
                None => (None, None),
            };
            let exhaustion = slot.selector.capable_exhaustion().await;
            let capable_exhausted_until = exhaustion
                .exhausted_until
                .filter(|_| exhaustion.is_active_at(Utc::now()));

            report.push(ProviderHealth {
                configured: slot.is_configured(),
                is_default: self.default_provider.as_deref() == Some(name.as_str()),
                capable_model: slot.selector.model_for(ModelTier::Capable).to_string(),
                fast_model: slot.selector.model_for(ModelTier::Fast).to_string(),
                capable_pool,
                fast_pool,
                capable_exhausted_until,
                name,
            });
        }

        report
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("providers", &self.provider_names())
            .field("default_provider", &self.default_provider)
            .field("policy", &self.policy)
            .field("quota_reset", &self.quota_reset)
            .finish_non_exhaustive()
    }
}
