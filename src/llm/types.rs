use crate::resilience::ModelTier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Task category used to pick a model tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    /// Short, mechanical work such as translation. Always served by the fast tier.
    #[default]
    Simple,
    /// Deep analysis. Prefers the capable tier.
    Complex,
}

/// A single request to a language model.
///
/// Built by the caller and handed to the [`Processor`](crate::Processor) by
/// reference; nothing downstream mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    pub id: Uuid,
    pub prompt: String,
    pub system_message: Option<String>,
    pub category: TaskCategory,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f32>,
    pub wants_deep_reasoning: bool,
    pub wants_web_search: bool,
    /// Provider name to route to. `None` uses the processor default.
    pub provider: Option<String>,
}

impl RequestSpec {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Translation into `target_language`, served by the fast tier.
    pub fn translation(text: &str, target_language: &str) -> Self {
        Self::new(format!(
            "Translate the following text into {target_language}. \
             Reply with the translation only.\n\n{text}"
        ))
        .with_system_message("You are a precise translator.")
    }

    /// Free-form analysis of `text`, served by the capable tier when available.
    pub fn analysis(text: &str) -> Self {
        Self::new(format!("Analyze the following text in depth.\n\n{text}"))
            .with_category(TaskCategory::Complex)
    }

    /// Question answering, optionally grounded in a block of context.
    pub fn question(question: &str, context: Option<&str>) -> Self {
        let prompt = match context {
            Some(context) if !context.trim().is_empty() => {
                format!("Context:\n{context}\n\nQuestion: {question}")
            }
            _ => question.to_string(),
        };
        Self::new(prompt)
    }

    pub fn with_system_message(mut self, system_message: impl Into<String>) -> Self {
        self.system_message = Some(system_message.into());
        self
    }

    pub fn with_category(mut self, category: TaskCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_deep_reasoning(mut self, wanted: bool) -> Self {
        self.wants_deep_reasoning = wanted;
        self
    }

    pub fn with_web_search(mut self, wanted: bool) -> Self {
        self.wants_web_search = wanted;
        self
    }

    pub fn for_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

impl Default for RequestSpec {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: String::new(),
            system_message: None,
            category: TaskCategory::Simple,
            max_tokens: None,
            temperature: None,
            wants_deep_reasoning: false,
            wants_web_search: false,
            provider: None,
        }
    }
}

/// What happened to one optional feature (deep reasoning or web search).
///
/// `applied` can only be true when the feature was requested *and* the
/// provider confirmed it. The fields are private so that no caller can
/// assemble an outcome that claims more than was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct FeatureOutcome {
    requested: bool,
    applied: bool,
    reason: Option<String>,
}

impl FeatureOutcome {
    pub fn not_requested() -> Self {
        Self::default()
    }

    /// Requested and confirmed by the provider.
    pub fn applied() -> Self {
        Self {
            requested: true,
            applied: true,
            reason: None,
        }
    }

    /// Requested but not delivered.
    pub fn declined(reason: impl Into<String>) -> Self {
        Self {
            requested: true,
            applied: false,
            reason: Some(reason.into()),
        }
    }

    /// Build an outcome from the request flag and what the provider confirmed.
    pub fn resolve(requested: bool, confirmed: bool, reason_if_missing: &str) -> Self {
        match (requested, confirmed) {
            (false, _) => Self::not_requested(),
            (true, true) => Self::applied(),
            (true, false) => Self::declined(reason_if_missing),
        }
    }

    /// Drop any claim the request never asked for.
    pub fn constrained_to(self, requested: bool) -> Self {
        if requested {
            if self.requested {
                self
            } else {
                Self::declined("provider did not report on this feature")
            }
        } else {
            Self::not_requested()
        }
    }

    pub fn requested(&self) -> bool {
        self.requested
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// Successful result of a single provider call, before the processor adds
/// routing information.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderReply {
    pub text: String,
    pub model_used: String,
    pub reasoning: FeatureOutcome,
    pub web_search: FeatureOutcome,
    pub reasoning_trace: Option<String>,
    pub sources: Vec<String>,
    pub token_usage: TokenUsage,
}

impl ProviderReply {
    /// Plain answer with no optional features requested.
    pub fn text(text: impl Into<String>, model_used: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model_used: model_used.into(),
            reasoning: FeatureOutcome::not_requested(),
            web_search: FeatureOutcome::not_requested(),
            reasoning_trace: None,
            sources: Vec::new(),
            token_usage: TokenUsage::default(),
        }
    }
}

/// Whether the request was served by a lower tier than it asked for.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TierFallback {
    pub applied: bool,
    pub reason: Option<String>,
}

impl TierFallback {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn applied(reason: impl Into<String>) -> Self {
        Self {
            applied: true,
            reason: Some(reason.into()),
        }
    }
}

/// The authoritative record of what was requested and what was delivered.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    pub request_id: Uuid,
    pub text: String,
    pub provider: String,
    pub model_used: String,
    pub tier: ModelTier,
    pub reasoning: FeatureOutcome,
    pub web_search: FeatureOutcome,
    pub tier_fallback: TierFallback,
    pub reasoning_trace: Option<String>,
    pub sources: Vec<String>,
    pub token_usage: TokenUsage,
    /// Provider calls made for this request across every key and tier.
    pub attempts: u32,
    pub execution_time: Duration,
}

impl ResponseMetadata {
    pub fn reasoning_requested(&self) -> bool {
        self.reasoning.requested()
    }

    pub fn reasoning_applied(&self) -> bool {
        self.reasoning.is_applied()
    }

    pub fn web_search_requested(&self) -> bool {
        self.web_search.requested()
    }

    pub fn web_search_applied(&self) -> bool {
        self.web_search.is_applied()
    }

    pub fn tier_fallback_applied(&self) -> bool {
        self.tier_fallback.applied
    }

    /// Human-readable status line for end users.
    ///
    /// Returns `None` when nothing was requested and no fallback happened.
    pub fn status_footer(&self) -> Option<String> {
        let mut parts = Vec::new();

        if self.reasoning.requested() {
            parts.push(feature_status("deep reasoning", &self.reasoning));
        }
        if self.web_search.requested() {
            parts.push(feature_status("web search", &self.web_search));
        }
        if self.tier_fallback.applied {
            let reason = self.tier_fallback.reason.as_deref().unwrap_or("fallback");
            parts.push(format!("model: {} ({reason})", self.model_used));
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" | "))
        }
    }
}

fn feature_status(label: &str, outcome: &FeatureOutcome) -> String {
    if outcome.is_applied() {
        format!("{label}: on")
    } else {
        match outcome.reason() {
            Some(reason) => format!("{label}: off ({reason})"),
            None => format!("{label}: off"),
        }
    }
}

/// Raw failure from a provider call, before classification.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderFailure {
    #[error("HTTP {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Content blocked: {0}")]
    ContentBlocked(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderFailure {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
            retry_after: None,
        }
    }
}

/// Supported provider wire formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    #[serde(rename = "openai")]
    OpenAI,
    Anthropic,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Gemini => write!(f, "gemini"),
            ProviderKind::OpenAI => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
        }
    }
}

/// Per-provider configuration
///
/// Model ids and web-search support left unset fall back to the defaults
/// for the provider kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub name: String,
    pub kind: ProviderKind,
    pub enabled: bool,
    pub api_keys: Vec<String>,
    /// Separate credentials for the fast tier. Defaults to `api_keys`.
    pub fast_api_keys: Option<Vec<String>>,
    pub base_url: Option<String>,
    pub capable_model: Option<String>,
    pub fast_model: Option<String>,
    pub request_timeout_secs: u64,
    pub reasoning_budget_tokens: u32,
    pub supports_web_search: Option<bool>,
}

impl ProviderSettings {
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            api_keys: Vec::new(),
            fast_api_keys: None,
            base_url: None,
            capable_model: None,
            fast_model: None,
            request_timeout_secs: 120,
            reasoning_budget_tokens: 8192,
            supports_web_search: None,
        }
    }

    pub fn with_api_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.api_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn capable_model(&self) -> &str {
        self.capable_model
            .as_deref()
            .unwrap_or(match self.kind {
                ProviderKind::Gemini => "gemini-2.5-pro",
                ProviderKind::OpenAI => "gpt-4.1",
                ProviderKind::Anthropic => "claude-sonnet-4-5",
            })
    }

    pub fn fast_model(&self) -> &str {
        self.fast_model.as_deref().unwrap_or(match self.kind {
            ProviderKind::Gemini => "gemini-2.5-flash",
            ProviderKind::OpenAI => "gpt-4.1-mini",
            ProviderKind::Anthropic => "claude-haiku-4-5",
        })
    }

    pub fn supports_web_search(&self) -> bool {
        self.supports_web_search
            .unwrap_or(!matches!(self.kind, ProviderKind::OpenAI))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Credentials for the given tier, before validation.
    pub fn keys_for(&self, tier: ModelTier) -> &[String] {
        match (tier, &self.fast_api_keys) {
            (ModelTier::Fast, Some(fast)) if !fast.is_empty() => fast,
            _ => &self.api_keys,
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self::new("gemini", ProviderKind::Gemini)
    }
}
