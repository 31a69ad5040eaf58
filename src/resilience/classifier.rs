//! Classification of provider failures into retry-relevant outcomes.
//!
//! Rules are checked in priority order:
//!
//! 1. rate limiting or quota (`RateLimited` / `QuotaExhausted`)
//! 2. rejected token budget (`TokenLimitExceeded`)
//! 3. content or safety filtering (`SafetyBlocked`)
//! 4. connection errors, timeouts and 5xx (`Transient`)
//! 5. everything else (`Fatal`)
//!
//! The classifier is pure: it only inspects the failure it is given.

use crate::llm::ProviderFailure;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

static GEMINI_RETRY_DELAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)"retryDelay"\s*:\s*"(\d+(?:\.\d+)?)s""#).expect("static regex is valid")
});

static TEXT_RETRY_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:retry|try again)\s+(?:in|after)\s+(\d+(?:\.\d+)?)\s*(?:s\b|sec|second)")
        .expect("static regex is valid")
});

const RATE_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "resource_exhausted",
    "resource exhausted",
    "too many requests",
    "quota",
];

const PER_MINUTE_MARKERS: &[&str] = &[
    "perminute",
    "per minute",
    "per_minute",
    "requests per min",
    "tokens per min",
];

const DAILY_MARKERS: &[&str] = &[
    "perday",
    "per day",
    "per_day",
    "daily",
    "insufficient_quota",
    "billing",
    "credit balance",
];

const TOKEN_LIMIT_MARKERS: &[&str] = &[
    "maximum context length",
    "context_length_exceeded",
    "context length",
    "too many tokens",
    "token limit",
    "max_tokens with no text",
    "max tokens reached",
    "exceeds max_tokens",
    "maximum number of tokens",
    "maximum allowed number of",
    "input is too long",
    "prompt is too long",
];

const SAFETY_MARKERS: &[&str] = &[
    "safety",
    "content_filter",
    "content filter",
    "content policy",
    "prohibited_content",
    "blocklist",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "deadline exceeded",
    "connection reset",
    "connection refused",
    "unavailable",
    "overloaded",
];

/// Typed result of classifying a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// Short-window rate limit. Retried, honouring any wait hint.
    RateLimited,
    /// Long-window quota spent on the current credential. Triggers key or tier degradation.
    QuotaExhausted,
    /// Network trouble or a 5xx. Retried with backoff.
    Transient,
    /// The requested token budget was rejected. Never retried.
    TokenLimitExceeded,
    /// Provider policy refused the content. Never retried.
    SafetyBlocked,
    /// Unknown or unexpected failure. Never retried.
    Fatal,
}

impl Outcome {
    /// Whether the retry engine may call the operation again.
    pub fn is_retryable(self) -> bool {
        matches!(self, Outcome::RateLimited | Outcome::Transient)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::RateLimited => "rate limited",
            Outcome::QuotaExhausted => "quota exhausted",
            Outcome::Transient => "transient failure",
            Outcome::TokenLimitExceeded => "token limit exceeded",
            Outcome::SafetyBlocked => "safety blocked",
            Outcome::Fatal => "fatal error",
        };
        f.write_str(name)
    }
}

/// A provider failure together with its classification.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{outcome}: {failure}")]
pub struct ClassifiedFailure {
    pub outcome: Outcome,
    pub retry_after: Option<Duration>,
    pub failure: ProviderFailure,
}

impl ClassifiedFailure {
    pub fn new(outcome: Outcome, failure: ProviderFailure) -> Self {
        Self {
            outcome,
            retry_after: None,
            failure,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(failure: &ProviderFailure) -> ClassifiedFailure {
        let outcome = Self::outcome_for(failure);
        let retry_after = match failure {
            ProviderFailure::Status {
                retry_after: Some(hint),
                ..
            } => Some(*hint),
            ProviderFailure::Status { message, .. } => Self::extract_retry_hint(message),
            _ => None,
        };

        ClassifiedFailure {
            outcome,
            retry_after,
            failure: failure.clone(),
        }
    }

    fn outcome_for(failure: &ProviderFailure) -> Outcome {
        let (status, message) = match failure {
            ProviderFailure::Status {
                status, message, ..
            } => (Some(*status), message.to_lowercase()),
            ProviderFailure::ContentBlocked(message) => (None, message.to_lowercase()),
            ProviderFailure::InvalidResponse(message) => (None, message.to_lowercase()),
            ProviderFailure::Connection(message) => (None, message.to_lowercase()),
            ProviderFailure::Timeout(_) => return Outcome::Transient,
            ProviderFailure::NotConfigured(_) => return Outcome::Fatal,
        };

        if status == Some(429) || contains_any(&message, RATE_MARKERS) {
            return Self::rate_or_quota(failure, &message);
        }

        if contains_any(&message, TOKEN_LIMIT_MARKERS) {
            return Outcome::TokenLimitExceeded;
        }

        // Auth rejections mention blocked keys, not blocked content.
        let auth_rejection = matches!(status, Some(401 | 403));
        if matches!(failure, ProviderFailure::ContentBlocked(_))
            || (!auth_rejection && contains_any(&message, SAFETY_MARKERS))
        {
            return Outcome::SafetyBlocked;
        }

        if matches!(failure, ProviderFailure::Connection(_)) {
            return Outcome::Transient;
        }

        match status {
            Some(408) => Outcome::Transient,
            Some(code) if code >= 500 => Outcome::Transient,
            _ if contains_any(&message, TRANSIENT_MARKERS) => Outcome::Transient,
            _ => Outcome::Fatal,
        }
    }

    fn rate_or_quota(failure: &ProviderFailure, message: &str) -> Outcome {
        if contains_any(message, PER_MINUTE_MARKERS) {
            return Outcome::RateLimited;
        }
        if contains_any(message, DAILY_MARKERS) {
            return Outcome::QuotaExhausted;
        }

        let has_hint = matches!(
            failure,
            ProviderFailure::Status {
                retry_after: Some(_),
                ..
            }
        ) || Self::extract_retry_hint(message).is_some();

        if has_hint {
            Outcome::RateLimited
        } else if message.contains("quota") {
            Outcome::QuotaExhausted
        } else {
            Outcome::RateLimited
        }
    }

    /// Pull a wait hint out of an error body.
    ///
    /// Understands Gemini's `"retryDelay": "37s"` and free text such as
    /// `Please try again in 12.5s`.
    pub fn extract_retry_hint(message: &str) -> Option<Duration> {
        let captures = GEMINI_RETRY_DELAY
            .captures(message)
            .or_else(|| TEXT_RETRY_HINT.captures(message))?;
        let seconds: f64 = captures.get(1)?.as_str().parse().ok()?;
        if seconds.is_finite() && seconds >= 0.0 {
            Some(Duration::from_secs_f64(seconds))
        } else {
            None
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}
