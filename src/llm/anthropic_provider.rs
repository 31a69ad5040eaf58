use crate::llm::provider::{
    HttpTransport, LLMProvider, NO_REASONING_TRACE, NO_SEARCH_GROUNDING, endpoint,
    post_with_tool_fallback, search_outcome, settings_configured,
};
use crate::llm::types::{
    FeatureOutcome, ProviderFailure, ProviderReply, ProviderSettings, RequestSpec, TokenUsage,
};
use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;
const MIN_THINKING_BUDGET: u64 = 1024;
const MAX_SEARCH_USES: u32 = 5;

pub const THINKING_BUDGET_TOO_SMALL: &str = "token budget too small for extended thinking";

/// Anthropic Messages API adapter.
pub struct AnthropicProvider {
    settings: ProviderSettings,
    transport: HttpTransport,
    configured: bool,
}

impl AnthropicProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self, ProviderFailure> {
        let transport = HttpTransport::new(settings.request_timeout())?;
        let configured = settings_configured(&settings);

        Ok(Self {
            settings,
            transport,
            configured,
        })
    }
}

impl LLMProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        &self.settings.name
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    fn request_timeout(&self) -> Duration {
        self.transport.timeout()
    }

    fn execute_prompt<'a>(
        &'a self,
        spec: &'a RequestSpec,
        model: &'a str,
        api_key: &'a str,
    ) -> BoxFuture<'a, Result<ProviderReply, ProviderFailure>> {
        Box::pin(async move {
            let url = endpoint(self.settings.base_url.as_deref(), DEFAULT_BASE_URL, "messages")?;
            let headers = [("x-api-key", api_key), ("anthropic-version", API_VERSION)];
            let supported = self.settings.supports_web_search();
            let plan = ThinkingPlan::for_request(spec, self.settings.reasoning_budget_tokens);

            let (response, rejection) = post_with_tool_fallback(
                self.provider_name(),
                &self.transport,
                url,
                &headers,
                spec.wants_web_search && supported,
                |with_search| build_body(spec, model, with_search, plan),
            )
            .await?;

            let mut reply = parse_response(&response, spec, model)?;
            if plan.skipped() {
                reply.reasoning = FeatureOutcome::declined(THINKING_BUDGET_TOO_SMALL);
                reply.reasoning_trace = None;
            }
            reply.web_search = search_outcome(
                spec.wants_web_search,
                supported,
                rejection.as_deref(),
                reply.web_search.is_applied(),
            );
            Ok(reply)
        })
    }
}

/// Output token budget and extended-thinking budget for one request.
///
/// The thinking budget must be at least 1024 tokens and strictly below
/// `max_tokens`. When the caller's bound leaves no room, thinking is not
/// sent and the reasoning request is declined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ThinkingPlan {
    max_tokens: u64,
    thinking_budget: Option<u64>,
    requested: bool,
}

impl ThinkingPlan {
    pub(crate) fn for_request(spec: &RequestSpec, reasoning_budget: u32) -> Self {
        let requested = spec.wants_deep_reasoning;

        match spec.max_tokens {
            Some(max_tokens) => {
                let budget = u64::from(reasoning_budget).min(max_tokens.saturating_sub(1));
                Self {
                    max_tokens,
                    thinking_budget: (requested && budget >= MIN_THINKING_BUDGET)
                        .then_some(budget),
                    requested,
                }
            }
            None => {
                let budget = u64::from(reasoning_budget).max(MIN_THINKING_BUDGET);
                Self {
                    max_tokens: if requested {
                        budget + DEFAULT_MAX_TOKENS
                    } else {
                        DEFAULT_MAX_TOKENS
                    },
                    thinking_budget: requested.then_some(budget),
                    requested,
                }
            }
        }
    }

    fn skipped(&self) -> bool {
        self.requested && self.thinking_budget.is_none()
    }
}

pub(crate) fn build_body(
    spec: &RequestSpec,
    model: &str,
    with_search: bool,
    plan: ThinkingPlan,
) -> Value {
    let mut body = json!({
        "model": model,
        "max_tokens": plan.max_tokens,
        "messages": [{ "role": "user", "content": spec.prompt }],
    });

    if let Some(system) = &spec.system_message {
        body["system"] = json!(system);
    }

    match plan.thinking_budget {
        Some(budget) => {
            // Temperature is fixed while extended thinking is on.
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        }
        None => {
            if let Some(temperature) = spec.temperature {
                body["temperature"] = json!(temperature);
            }
        }
    }

    if with_search {
        body["tools"] = json!([{
            "type": "web_search_20250305",
            "name": "web_search",
            "max_uses": MAX_SEARCH_USES,
        }]);
    }

    body
}

pub(crate) fn parse_response(
    response: &Value,
    spec: &RequestSpec,
    model: &str,
) -> Result<ProviderReply, ProviderFailure> {
    let stop_reason = response
        .get("stop_reason")
        .and_then(Value::as_str)
        .unwrap_or("end_turn");
    if stop_reason == "refusal" {
        return Err(ProviderFailure::ContentBlocked(
            "stop reason refusal".to_string(),
        ));
    }

    let blocks = response
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderFailure::InvalidResponse("response had no content".to_string()))?;

    let mut text = String::new();
    let mut thinking = String::new();
    let mut searched = false;
    let mut sources: Vec<String> = Vec::new();
    let mut push_source = |url: &str| {
        if !sources.iter().any(|s| s == url) {
            sources.push(url.to_string());
        }
    };

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
                for citation in block
                    .get("citations")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default()
                {
                    if let Some(url) = citation.get("url").and_then(Value::as_str) {
                        push_source(url);
                    }
                }
            }
            Some("thinking") => {
                if let Some(t) = block.get("thinking").and_then(Value::as_str) {
                    thinking.push_str(t);
                }
            }
            Some("web_search_tool_result") => {
                // An error payload is an object, results are an array.
                if let Some(results) = block.get("content").and_then(Value::as_array) {
                    searched = true;
                    for result in results {
                        if let Some(url) = result.get("url").and_then(Value::as_str) {
                            push_source(url);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if text.trim().is_empty() {
        return Err(if stop_reason == "max_tokens" {
            ProviderFailure::InvalidResponse("stop reason max_tokens with no text".to_string())
        } else {
            ProviderFailure::InvalidResponse(format!(
                "response contained no text (stop reason {stop_reason})"
            ))
        });
    }

    let has_trace = !thinking.trim().is_empty();
    let usage = response.get("usage");
    let count = |field: &str| {
        usage
            .and_then(|u| u.get(field))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };

    Ok(ProviderReply {
        text,
        model_used: response
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_string(),
        reasoning: FeatureOutcome::resolve(spec.wants_deep_reasoning, has_trace, NO_REASONING_TRACE),
        web_search: FeatureOutcome::resolve(spec.wants_web_search, searched, NO_SEARCH_GROUNDING),
        reasoning_trace: (spec.wants_deep_reasoning && has_trace).then_some(thinking),
        sources: if spec.wants_web_search { sources } else { Vec::new() },
        token_usage: TokenUsage::new(count("input_tokens"), count("output_tokens")),
    })
}
