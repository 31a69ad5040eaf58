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

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible chat completions adapter.
///
/// Also serves services that mirror the same wire format (DeepSeek, Groq,
/// OpenRouter) through `base_url`. Reasoning is only confirmed when the
/// service returns a `reasoning_content` (or `reasoning`) field.
pub struct OpenAIProvider {
    settings: ProviderSettings,
    transport: HttpTransport,
    configured: bool,
}

impl OpenAIProvider {
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

impl LLMProvider for OpenAIProvider {
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
            let url = endpoint(
                self.settings.base_url.as_deref(),
                DEFAULT_BASE_URL,
                "chat/completions",
            )?;
            let authorization = format!("Bearer {api_key}");
            let headers = [("authorization", authorization.as_str())];
            let supported = self.settings.supports_web_search();

            let (response, rejection) = post_with_tool_fallback(
                self.provider_name(),
                &self.transport,
                url,
                &headers,
                spec.wants_web_search && supported,
                |with_search| build_body(spec, model, with_search),
            )
            .await?;

            let mut reply = parse_response(&response, spec, model)?;
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

pub(crate) fn build_body(spec: &RequestSpec, model: &str, with_search: bool) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &spec.system_message {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.push(json!({ "role": "user", "content": spec.prompt }));

    let mut body = json!({
        "model": model,
        "messages": messages,
    });

    if let Some(max_tokens) = spec.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = spec.temperature {
        body["temperature"] = json!(temperature);
    }
    if with_search {
        body["web_search_options"] = json!({});
    }

    body
}

pub(crate) fn parse_response(
    response: &Value,
    spec: &RequestSpec,
    model: &str,
) -> Result<ProviderReply, ProviderFailure> {
    let choice = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or_else(|| {
            ProviderFailure::InvalidResponse("response contained no choices".to_string())
        })?;

    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("stop");
    if finish_reason == "content_filter" {
        return Err(ProviderFailure::ContentBlocked(
            "finish reason content_filter".to_string(),
        ));
    }

    let message = choice.get("message").unwrap_or(&Value::Null);
    if let Some(refusal) = message.get("refusal").and_then(Value::as_str) {
        return Err(ProviderFailure::ContentBlocked(format!(
            "model refused: {refusal}"
        )));
    }

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if text.trim().is_empty() {
        return Err(if finish_reason == "length" {
            ProviderFailure::InvalidResponse(
                "finish reason length: max tokens reached with no text".to_string(),
            )
        } else {
            ProviderFailure::InvalidResponse(format!(
                "choice contained no text (finish reason {finish_reason})"
            ))
        });
    }

    let trace = message
        .get("reasoning_content")
        .or_else(|| message.get("reasoning"))
        .and_then(Value::as_str)
        .filter(|trace| !trace.trim().is_empty());

    let sources: Vec<String> = message
        .get("annotations")
        .and_then(Value::as_array)
        .map(|annotations| {
            annotations
                .iter()
                .filter(|a| a.get("type").and_then(Value::as_str) == Some("url_citation"))
                .filter_map(|a| a.pointer("/url_citation/url").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

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
        reasoning: FeatureOutcome::resolve(
            spec.wants_deep_reasoning,
            trace.is_some(),
            NO_REASONING_TRACE,
        ),
        web_search: FeatureOutcome::resolve(
            spec.wants_web_search,
            !sources.is_empty(),
            NO_SEARCH_GROUNDING,
        ),
        reasoning_trace: trace
            .filter(|_| spec.wants_deep_reasoning)
            .map(str::to_string),
        sources: if spec.wants_web_search { sources } else { Vec::new() },
        token_usage: TokenUsage::new(count("prompt_tokens"), count("completion_tokens")),
    })
}
