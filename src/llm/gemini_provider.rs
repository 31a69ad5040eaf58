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
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const BLOCKING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
    "IMAGE_SAFETY",
];

/// Google Gemini `generateContent` adapter.
pub struct GeminiProvider {
    settings: ProviderSettings,
    transport: HttpTransport,
    configured: bool,
}

impl GeminiProvider {
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

impl LLMProvider for GeminiProvider {
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
                &format!("models/{model}:generateContent"),
            )?;
            let headers = [("x-goog-api-key", api_key)];
            let supported = self.settings.supports_web_search();
            let budget = self.settings.reasoning_budget_tokens;

            let (response, rejection) = post_with_tool_fallback(
                self.provider_name(),
                &self.transport,
                url,
                &headers,
                spec.wants_web_search && supported,
                |with_search| build_body(spec, with_search, budget),
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

pub(crate) fn build_body(spec: &RequestSpec, with_search: bool, reasoning_budget: u32) -> Value {
    let mut body = json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": spec.prompt }],
        }],
    });

    if let Some(system) = &spec.system_message {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }

    let mut generation = serde_json::Map::new();
    if let Some(max_tokens) = spec.max_tokens {
        generation.insert("maxOutputTokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = spec.temperature {
        generation.insert("temperature".into(), json!(temperature));
    }
    if spec.wants_deep_reasoning {
        generation.insert(
            "thinkingConfig".into(),
            json!({ "includeThoughts": true, "thinkingBudget": reasoning_budget }),
        );
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }

    if with_search {
        body["tools"] = json!([{ "google_search": {} }]);
    }

    body
}

pub(crate) fn parse_response(
    response: &Value,
    spec: &RequestSpec,
    model: &str,
) -> Result<ProviderReply, ProviderFailure> {
    if let Some(reason) = response
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        return Err(ProviderFailure::ContentBlocked(format!(
            "prompt blocked: {reason}"
        )));
    }

    let candidate = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .ok_or_else(|| {
            ProviderFailure::InvalidResponse("response contained no candidates".to_string())
        })?;

    let finish_reason = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .unwrap_or("STOP");
    if BLOCKING_FINISH_REASONS.contains(&finish_reason) {
        return Err(ProviderFailure::ContentBlocked(format!(
            "finish reason {finish_reason}"
        )));
    }

    let mut text = String::new();
    let mut thoughts = String::new();
    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for part in parts {
        let Some(part_text) = part.get("text").and_then(Value::as_str) else {
            continue;
        };
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            thoughts.push_str(part_text);
        } else {
            text.push_str(part_text);
        }
    }

    if text.trim().is_empty() {
        return Err(if finish_reason == "MAX_TOKENS" {
            ProviderFailure::InvalidResponse("finish reason MAX_TOKENS with no text".to_string())
        } else {
            ProviderFailure::InvalidResponse(format!(
                "candidate contained no text (finish reason {finish_reason})"
            ))
        });
    }

    let grounding = candidate.get("groundingMetadata");
    let sources: Vec<String> = grounding
        .and_then(|g| g.get("groundingChunks"))
        .and_then(Value::as_array)
        .map(|chunks| {
            chunks
                .iter()
                .filter_map(|chunk| chunk.pointer("/web/uri").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let searched = !sources.is_empty()
        || grounding
            .and_then(|g| g.get("webSearchQueries"))
            .and_then(Value::as_array)
            .is_some_and(|queries| !queries.is_empty());

    let has_trace = !thoughts.trim().is_empty();
    if spec.wants_deep_reasoning && !has_trace {
        debug!("Gemini response for {} carried no thought parts", model);
    }

    let usage = response.get("usageMetadata");
    let count = |field: &str| {
        usage
            .and_then(|u| u.get(field))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };

    Ok(ProviderReply {
        text,
        model_used: response
            .get("modelVersion")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_string(),
        reasoning: FeatureOutcome::resolve(spec.wants_deep_reasoning, has_trace, NO_REASONING_TRACE),
        web_search: FeatureOutcome::resolve(spec.wants_web_search, searched, NO_SEARCH_GROUNDING),
        reasoning_trace: (spec.wants_deep_reasoning && has_trace).then_some(thoughts),
        sources: if spec.wants_web_search { sources } else { Vec::new() },
        token_usage: TokenUsage::new(
            count("promptTokenCount"),
            count("candidatesTokenCount") + count("thoughtsTokenCount"),
        ),
    })
}
