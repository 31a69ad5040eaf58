use crate::llm::types::{
    FeatureOutcome, ProviderFailure, ProviderKind, ProviderReply, ProviderSettings, RequestSpec,
};
use crate::resilience::ProviderCredentialSet;
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const MAX_ERROR_BODY_CHARS: usize = 2048;

pub const NO_REASONING_TRACE: &str = "provider returned no reasoning trace";
pub const NO_SEARCH_GROUNDING: &str = "model answered without search grounding";
pub const SEARCH_UNSUPPORTED: &str = "web search is not supported by this provider";

/// Uniform contract for a remote language-model service.
///
/// Adapters own their transport and translate one [`RequestSpec`] into one
/// logical call. Key and model selection happen in the
/// [`Processor`](crate::Processor); adapters only report what the provider
/// confirmed.
pub trait LLMProvider: Send + Sync {
    /// Get provider name/identifier
    fn provider_name(&self) -> &str;

    /// Whether the provider is enabled and holds at least one valid credential.
    fn is_configured(&self) -> bool;

    /// Upper bound for a single call, including any adapter-local reissue.
    fn request_timeout(&self) -> Duration;

    /// Execute a prompt against `model` using `api_key`.
    fn execute_prompt<'a>(
        &'a self,
        spec: &'a RequestSpec,
        model: &'a str,
        api_key: &'a str,
    ) -> BoxFuture<'a, Result<ProviderReply, ProviderFailure>>;

    fn translate<'a>(
        &'a self,
        text: &'a str,
        target_language: &'a str,
        model: &'a str,
        api_key: &'a str,
    ) -> BoxFuture<'a, Result<ProviderReply, ProviderFailure>> {
        Box::pin(async move {
            let spec = RequestSpec::translation(text, target_language);
            self.execute_prompt(&spec, model, api_key).await
        })
    }

    fn analyze<'a>(
        &'a self,
        text: &'a str,
        model: &'a str,
        api_key: &'a str,
    ) -> BoxFuture<'a, Result<ProviderReply, ProviderFailure>> {
        Box::pin(async move {
            let spec = RequestSpec::analysis(text);
            self.execute_prompt(&spec, model, api_key).await
        })
    }

    fn answer_question<'a>(
        &'a self,
        question: &'a str,
        context: Option<&'a str>,
        model: &'a str,
        api_key: &'a str,
    ) -> BoxFuture<'a, Result<ProviderReply, ProviderFailure>> {
        Box::pin(async move {
            let spec = RequestSpec::question(question, context);
            self.execute_prompt(&spec, model, api_key).await
        })
    }
}

/// Factory for creating LLM providers
pub struct LLMProviderFactory;

impl LLMProviderFactory {
    pub fn create_provider(
        settings: &ProviderSettings,
    ) -> Result<Arc<dyn LLMProvider>, ProviderFailure> {
        match settings.kind {
            ProviderKind::Gemini => Ok(Arc::new(
                crate::llm::gemini_provider::GeminiProvider::new(settings.clone())?,
            )),
            ProviderKind::OpenAI => Ok(Arc::new(
                crate::llm::openai_provider::OpenAIProvider::new(settings.clone())?,
            )),
            ProviderKind::Anthropic => Ok(Arc::new(
                crate::llm::anthropic_provider::AnthropicProvider::new(settings.clone())?,
            )),
        }
    }
}

/// Whether settings describe a provider that may be called.
pub fn settings_configured(settings: &ProviderSettings) -> bool {
    settings.enabled && ProviderCredentialSet::from_keys(&settings.api_keys).is_some()
}

/// Resolve `path` against a configured base URL or the provider default.
pub(crate) fn endpoint(
    base_url: Option<&str>,
    default_base: &str,
    path: &str,
) -> Result<Url, ProviderFailure> {
    let base = base_url.unwrap_or(default_base);
    let base = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    };

    Url::parse(&base)
        .and_then(|url| url.join(path.trim_start_matches('/')))
        .map_err(|e| ProviderFailure::NotConfigured(format!("invalid base URL '{base}': {e}")))
}

/// True when a 400 response rejected the search/grounding tool rather than
/// the request itself.
pub(crate) fn is_tool_rejection(failure: &ProviderFailure) -> bool {
    match failure {
        ProviderFailure::Status {
            status: 400,
            message,
            ..
        } => {
            let message = message.to_lowercase();
            ["search", "grounding", "tool"]
                .iter()
                .any(|marker| message.contains(marker))
        }
        _ => false,
    }
}

/// Final web-search outcome for a reply.
///
/// `rejection` carries the provider's message when the search tool was
/// refused and the request was reissued without it.
pub(crate) fn search_outcome(
    requested: bool,
    supported: bool,
    rejection: Option<&str>,
    confirmed: bool,
) -> FeatureOutcome {
    match (requested, supported, rejection) {
        (false, _, _) => FeatureOutcome::not_requested(),
        (true, false, _) => FeatureOutcome::declined(SEARCH_UNSUPPORTED),
        (true, true, Some(reason)) => {
            FeatureOutcome::declined(format!("provider rejected the search tool: {reason}"))
        }
        (true, true, None) => FeatureOutcome::resolve(true, confirmed, NO_SEARCH_GROUNDING),
    }
}

/// POST a body built with or without the search tool.
///
/// A 400 that names the tool is answered by reissuing the request without
/// it, within the same attempt. Returns the response body together with the
/// rejection message when that happened.
pub(crate) async fn post_with_tool_fallback<F>(
    provider: &str,
    transport: &HttpTransport,
    url: Url,
    headers: &[(&str, &str)],
    with_tool: bool,
    build_body: F,
) -> Result<(Value, Option<String>), ProviderFailure>
where
    F: Fn(bool) -> Value,
{
    match transport.post_json(url.clone(), headers, &build_body(with_tool)).await {
        Ok(json) => Ok((json, None)),
        Err(failure) if with_tool && is_tool_rejection(&failure) => {
            let reason = match &failure {
                ProviderFailure::Status { message, .. } => message.clone(),
                other => other.to_string(),
            };
            warn!(
                "{} rejected the search tool, reissuing without it: {}",
                provider, reason
            );
            let json = transport.post_json(url, headers, &build_body(false)).await?;
            Ok((json, Some(reason)))
        }
        Err(failure) => Err(failure),
    }
}

/// JSON-over-HTTPS transport shared by the adapters.
#[derive(Debug, Clone)]
pub(crate) struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub(crate) fn new(timeout: Duration) -> Result<Self, ProviderFailure> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderFailure::Connection(format!("failed to build client: {e}")))?;

        Ok(Self { client, timeout })
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) async fn post_json(
        &self,
        url: Url,
        headers: &[(&str, &str)],
        body: &Value,
    ) -> Result<Value, ProviderFailure> {
        debug!("POST {}", url.path());

        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderFailure::Status {
                status: status.as_u16(),
                message: error_message(&body),
                retry_after,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| self.map_body_error(e))
    }

    fn map_send_error(&self, error: reqwest::Error) -> ProviderFailure {
        if error.is_timeout() {
            ProviderFailure::Timeout(self.timeout)
        } else {
            ProviderFailure::Connection(error.to_string())
        }
    }

    fn map_body_error(&self, error: reqwest::Error) -> ProviderFailure {
        if error.is_timeout() {
            ProviderFailure::Timeout(self.timeout)
        } else if error.is_decode() {
            ProviderFailure::InvalidResponse(error.to_string())
        } else {
            ProviderFailure::Connection(error.to_string())
        }
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let seconds: f64 = value.trim().parse().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

/// Extract `error.message` from a JSON error body, keeping the raw body
/// (truncated) when it is not JSON. Gemini's `details` are kept because the
/// quota window and retry delay live there.
pub(crate) fn error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|json| {
        let error = json.get("error")?;
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())?;
        let mut message = message.to_string();
        if let Some(kind) = error
            .get("type")
            .or_else(|| error.get("code"))
            .and_then(Value::as_str)
        {
            message.push_str(&format!(" ({kind})"));
        }
        if let Some(status) = error.get("status").and_then(Value::as_str) {
            message.push_str(&format!(" [{status}]"));
        }
        if let Some(details) = error.get("details") {
            message.push(' ');
            message.push_str(&details.to_string());
        }
        Some(message)
    });

    let message = message.unwrap_or_else(|| body.trim().to_string());
    truncate_chars(&message, MAX_ERROR_BODY_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((index, _)) => format!("{}…", &text[..index]),
        None => text.to_string(),
    }
}
