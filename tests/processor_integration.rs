use futures::future::BoxFuture;
use llm_relay::llm::{FeatureOutcome, ProviderFailure, ProviderReply};
use llm_relay::resilience::{CAPABLE_TIER_EXHAUSTED, Sleeper};
use llm_relay::{
    ExecutionError, LLMProvider, ModelTier, Outcome, Processor, ProviderKind, ProviderSettings,
    QuotaReset, RequestSpec, RetryPolicy, TaskCategory,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const K1: &str = "AIzaSyScriptKey0001abcdefghijklm";
const K2: &str = "AIzaSyScriptKey0002abcdefghijklm";
const K3: &str = "AIzaSyScriptKey0003abcdefghijklm";
const K4: &str = "AIzaSyScriptKey0004abcdefghijklm";

const CAPABLE: &str = "capable-model";
const FAST: &str = "fast-model";

type Script =
    Box<dyn Fn(&RequestSpec, &str, &str, usize) -> Result<ProviderReply, ProviderFailure> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Call {
    model: String,
    key: String,
}

/// In-memory provider whose replies come from a closure.
struct ScriptedProvider {
    calls: Mutex<Vec<Call>>,
    script: Script,
    delay: Option<Duration>,
    timeout: Duration,
}

impl ScriptedProvider {
    fn new<F>(script: F) -> Arc<Self>
    where
        F: Fn(&RequestSpec, &str, &str, usize) -> Result<ProviderReply, ProviderFailure>
            + Send
            + Sync
            + 'static,
    {
        Self::build(script, None, Duration::from_secs(30))
    }

    fn slow(delay: Duration, timeout: Duration) -> Arc<Self> {
        Self::build(
            |_, model, _, _| Ok(ProviderReply::text("late", model)),
            Some(delay),
            timeout,
        )
    }

    fn build<F>(script: F, delay: Option<Duration>, timeout: Duration) -> Arc<Self>
    where
        F: Fn(&RequestSpec, &str, &str, usize) -> Result<ProviderReply, ProviderFailure>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            script: Box::new(script),
            delay,
            timeout,
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl LLMProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn request_timeout(&self) -> Duration {
        self.timeout
    }

    fn execute_prompt<'a>(
        &'a self,
        spec: &'a RequestSpec,
        model: &'a str,
        api_key: &'a str,
    ) -> BoxFuture<'a, Result<ProviderReply, ProviderFailure>> {
        Box::pin(async move {
            let call_number = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(Call {
                    model: model.to_string(),
                    key: api_key.to_string(),
                });
                calls.len()
            };
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.script)(spec, model, api_key, call_number)
        })
    }
}

#[derive(Default)]
struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        self.delays.lock().unwrap().push(duration);
        Box::pin(async {})
    }
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1_000,
        max_delay_ms: 30_000,
        exponential: true,
        jitter: false,
    }
}

fn settings(keys: &[&str]) -> ProviderSettings {
    ProviderSettings {
        capable_model: Some(CAPABLE.to_string()),
        fast_model: Some(FAST.to_string()),
        ..ProviderSettings::new("scripted", ProviderKind::Gemini).with_api_keys(keys.iter().copied())
    }
}

fn build_processor(provider: Arc<ScriptedProvider>, keys: &[&str]) -> (Processor, Arc<RecordingSleeper>) {
    let sleeper = Arc::new(RecordingSleeper::default());
    let mut processor =
        Processor::new(policy(), QuotaReset::default()).with_sleeper(sleeper.clone());
    processor.register(provider, &settings(keys));
    (processor, sleeper)
}

fn daily_quota() -> ProviderFailure {
    ProviderFailure::status(
        429,
        "Quota exceeded for quota metric 'Generate requests' and limit 'GenerateRequestsPerDayPerProjectPerModel'",
    )
}

fn overloaded() -> ProviderFailure {
    ProviderFailure::status(503, "The model is overloaded. Please try again later.")
}

#[tokio::test]
async fn test_first_attempt_success() {
    let provider = ScriptedProvider::new(|_, model, _, _| Ok(ProviderReply::text("hello", model)));
    let (processor, sleeper) = build_processor(provider.clone(), &[K1]);

    let response = processor.execute(&RequestSpec::new("hi")).await.unwrap();

    assert_eq!(response.text, "hello");
    assert_eq!(response.provider, "scripted");
    assert_eq!(response.model_used, FAST);
    assert_eq!(response.tier, ModelTier::Fast);
    assert_eq!(response.attempts, 1);
    assert!(!response.tier_fallback_applied());
    assert!(response.status_footer().is_none());
    assert!(sleeper.delays().is_empty());

    let stats = processor.provider_stats("scripted");
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.failures, 0);
}

#[tokio::test]
async fn test_quota_exhausted_key_rotates_to_next_key() {
    let provider = ScriptedProvider::new(|_, model, key, _| {
        if key == K1 {
            Err(daily_quota())
        } else {
            Ok(ProviderReply::text("served by key 2", model))
        }
    });
    let (processor, sleeper) = build_processor(provider.clone(), &[K1, K2]);

    let response = processor.execute(&RequestSpec::new("hi")).await.unwrap();

    assert_eq!(response.text, "served by key 2");
    assert_eq!(response.model_used, FAST);
    assert_eq!(response.attempts, 2);
    assert!(sleeper.delays().is_empty());
    assert_eq!(
        provider.calls(),
        vec![
            Call {
                model: FAST.to_string(),
                key: K1.to_string()
            },
            Call {
                model: FAST.to_string(),
                key: K2.to_string()
            },
        ]
    );

    // The exhausted key stays skipped for later requests.
    processor.execute(&RequestSpec::new("again")).await.unwrap();
    assert_eq!(provider.calls()[2].key, K2);
    assert_eq!(processor.provider_stats("scripted").key_degradations, 1);
}

#[tokio::test]
async fn test_capable_tier_exhaustion_falls_back_to_fast_tier() {
    let provider = ScriptedProvider::new(|_, model, _, _| {
        if model == CAPABLE {
            Err(daily_quota())
        } else {
            Ok(ProviderReply::text("fast answer", model))
        }
    });
    let (processor, _) = build_processor(provider.clone(), &[K1, K2]);
    let spec = RequestSpec::new("analyze this").with_category(TaskCategory::Complex);

    let response = processor.execute(&spec).await.unwrap();

    assert_eq!(response.text, "fast answer");
    assert_eq!(response.model_used, FAST);
    assert_eq!(response.tier, ModelTier::Fast);
    assert!(response.tier_fallback_applied());
    assert_eq!(
        response.tier_fallback.reason.as_deref(),
        Some(CAPABLE_TIER_EXHAUSTED)
    );
    assert_eq!(response.attempts, 3);
    assert_eq!(
        response.status_footer().as_deref(),
        Some("model: fast-model (capable tier quota exhausted)")
    );

    let models: Vec<String> = provider.calls().into_iter().map(|c| c.model).collect();
    assert_eq!(models, vec![CAPABLE, CAPABLE, FAST]);

    // The fast pool was reset and used from its first key.
    assert_eq!(provider.calls()[2].key, K1);

    // Later complex requests skip the capable tier entirely.
    let response = processor.execute(&spec).await.unwrap();
    assert!(response.tier_fallback_applied());
    assert_eq!(provider.calls().len(), 4);
    assert_eq!(provider.calls()[3].model, FAST);

    let stats = processor.provider_stats("scripted");
    assert_eq!(stats.tier_degradations, 1);
    assert_eq!(stats.key_degradations, 2);
}

#[tokio::test]
async fn test_missing_reasoning_trace_is_reported_not_failed() {
    let provider = ScriptedProvider::new(|spec, model, _, _| {
        let mut reply = ProviderReply::text("plain answer", model);
        reply.reasoning = FeatureOutcome::resolve(
            spec.wants_deep_reasoning,
            false,
            "provider returned no reasoning trace",
        );
        Ok(reply)
    });
    let (processor, _) = build_processor(provider, &[K1]);
    let spec = RequestSpec::new("think hard").with_deep_reasoning(true);

    let response = processor.execute(&spec).await.unwrap();

    assert_eq!(response.text, "plain answer");
    assert!(response.reasoning_requested());
    assert!(!response.reasoning_applied());
    assert_eq!(
        response.reasoning.reason(),
        Some("provider returned no reasoning trace")
    );
    assert_eq!(
        response.status_footer().as_deref(),
        Some("deep reasoning: off (provider returned no reasoning trace)")
    );
}

#[tokio::test]
async fn test_features_never_overstated() {
    // Claims features nobody asked for and stays silent on requested ones.
    let provider = ScriptedProvider::new(|spec, model, _, _| {
        let mut reply = ProviderReply::text("answer", model);
        reply.reasoning_trace = Some("trace".to_string());
        reply.sources = vec!["https://example.test".to_string()];
        if !spec.wants_deep_reasoning {
            reply.reasoning = FeatureOutcome::applied();
        }
        if !spec.wants_web_search {
            reply.web_search = FeatureOutcome::applied();
        }
        Ok(reply)
    });
    let (processor, _) = build_processor(provider, &[K1]);

    let response = processor.execute(&RequestSpec::new("q")).await.unwrap();
    assert!(!response.reasoning_requested());
    assert!(!response.reasoning_applied());
    assert!(!response.web_search_applied());
    assert!(response.reasoning_trace.is_none());
    assert!(response.sources.is_empty());

    let spec = RequestSpec::new("q")
        .with_deep_reasoning(true)
        .with_web_search(true);
    let response = processor.execute(&spec).await.unwrap();
    assert!(response.reasoning_requested());
    assert!(!response.reasoning_applied());
    assert!(response.reasoning.reason().is_some());
    assert!(response.web_search_requested());
    assert!(!response.web_search_applied());
    assert!(response.reasoning_trace.is_none());
}

#[tokio::test]
async fn test_confirmed_features_pass_through() {
    let provider = ScriptedProvider::new(|spec, model, _, _| {
        let mut reply = ProviderReply::text("grounded", model);
        reply.reasoning = FeatureOutcome::resolve(spec.wants_deep_reasoning, true, "");
        reply.web_search = FeatureOutcome::resolve(spec.wants_web_search, true, "");
        reply.reasoning_trace = Some("step by step".to_string());
        reply.sources = vec!["https://news.test/1".to_string()];
        Ok(reply)
    });
    let (processor, _) = build_processor(provider, &[K1]);
    let spec = RequestSpec::new("q")
        .with_deep_reasoning(true)
        .with_web_search(true);

    let response = processor.execute(&spec).await.unwrap();
    assert!(response.reasoning_applied());
    assert!(response.web_search_applied());
    assert_eq!(response.reasoning_trace.as_deref(), Some("step by step"));
    assert_eq!(response.sources.len(), 1);
    assert_eq!(
        response.status_footer().as_deref(),
        Some("deep reasoning: on | web search: on")
    );
}

#[tokio::test]
async fn test_token_limit_fails_immediately() {
    let provider = ScriptedProvider::new(|_, _, _, _| {
        Err(ProviderFailure::status(
            400,
            "This model's maximum context length is 8192 tokens (context_length_exceeded)",
        ))
    });
    let (processor, sleeper) = build_processor(provider.clone(), &[K1, K2]);

    let error = processor.execute(&RequestSpec::new("huge")).await.unwrap_err();

    assert!(matches!(
        error,
        ExecutionError::TokenLimitExceeded {
            attempts: 1,
            tier: ModelTier::Fast,
            ..
        }
    ));
    assert_eq!(error.outcome(), Some(Outcome::TokenLimitExceeded));
    assert_eq!(provider.calls().len(), 1);
    assert!(sleeper.delays().is_empty());
    assert_eq!(processor.provider_stats("scripted").failures, 1);
}

#[tokio::test]
async fn test_safety_and_fatal_surface_unchanged() {
    let provider = ScriptedProvider::new(|_, _, _, _| {
        Err(ProviderFailure::ContentBlocked("finish reason SAFETY".to_string()))
    });
    let (processor, _) = build_processor(provider.clone(), &[K1]);
    let error = processor.execute(&RequestSpec::new("x")).await.unwrap_err();
    assert!(matches!(error, ExecutionError::SafetyBlocked { .. }));
    assert_eq!(provider.calls().len(), 1);

    let provider =
        ScriptedProvider::new(|_, _, _, _| Err(ProviderFailure::status(401, "API key not valid")));
    let (processor, _) = build_processor(provider.clone(), &[K1, K2]);
    let error = processor.execute(&RequestSpec::new("x")).await.unwrap_err();
    assert!(matches!(error, ExecutionError::Fatal { .. }));
    assert_eq!(error.provider(), "scripted");
    assert_eq!(provider.calls().len(), 1);
}

#[tokio::test]
async fn test_transient_failures_retry_with_backoff() {
    let provider = ScriptedProvider::new(|_, model, _, call| {
        if call <= 2 {
            Err(overloaded())
        } else {
            Ok(ProviderReply::text("recovered", model))
        }
    });
    let (processor, sleeper) = build_processor(provider.clone(), &[K1, K2]);

    let response = processor.execute(&RequestSpec::new("x")).await.unwrap();

    assert_eq!(response.text, "recovered");
    assert_eq!(response.attempts, 3);
    assert_eq!(
        sleeper.delays(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    // Retries stay on the same key.
    assert!(provider.calls().iter().all(|c| c.key == K1));
    assert_eq!(processor.provider_stats("scripted").retries, 2);
}

#[tokio::test]
async fn test_rate_limit_hint_is_honoured() {
    let provider = ScriptedProvider::new(|_, model, _, call| {
        if call == 1 {
            Err(ProviderFailure::Status {
                status: 429,
                message: "Rate limit reached for requests per min".to_string(),
                retry_after: Some(Duration::from_secs(4)),
            })
        } else {
            Ok(ProviderReply::text("ok", model))
        }
    });
    let (processor, sleeper) = build_processor(provider, &[K1]);

    processor.execute(&RequestSpec::new("x")).await.unwrap();
    assert_eq!(sleeper.delays(), vec![Duration::from_secs(4)]);
}

#[tokio::test]
async fn test_retries_exhausted_returns_aggregate_failure() {
    let provider = ScriptedProvider::new(|_, _, _, _| Err(overloaded()));
    let (processor, sleeper) = build_processor(provider.clone(), &[K1, K2]);

    let error = processor.execute(&RequestSpec::new("x")).await.unwrap_err();

    match &error {
        ExecutionError::Exhausted {
            attempts,
            last_outcome,
            tier,
            ..
        } => {
            assert_eq!(*attempts, 3);
            assert_eq!(*last_outcome, Outcome::Transient);
            assert_eq!(*tier, ModelTier::Fast);
        }
        other => panic!("expected aggregate failure, got {other:?}"),
    }
    assert_eq!(sleeper.delays().len(), 2);
}

#[tokio::test]
async fn test_all_keys_exhausted_degrades_tier_once_then_fails() {
    let provider = ScriptedProvider::new(|_, _, _, _| Err(daily_quota()));
    let (processor, _) = build_processor(provider.clone(), &[K1, K2]);
    let spec = RequestSpec::new("x").with_category(TaskCategory::Complex);

    let error = processor.execute(&spec).await.unwrap_err();

    match &error {
        ExecutionError::Exhausted {
            attempts,
            last_outcome,
            tier,
            ..
        } => {
            assert_eq!(*attempts, 4);
            assert_eq!(*last_outcome, Outcome::QuotaExhausted);
            assert_eq!(*tier, ModelTier::Fast);
        }
        other => panic!("expected aggregate failure, got {other:?}"),
    }

    let models: Vec<String> = provider.calls().into_iter().map(|c| c.model).collect();
    assert_eq!(models, vec![CAPABLE, CAPABLE, FAST, FAST]);
    assert_eq!(processor.provider_stats("scripted").tier_degradations, 1);

    // Nothing usable is left, so no further calls are made.
    let error = processor.execute(&spec).await.unwrap_err();
    assert!(matches!(error, ExecutionError::Exhausted { attempts: 0, .. }));
    assert_eq!(provider.calls().len(), 4);
    assert_eq!(processor.provider_stats("scripted").tier_degradations, 1);
}

#[tokio::test]
async fn test_simple_request_never_degrades_tier() {
    let provider = ScriptedProvider::new(|_, _, _, _| Err(daily_quota()));
    let (processor, _) = build_processor(provider.clone(), &[K1, K2]);

    let error = processor.execute(&RequestSpec::new("x")).await.unwrap_err();
    assert!(matches!(error, ExecutionError::Exhausted { attempts: 2, .. }));
    assert!(provider.calls().iter().all(|c| c.model == FAST));
    assert_eq!(processor.provider_stats("scripted").tier_degradations, 0);
}

#[tokio::test]
async fn test_timeout_is_transient() {
    let provider = ScriptedProvider::slow(Duration::from_secs(10), Duration::from_millis(50));
    let (processor, sleeper) = build_processor(provider.clone(), &[K1]);

    let error = processor.execute(&RequestSpec::new("x")).await.unwrap_err();

    assert!(matches!(
        error,
        ExecutionError::Exhausted {
            last_outcome: Outcome::Transient,
            attempts: 3,
            ..
        }
    ));
    assert_eq!(provider.calls().len(), 3);
    assert_eq!(sleeper.delays().len(), 2);
}

#[tokio::test]
async fn test_unconfigured_and_unknown_providers_are_refused() {
    let provider = ScriptedProvider::new(|_, model, _, _| Ok(ProviderReply::text("x", model)));
    let (processor, _) = build_processor(provider.clone(), &["your_api_key_here"]);

    assert!(!processor.is_configured("scripted"));
    let error = processor.execute(&RequestSpec::new("x")).await.unwrap_err();
    assert!(matches!(error, ExecutionError::ProviderUnavailable { .. }));
    assert!(provider.calls().is_empty());

    let error = processor
        .execute(&RequestSpec::new("x").for_provider("missing"))
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        ExecutionError::ProviderUnavailable { ref provider, .. } if provider == "missing"
    ));
}

#[tokio::test]
async fn test_separate_fast_tier_credentials() {
    let provider = ScriptedProvider::new(|_, model, _, _| Ok(ProviderReply::text("x", model)));
    let sleeper = Arc::new(RecordingSleeper::default());
    let mut processor = Processor::new(policy(), QuotaReset::default()).with_sleeper(sleeper);
    let mut settings = settings(&[K1]);
    settings.fast_api_keys = Some(vec![K3.to_string()]);
    processor.register(provider.clone(), &settings);

    processor.execute(&RequestSpec::new("fast")).await.unwrap();
    processor
        .execute(&RequestSpec::new("capable").with_category(TaskCategory::Complex))
        .await
        .unwrap();

    let calls = provider.calls();
    assert_eq!(calls[0].key, K3);
    assert_eq!(calls[1].key, K1);
}

#[tokio::test]
async fn test_task_wrappers_route_by_category() {
    let provider = ScriptedProvider::new(|spec, model, _, _| {
        Ok(ProviderReply::text(spec.prompt.clone(), model))
    });
    let (processor, _) = build_processor(provider, &[K1]);

    let translated = processor.translate("Hola", "English").await.unwrap();
    assert_eq!(translated.model_used, FAST);
    assert!(translated.text.contains("English"));

    let analysis = processor.analyze("Quarterly numbers").await.unwrap();
    assert_eq!(analysis.model_used, CAPABLE);

    let answer = processor
        .answer_question("Who won?", Some("The home team won 3-1."))
        .await
        .unwrap();
    assert!(answer.text.contains("The home team won 3-1."));
    assert!(answer.text.contains("Who won?"));
}

#[tokio::test]
async fn test_provider_trait_wrappers() {
    let provider = ScriptedProvider::new(|spec, model, _, _| {
        Ok(ProviderReply::text(spec.prompt.clone(), model))
    });

    let reply = provider.translate("Bonjour", "German", FAST, K1).await.unwrap();
    assert!(reply.text.contains("German"));
    assert!(reply.text.contains("Bonjour"));

    let reply = provider.analyze("text", CAPABLE, K1).await.unwrap();
    assert!(reply.text.contains("Analyze"));

    let reply = provider.answer_question("Why?", None, FAST, K1).await.unwrap();
    assert_eq!(reply.text, "Why?");
}

#[tokio::test]
async fn test_concurrent_requests_share_pool_state() {
    let provider = ScriptedProvider::new(|_, model, key, _| {
        if key == K1 || key == K2 {
            Err(daily_quota())
        } else {
            Ok(ProviderReply::text(key.to_string(), model))
        }
    });
    let (processor, _) = build_processor(provider.clone(), &[K1, K2, K3, K4]);
    let processor = Arc::new(processor);

    let mut handles = Vec::new();
    for i in 0..20 {
        let processor = processor.clone();
        handles.push(tokio::spawn(async move {
            processor.execute(&RequestSpec::new(format!("request {i}"))).await
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert!(response.text == K3 || response.text == K4);
    }

    let status = processor.provider_status().await;
    let fast_pool = status[0].fast_pool.as_ref().unwrap();
    assert_eq!(fast_pool.total_keys, 4);
    assert_eq!(fast_pool.usable_keys, 2);

    let stats = processor.provider_stats("scripted");
    assert_eq!(stats.requests, 20);
    assert_eq!(stats.successes, 20);

    let all = processor.stats();
    assert_eq!(all.len(), 1);
    assert_eq!(all["scripted"], stats);
}

#[tokio::test]
async fn test_provider_status_reports_exhausted_capable_tier() {
    let provider = ScriptedProvider::new(|_, model, _, _| {
        if model == CAPABLE {
            Err(daily_quota())
        } else {
            Ok(ProviderReply::text("ok", model))
        }
    });
    let (processor, _) = build_processor(provider, &[K1]);

    let before = processor.provider_status().await;
    assert_eq!(before.len(), 1);
    assert!(before[0].configured);
    assert!(before[0].is_default);
    assert!(before[0].capable_exhausted_until.is_none());

    processor.analyze("x").await.unwrap();

    let after = processor.provider_status().await;
    assert!(after[0].capable_exhausted_until.is_some());
    assert_eq!(after[0].capable_pool.as_ref().unwrap().usable_keys, 0);
    assert_eq!(after[0].fast_pool.as_ref().unwrap().usable_keys, 1);
}
