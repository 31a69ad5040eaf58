use llm_relay::cli::ConfigDiscovery;
use llm_relay::env;
use llm_relay::{ConfigError, Processor, ProviderKind, QuotaReset, RelayConfig};
use serial_test::serial;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

const RELAY_TOML: &str = r#"
default_provider = "relaytest"

[retry]
max_attempts = 5
base_delay_ms = 250
max_delay_ms = 8000
jitter = false

[quota_reset]
mode = "rolling"
window_secs = 3600

[[providers]]
name = "relaytest"
kind = "gemini"
api_keys = ["your_api_key_here"]
capable_model = "gemini-2.5-pro"
fast_model = "gemini-2.5-flash"
request_timeout_secs = 45

[[providers]]
name = "claude"
kind = "anthropic"
enabled = false
api_keys = ["sk-ant-REDACTED"]
reasoning_budget_tokens = 2048
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

#[test]
fn test_config_file_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("relay.toml");

    let mut original = RelayConfig::default();
    original.quota_reset = QuotaReset::DailyUtc { hour: 7 };
    original.retry.max_attempts = 4;
    original.providers[0].api_keys = vec![env::test::TEST_API_KEY.to_string()];

    original
        .to_toml_file(&path)
        .expect("Should be able to save config");
    let loaded = RelayConfig::from_toml_file(&path).expect("Should be able to load config");

    assert_eq!(loaded.default_provider, original.default_provider);
    assert_eq!(loaded.retry, original.retry);
    assert_eq!(loaded.quota_reset, QuotaReset::DailyUtc { hour: 7 });
    assert_eq!(loaded.providers.len(), 3);
    assert_eq!(loaded.providers[0].api_keys, original.providers[0].api_keys);
}

#[test]
fn test_full_config_parses() {
    let config = RelayConfig::from_toml_str(RELAY_TOML).expect("Config should parse");

    assert_eq!(config.default_provider, "relaytest");
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.base_delay_ms, 250);
    assert!(config.retry.exponential);
    assert!(!config.retry.jitter);
    assert_eq!(config.quota_reset, QuotaReset::Rolling { window_secs: 3600 });

    let relay = config.provider("relaytest").unwrap();
    assert_eq!(relay.kind, ProviderKind::Gemini);
    assert_eq!(relay.capable_model(), "gemini-2.5-pro");
    assert_eq!(relay.request_timeout().as_secs(), 45);

    let claude = config.provider("claude").unwrap();
    assert_eq!(claude.kind, ProviderKind::Anthropic);
    assert!(!claude.enabled);
    assert_eq!(claude.reasoning_budget_tokens, 2048);
}

#[test]
fn test_daily_reset_hour_defaults_to_midnight() {
    let config = RelayConfig::from_toml_str(
        r#"
[quota_reset]
mode = "daily_utc"
"#,
    )
    .unwrap();
    assert_eq!(config.quota_reset, QuotaReset::DailyUtc { hour: 0 });
}

#[test]
fn test_invalid_configs_rejected() {
    let bad_hour = r#"
[quota_reset]
mode = "daily_utc"
hour = 24
"#;
    assert!(matches!(
        RelayConfig::from_toml_str(bad_hour),
        Err(ConfigError::Invalid(_))
    ));

    let missing_default = r#"
default_provider = "nowhere"
"#;
    assert!(matches!(
        RelayConfig::from_toml_str(missing_default),
        Err(ConfigError::Invalid(_))
    ));

    let inverted_delays = r#"
[retry]
base_delay_ms = 10000
max_delay_ms = 100
"#;
    assert!(RelayConfig::from_toml_str(inverted_delays).is_err());

    assert!(matches!(
        RelayConfig::from_toml_str("default_provider = ["),
        Err(ConfigError::Parse(_))
    ));

    let missing = RelayConfig::from_toml_file("/nonexistent/llm-relay.toml");
    assert!(matches!(missing, Err(ConfigError::Read { .. })));
}

#[test]
fn test_placeholder_keys_leave_provider_unconfigured() {
    let config = RelayConfig::from_toml_str(RELAY_TOML).unwrap();
    let processor = Processor::from_config(&config).expect("Providers should build");

    // Disabled providers are not registered at all.
    assert_eq!(processor.provider_names(), vec!["relaytest".to_string()]);
    assert_eq!(processor.default_provider(), Some("relaytest"));
    assert!(!processor.is_configured("relaytest"));
}

#[test]
#[serial]
fn test_environment_keys_overlay_file() {
    let file = write_config(RELAY_TOML);
    let keys_var = env::api_keys_var("relaytest");
    let key_var = env::api_key_var("relaytest");

    unsafe {
        std::env::set_var(
            &keys_var,
            format!("{}, {}", env::test::TEST_API_KEY, env::test::TEST_API_KEY_2),
        );
        std::env::set_var(&key_var, "AIzaSyIgnoredSingleKey00000000000");
    }

    let loaded = ConfigDiscovery::load(Some(file.path()));

    unsafe {
        std::env::remove_var(&keys_var);
        std::env::remove_var(&key_var);
    }

    let config = loaded.expect("Config should load");
    let relay = config.provider("relaytest").unwrap();
    assert_eq!(
        relay.api_keys,
        vec![
            env::test::TEST_API_KEY.to_string(),
            env::test::TEST_API_KEY_2.to_string()
        ]
    );

    let processor = Processor::from_config(&config).unwrap();
    assert!(processor.is_configured("relaytest"));
}

#[test]
#[serial]
fn test_environment_default_provider_must_exist() {
    let file = write_config(RELAY_TOML);

    unsafe {
        std::env::set_var(env::vars::DEFAULT_PROVIDER, "claude");
    }
    let loaded = ConfigDiscovery::load(Some(file.path()));
    unsafe {
        std::env::set_var(env::vars::DEFAULT_PROVIDER, "not-defined");
    }
    let rejected = ConfigDiscovery::load(Some(file.path()));
    unsafe {
        std::env::remove_var(env::vars::DEFAULT_PROVIDER);
    }

    assert_eq!(loaded.unwrap().default_provider, "claude");
    assert!(matches!(rejected, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_redacted_config_hides_keys() {
    let mut config = RelayConfig::default();
    config.providers[0].api_keys = vec![env::test::TEST_API_KEY.to_string()];

    let rendered = config.redacted().to_toml_string().unwrap();
    assert!(!rendered.contains(env::test::TEST_API_KEY));
}
