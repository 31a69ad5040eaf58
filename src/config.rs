use crate::env;
use crate::llm::{ProviderKind, ProviderSettings};
use crate::resilience::{QuotaReset, RetryPolicy, mask_key};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration to TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration: providers, retry policy and quota reset boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Provider used when a request does not name one.
    pub default_provider: String,
    pub retry: RetryPolicy,
    /// When exhausted keys and tiers become usable again.
    pub quota_reset: QuotaReset,
    pub providers: Vec<ProviderSettings>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_provider: "gemini".to_string(),
            retry: RetryPolicy::default(),
            quota_reset: QuotaReset::default(),
            providers: vec![
                ProviderSettings::new("gemini", ProviderKind::Gemini),
                ProviderSettings::new("openai", ProviderKind::OpenAI),
                ProviderSettings::new("anthropic", ProviderKind::Anthropic),
            ],
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Convert configuration to a TOML string
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(ConfigError::Invalid("provider name is empty".to_string()));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "provider '{}' is defined more than once",
                    provider.name
                )));
            }
        }

        if !names.contains(self.default_provider.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "default provider '{}' is not defined",
                self.default_provider
            )));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }

        if let QuotaReset::DailyUtc { hour } = self.quota_reset
            && hour > 23
        {
            return Err(ConfigError::Invalid(format!(
                "quota_reset hour must be 0-23, got {hour}"
            )));
        }

        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Overlay credentials and the default provider from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Overlay values from an arbitrary variable lookup.
    ///
    /// `<NAME>_API_KEYS` (comma-separated) wins over `<NAME>_API_KEY`; either
    /// replaces the provider's configured keys. Empty values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for provider in &mut self.providers {
            let keys = lookup(&env::api_keys_var(&provider.name))
                .filter(|v| !v.trim().is_empty())
                .map(|v| split_keys(&v))
                .or_else(|| {
                    lookup(&env::api_key_var(&provider.name))
                        .filter(|v| !v.trim().is_empty())
                        .map(|v| vec![v.trim().to_string()])
                });

            if let Some(keys) = keys {
                info!(
                    "Using {} key(s) for {} from the environment",
                    keys.len(),
                    provider.name
                );
                provider.api_keys = keys;
            }
        }

        if let Some(default) =
            lookup(env::vars::DEFAULT_PROVIDER).filter(|v| !v.trim().is_empty())
        {
            self.default_provider = default.trim().to_string();
        }
    }

    /// Copy safe to print: every credential replaced by its fingerprint.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for provider in &mut copy.providers {
            provider.api_keys = provider.api_keys.iter().map(|k| mask_key(k)).collect();
            if let Some(fast) = &mut provider.fast_api_keys {
                *fast = fast.iter().map(|k| mask_key(k)).collect();
            }
        }
        copy
    }
}

fn split_keys(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quota_reset, QuotaReset::DailyUtc { hour: 0 });
        assert!(config.provider("gemini").is_some());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("GEMINI_API_KEYS", " key-one-aaaaaaaaaaaaaaaa , key-two-bbbbbbbbbbbbbbbb ,"),
            ("GEMINI_API_KEY", "ignored-when-list-present"),
            ("OPENAI_API_KEY", "sk-single-cccccccccccccccccc"),
            ("ANTHROPIC_API_KEYS", "   "),
            ("LLM_RELAY_PROVIDER", "openai"),
        ]);
        let mut config = RelayConfig::default();
        config.apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(
            config.provider("gemini").unwrap().api_keys,
            vec!["key-one-aaaaaaaaaaaaaaaa", "key-two-bbbbbbbbbbbbbbbb"]
        );
        assert_eq!(
            config.provider("openai").unwrap().api_keys,
            vec!["sk-single-cccccccccccccccccc"]
        );
        assert!(config.provider("anthropic").unwrap().api_keys.is_empty());
        assert_eq!(config.default_provider, "openai");
    }

    #[test]
    fn test_validation_errors() {
        let mut config = RelayConfig::default();
        config.default_provider = "missing".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = RelayConfig::default();
        config.providers.push(ProviderSettings::new("gemini", ProviderKind::Gemini));
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.retry.base_delay_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.quota_reset = QuotaReset::DailyUtc { hour: 24 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_masks_keys() {
        let mut config = RelayConfig::default();
        config.providers[0].api_keys = vec!["AIzaSyRealLookingKey0001abcdef".to_string()];
        let redacted = config.redacted();
        let text = redacted.to_toml_string().unwrap();
        assert!(!text.contains("AIzaSyRealLookingKey0001abcdef"));
        assert!(text.contains("AIza…cdef"));
    }
}
