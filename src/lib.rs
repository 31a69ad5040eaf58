//! # llm-relay
//!
//! Resilient execution of language-model requests against interchangeable
//! remote providers.
//!
//! ## Architecture Overview
//!
//! - **[`resilience`]**: error classification, retry with backoff, key rotation
//!   pools and model tier selection
//! - **[`llm`]**: request and response types, the provider contract and the
//!   Gemini, OpenAI-compatible and Anthropic adapters
//! - **[`processor`]**: the execution engine tying the two together
//! - **[`config`]**: TOML configuration with environment overlays
//!
//! Rotation and exhaustion state lives in memory for the lifetime of the
//! process.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use llm_relay::{Processor, RelayConfig, RequestSpec};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = RelayConfig::default();
//!     config.apply_env_overrides();
//!
//!     let processor = Processor::from_config(&config)?;
//!     let request = RequestSpec::new("Summarize the plot of Hamlet")
//!         .with_deep_reasoning(true);
//!
//!     let response = processor.execute(&request).await?;
//!     println!("{}", response.text);
//!     if let Some(footer) = response.status_footer() {
//!         println!("[{footer}]");
//!     }
//!     Ok(())
//! }
//! ```

/// Failure classification, retry engine, key pools and tier selection.
pub mod resilience;

/// Provider-agnostic request/response types and provider adapters.
pub mod llm;

/// Request execution engine.
pub mod processor;

/// Relay configuration.
pub mod config;

/// Environment constants and path utilities.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use config::{ConfigError, RelayConfig};
pub use llm::{
    FeatureOutcome, LLMProvider, LLMProviderFactory, ProviderFailure, ProviderKind,
    ProviderReply, ProviderSettings, RequestSpec, ResponseMetadata, TaskCategory, TierFallback,
    TokenUsage,
};
pub use processor::{ExecutionError, Processor, ProviderHealth, ProviderStats};
pub use resilience::{
    ErrorClassifier, KeyRotationPool, ModelTier, ModelTierSelector, Outcome, QuotaReset,
    RetryEngine, RetryPolicy,
};
