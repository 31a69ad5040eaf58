//! Command line argument parsing
//!
//! This module handles CLI argument parsing with subcommands:
//! - `ask`: Send a prompt, optionally with deep reasoning or web search
//! - `translate`: Translate text into another language
//! - `analyze`: Analyze text with the capable model tier
//! - `status`: Show provider health and key pool state
//! - `show-config`: Show configuration discovery information
//! - `init`: Write a default user configuration file

use crate::llm::{RequestSpec, TaskCategory};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug)]
pub enum ExecutionMode {
    Execute(ExecuteConfig),
    Status { config_override: Option<PathBuf> },
    ShowConfig { config_override: Option<PathBuf> },
    Init,
}

/// A single request to run, plus how to run it.
#[derive(Debug)]
pub struct ExecuteConfig {
    pub request: RequestSpec,
    pub config_override: Option<PathBuf>,
    pub json: bool,
}

#[derive(Debug, Parser)]
#[command(name = "llm-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Run language-model requests across providers with key rotation, tier fallback and retries"
)]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Print the full response metadata as JSON
    #[arg(long = "json", global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Send a prompt to a provider
    Ask {
        /// Prompt text
        prompt: String,
        /// Prefer the capable model tier
        #[arg(long = "complex")]
        complex: bool,
        /// Request deep reasoning
        #[arg(short = 'r', long = "reasoning")]
        reasoning: bool,
        /// Request web search grounding
        #[arg(short = 's', long = "search")]
        search: bool,
        /// Provider name (defaults to the configured default)
        #[arg(short = 'p', long = "provider")]
        provider: Option<String>,
        /// System message
        #[arg(long = "system")]
        system: Option<String>,
        /// Maximum output tokens
        #[arg(long = "max-tokens")]
        max_tokens: Option<u64>,
        /// Sampling temperature
        #[arg(long = "temperature")]
        temperature: Option<f32>,
    },
    /// Translate text
    Translate {
        /// Text to translate
        text: String,
        /// Target language
        #[arg(short = 't', long = "to")]
        to: String,
        /// Provider name
        #[arg(short = 'p', long = "provider")]
        provider: Option<String>,
    },
    /// Analyze text in depth
    Analyze {
        /// Text to analyze
        text: String,
        /// Request deep reasoning
        #[arg(short = 'r', long = "reasoning")]
        reasoning: bool,
        /// Provider name
        #[arg(short = 'p', long = "provider")]
        provider: Option<String>,
    },
    /// Show provider status and key pool state
    Status,
    /// Show configuration discovery information
    ShowConfig,
    /// Create ~/.llm-relay/config.toml with defaults
    Init,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        let request = match &self.command {
            Some(Commands::Ask {
                prompt,
                complex,
                reasoning,
                search,
                provider,
                system,
                max_tokens,
                temperature,
            }) => {
                if prompt.trim().is_empty() {
                    return Err("Prompt must not be empty".to_string());
                }

                let category = if *complex {
                    TaskCategory::Complex
                } else {
                    TaskCategory::Simple
                };
                let mut request = RequestSpec::new(prompt.clone())
                    .with_category(category)
                    .with_deep_reasoning(*reasoning)
                    .with_web_search(*search);
                if let Some(system) = system {
                    request = request.with_system_message(system.clone());
                }
                if let Some(max_tokens) = max_tokens {
                    request = request.with_max_tokens(*max_tokens);
                }
                if let Some(temperature) = temperature {
                    if !(0.0_f32..=2.0).contains(temperature) {
                        return Err(format!(
                            "Temperature must be between 0.0 and 2.0, got {temperature}"
                        ));
                    }
                    request = request.with_temperature(*temperature);
                }
                with_provider(request, provider)
            }
            Some(Commands::Translate { text, to, provider }) => {
                if to.trim().is_empty() {
                    return Err("Target language must not be empty".to_string());
                }
                with_provider(RequestSpec::translation(text, to), provider)
            }
            Some(Commands::Analyze {
                text,
                reasoning,
                provider,
            }) => with_provider(
                RequestSpec::analysis(text).with_deep_reasoning(*reasoning),
                provider,
            ),
            Some(Commands::Status) => {
                return Ok(ExecutionMode::Status {
                    config_override: self.config.clone(),
                });
            }
            Some(Commands::ShowConfig) => {
                return Ok(ExecutionMode::ShowConfig {
                    config_override: self.config.clone(),
                });
            }
            Some(Commands::Init) => return Ok(ExecutionMode::Init),
            None => {
                return Err(
                    "No command specified. Use 'llm-relay --help' to see available commands."
                        .to_string(),
                );
            }
        };

        Ok(ExecutionMode::Execute(ExecuteConfig {
            request,
            config_override: self.config.clone(),
            json: self.json,
        }))
    }
}

fn with_provider(request: RequestSpec, provider: &Option<String>) -> RequestSpec {
    match provider {
        Some(name) => request.for_provider(name.clone()),
        None => request,
    }
}
