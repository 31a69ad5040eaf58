//! CLI-specific functionality for llm-relay
//!
//! This module contains argument parsing and configuration discovery.

pub mod args;
pub mod config;

pub use args::{Args, Commands, ExecuteConfig, ExecutionMode};
pub use config::ConfigDiscovery;
