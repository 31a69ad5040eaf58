//! Environment constants and path utilities for llm-relay.
//!
//! Centralizes file names, directory names and environment variable names
//! so that config discovery and the CLI agree on them.

use std::path::{Path, PathBuf};

/// Hidden per-project and per-user directory name
pub const RELAY_DIR_NAME: &str = ".llm-relay";

/// Configuration file name inside [`RELAY_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Stand-alone configuration file looked up in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "llm-relay.toml";

/// System-wide configuration directory
pub const SYSTEM_CONFIG_DIR: &str = "/etc/llm-relay";

/// Default tracing filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "llm_relay=info";

/// Environment variable names
pub mod vars {
    /// Suffix for a comma-separated credential list, e.g. `GEMINI_API_KEYS`
    pub const API_KEYS_SUFFIX: &str = "_API_KEYS";

    /// Suffix for a single credential, e.g. `GEMINI_API_KEY`
    pub const API_KEY_SUFFIX: &str = "_API_KEY";

    /// Overrides the default provider name
    pub const DEFAULT_PROVIDER: &str = "LLM_RELAY_PROVIDER";
}

/// Test-related constants
pub mod test {
    /// Structurally valid credential that no provider accepts
    pub const TEST_API_KEY: &str = "AIzaSyTestKey0001abcdefghijklmnop";

    /// Second credential for rotation tests
    pub const TEST_API_KEY_2: &str = "AIzaSyTestKey0002abcdefghijklmnop";
}

/// Environment variable prefix for a provider name: `open-router` becomes `OPEN_ROUTER`.
pub fn env_prefix(provider_name: &str) -> String {
    provider_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// `<PREFIX>_API_KEYS`
pub fn api_keys_var(provider_name: &str) -> String {
    format!("{}{}", env_prefix(provider_name), vars::API_KEYS_SUFFIX)
}

/// `<PREFIX>_API_KEY`
pub fn api_key_var(provider_name: &str) -> String {
    format!("{}{}", env_prefix(provider_name), vars::API_KEY_SUFFIX)
}

/// Build the `.llm-relay` directory path from a root
pub fn relay_dir_path(root: &Path) -> PathBuf {
    root.join(RELAY_DIR_NAME)
}

/// Build the `.llm-relay/config.toml` path from a root
pub fn relay_config_path(root: &Path) -> PathBuf {
    relay_dir_path(root).join(CONFIG_FILE_NAME)
}

/// Build the `llm-relay.toml` path in a directory
pub fn local_config_path(dir: &Path) -> PathBuf {
    dir.join(LOCAL_CONFIG_FILE_NAME)
}

/// System-wide configuration file path
pub fn system_config_path() -> PathBuf {
    Path::new(SYSTEM_CONFIG_DIR).join(CONFIG_FILE_NAME)
}
