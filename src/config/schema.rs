//! TOML configuration schema for the sandbox agent core.
//!
//! All fields carry `#[serde(default)]` so a partially-filled `config.toml`
//! works correctly. Missing sections fall back to their `Default` impl.
//!
//! Example `~/.sandbox-agent/config.toml`:
//! ```toml
//! [executor]
//! max_tool_calls = 50
//! max_tokens = 10000
//! max_wall_ms = 30000
//! max_cost_usd = 1.0
//! max_memory_mb = 100
//!
//! [executor.policy]
//! deny_list = ["execCommand", "writeFileChunk", "patchFile"]
//! max_script_length = 50000
//!
//! [daemon]
//! host = "127.0.0.1"
//! port = 0
//! install_enabled = true
//! ```

use serde::{Deserialize, Serialize};

use crate::policy::{ResourceQuotas, SecurityPolicy};

// ─── PolicyConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Tool names explicitly allowed. Empty means "allow all not denied".
    pub allow_list: Vec<String>,
    /// Tool names explicitly denied, regardless of the allow list.
    pub deny_list: Vec<String>,
    pub max_script_length: usize,
    pub allow_network: bool,
    pub allow_filesystem: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allow_list: Vec::new(),
            deny_list: vec![
                "execCommand".to_owned(),
                "writeFileChunk".to_owned(),
                "patchFile".to_owned(),
            ],
            max_script_length: 50_000,
            allow_network: false,
            allow_filesystem: false,
        }
    }
}

// ─── ExecutorConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_tool_calls: u64,
    pub max_tokens: u64,
    pub max_wall_ms: u64,
    pub max_cost_usd: f64,
    pub max_memory_mb: u64,
    pub policy: PolicyConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: 50,
            max_tokens: 10_000,
            max_wall_ms: 30_000,
            max_cost_usd: 1.0,
            max_memory_mb: 100,
            policy: PolicyConfig::default(),
        }
    }
}

// ─── DaemonConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub host: String,
    /// 0 means "auto-select by scanning the conventional port range".
    pub port: u16,
    pub install_enabled: bool,
    /// Optional override path to a pre-existing daemon installation.
    pub install_path: Option<String>,
    pub log_level: String,
    pub completion_timeout_ms: u64,
    pub keep_logfiles: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 0,
            install_enabled: true,
            install_path: None,
            log_level: "info".to_owned(),
            completion_timeout_ms: 10_000,
            keep_logfiles: true,
        }
    }
}

impl From<&PolicyConfig> for SecurityPolicy {
    fn from(config: &PolicyConfig) -> Self {
        Self {
            allow_list: config.allow_list.iter().cloned().collect(),
            deny_list: config.deny_list.iter().cloned().collect(),
            max_script_length: config.max_script_length,
            allow_network: config.allow_network,
            allow_filesystem: config.allow_filesystem,
        }
    }
}

impl From<&ExecutorConfig> for ResourceQuotas {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            max_tool_calls: config.max_tool_calls,
            max_tokens: config.max_tokens,
            max_wall_ms: config.max_wall_ms,
            max_cost_usd: config.max_cost_usd,
            max_memory_mb: config.max_memory_mb,
        }
    }
}

// ─── AppConfig ────────────────────────────────────────────────────────────────

/// Top-level application configuration.
///
/// Loaded from `~/.sandbox-agent/config.toml`, falling back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub executor: ExecutorConfig,
    pub daemon: DaemonConfig,
}
