//! TOML configuration loading, env-var overrides, and atomic saves.
//!
//! # Loading order
//! 1. Parse `~/.sandbox-agent/config.toml` (or the path in `SANDBOX_AGENT_CONFIG`)
//! 2. Apply `SANDBOX_AGENT_*` environment variable overrides
//! 3. Fall back to [`AppConfig::default()`] if the file is missing
//!
//! # Atomic save
//! Writes to `<path>.tmp`, backs up the existing file, then renames the temp
//! file into place so a crash mid-write never corrupts the config file.

use std::{
    env,
    fs,
    path::{Path, PathBuf},
};

use super::schema::AppConfig;

// ─── default_config_path ─────────────────────────────────────────────────────

/// Return the default config file path: `~/.sandbox-agent/config.toml`.
pub fn default_config_path() -> Result<PathBuf, String> {
    dirs::home_dir()
        .map(|h| h.join(".sandbox-agent").join("config.toml"))
        .ok_or_else(|| "could not determine home directory".to_string())
}

// ─── load_config ─────────────────────────────────────────────────────────────

/// Load [`AppConfig`] from the given path, falling back to defaults if the
/// file does not exist, then applying environment variable overrides.
pub fn load_config(path: &Path) -> Result<AppConfig, String> {
    let mut config = match fs::read_to_string(path) {
        Ok(content) => toml::from_str::<AppConfig>(&content)
            .map_err(|e| format!("failed to parse config at {path:?}: {e}"))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => return Err(format!("failed to read config at {path:?}: {e}")),
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load config from the default path (or `$SANDBOX_AGENT_CONFIG`).
pub fn load_default_config() -> AppConfig {
    let path = env::var("SANDBOX_AGENT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_config_path().unwrap_or_else(|_| PathBuf::from("config.toml")));

    load_config(&path).unwrap_or_default()
}

// ─── apply_env_overrides ─────────────────────────────────────────────────────

/// Apply `SANDBOX_AGENT_*` environment variable overrides to `config`.
///
/// Supported overrides:
/// - `SANDBOX_AGENT_MAX_TOOL_CALLS` → `executor.max_tool_calls`
/// - `SANDBOX_AGENT_MAX_TOKENS`     → `executor.max_tokens`
/// - `SANDBOX_AGENT_MAX_WALL_MS`    → `executor.max_wall_ms`
/// - `SANDBOX_AGENT_MAX_COST_USD`   → `executor.max_cost_usd`
/// - `SANDBOX_AGENT_MAX_MEMORY_MB`  → `executor.max_memory_mb`
/// - `SANDBOX_AGENT_DAEMON_HOST`    → `daemon.host`
/// - `SANDBOX_AGENT_DAEMON_PORT`    → `daemon.port`
/// - `SANDBOX_AGENT_DAEMON_INSTALL` → `daemon.install_enabled` (1/0)
fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(v) = env::var("SANDBOX_AGENT_MAX_TOOL_CALLS") {
        if let Ok(n) = v.parse() {
            config.executor.max_tool_calls = n;
        }
    }
    if let Ok(v) = env::var("SANDBOX_AGENT_MAX_TOKENS") {
        if let Ok(n) = v.parse() {
            config.executor.max_tokens = n;
        }
    }
    if let Ok(v) = env::var("SANDBOX_AGENT_MAX_WALL_MS") {
        if let Ok(n) = v.parse() {
            config.executor.max_wall_ms = n;
        }
    }
    if let Ok(v) = env::var("SANDBOX_AGENT_MAX_COST_USD") {
        if let Ok(n) = v.parse() {
            config.executor.max_cost_usd = n;
        }
    }
    if let Ok(v) = env::var("SANDBOX_AGENT_MAX_MEMORY_MB") {
        if let Ok(n) = v.parse() {
            config.executor.max_memory_mb = n;
        }
    }
    if let Ok(v) = env::var("SANDBOX_AGENT_DAEMON_HOST") {
        config.daemon.host = v;
    }
    if let Ok(v) = env::var("SANDBOX_AGENT_DAEMON_PORT") {
        if let Ok(n) = v.parse() {
            config.daemon.port = n;
        }
    }
    if let Ok(v) = env::var("SANDBOX_AGENT_DAEMON_INSTALL") {
        config.daemon.install_enabled = v == "1" || v.eq_ignore_ascii_case("true");
    }
}

// ─── save_config ─────────────────────────────────────────────────────────────

/// Atomically save `config` to `path`.
///
/// Writes to `<path>.tmp`, backs up any existing file to `<path>.bak`, then
/// renames the temp file into place.
pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), String> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| format!("failed to serialise config: {e}"))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create config dir: {e}"))?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &content).map_err(|e| format!("failed to write temp config: {e}"))?;

    if path.exists() {
        let bak_path = path.with_extension("toml.bak");
        fs::copy(path, &bak_path).map_err(|e| format!("failed to backup config: {e}"))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| format!("failed to replace config file: {e}"))?;

    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unsafe_code)] // env::set_var / remove_var are unsafe in Rust 2024; tests are single-threaded.
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn load_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[executor]\nmax_tool_calls = 5\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.executor.max_tool_calls, 5);
        assert_eq!(config.executor.max_tokens, 10_000);
    }

    #[test]
    fn load_full_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[executor]
max_tool_calls = 10
max_tokens = 2000
max_wall_ms = 5000
max_cost_usd = 0.5
max_memory_mb = 64

[executor.policy]
allow_list = ["echo"]
deny_list = []
max_script_length = 1000
allow_network = true
allow_filesystem = true

[daemon]
host = "0.0.0.0"
port = 8085
install_enabled = false
log_level = "debug"
completion_timeout_ms = 5000
keep_logfiles = false
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.executor.max_tool_calls, 10);
        assert_eq!(config.executor.policy.allow_list, vec!["echo".to_string()]);
        assert!(config.executor.policy.allow_network);
        assert_eq!(config.daemon.port, 8085);
        assert!(!config.daemon.install_enabled);
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut original = AppConfig::default();
        original.daemon.host = "10.0.0.1".to_owned();
        original.executor.max_cost_usd = 2.5;

        save_config(&path, &original).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, original, "config should round-trip through save/load");
    }

    #[test]
    fn save_creates_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        save_config(&path, &AppConfig::default()).unwrap();
        save_config(&path, &AppConfig::default()).unwrap();

        let bak = path.with_extension("toml.bak");
        assert!(bak.exists(), "backup file should exist after second save");
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let nested_path = dir.path().join("a").join("b").join("config.toml");
        save_config(&nested_path, &AppConfig::default()).unwrap();
        assert!(nested_path.exists(), "config should be created in nested dirs");
    }

    #[test]
    fn env_override_max_tool_calls() {
        let key = "SANDBOX_AGENT_MAX_TOOL_CALLS";
        // SAFETY: single-threaded test context; no other threads read this var.
        unsafe { env::set_var(key, "7") };
        let config = load_default_config();
        // SAFETY: same as set_var above.
        unsafe { env::remove_var(key) };
        assert_eq!(config.executor.max_tool_calls, 7);
    }

    #[test]
    fn env_override_daemon_install_false() {
        let key = "SANDBOX_AGENT_DAEMON_INSTALL";
        // SAFETY: single-threaded test context; no other threads read this var.
        unsafe { env::set_var(key, "0") };
        let config = load_default_config();
        // SAFETY: same as set_var above.
        unsafe { env::remove_var(key) };
        assert!(!config.daemon.install_enabled);
    }

    #[test]
    fn load_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "this is not valid toml!!!");
        let result = load_config(&path);
        assert!(result.is_err(), "invalid TOML should return an error");
    }
}
