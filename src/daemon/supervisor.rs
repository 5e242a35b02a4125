//! Daemon Supervisor — brings a language-intelligence daemon to a running
//! state: locates or installs it, spawns the process, negotiates a port,
//! health-checks it, and restarts it on request.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::error::SupervisorError;

use super::client::DaemonClient;

const PORT_RANGE_START: u16 = 8080;
const PORT_RANGE_END: u16 = 8090;
const MAX_PORT_RETRIES: u32 = 5;
const STARTUP_BUDGET: Duration = Duration::from_secs(30);
const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(1);
const GRACEFUL_STOP_BUDGET: Duration = Duration::from_secs(5);

const READINESS_BANNERS: &[&str] = &[
    r"(?i)serving on http://[^:]+:(\d+)",
    r"(?i)server running at .*:(\d+)",
    r"(?i)listening on port (\d+)",
    r"(?i)^port:\s*(\d+)",
];

const PORT_IN_USE_PATTERN: &str = r"(?i)port[_\s-]?in[_\s-]?use";

/// Outcome of racing a freshly-spawned child's stdout (readiness banner)
/// against its stderr (a `PORT_IN_USE` signal) until one side resolves.
enum SpawnOutcome {
    Ready(u16),
    PortInUse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

/// Everything a caller needs to reach a running daemon session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSessionInfo {
    pub host: String,
    pub port: u16,
    /// Base64-encoded; empty for externally-detected, unauthenticated
    /// sessions.
    pub hmac_secret: String,
    pub pid: Option<u32>,
    pub status: DaemonStatus,
}

/// Brings a daemon process to a running state and keeps it there.
pub struct DaemonSupervisor {
    config: DaemonConfig,
    child: Mutex<Option<Child>>,
    info: Mutex<Option<DaemonSessionInfo>>,
}

impl DaemonSupervisor {
    pub fn new(config: DaemonConfig) -> Self {
        Self { config, child: Mutex::new(None), info: Mutex::new(None) }
    }

    pub fn info(&self) -> Option<DaemonSessionInfo> {
        let guard = match self.info.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.info().map(|i| i.status), Some(DaemonStatus::Running))
    }

    /// Locate or install the daemon, spawn it, negotiate a port, and wait
    /// for the readiness banner.
    pub async fn start(&self) -> Result<DaemonSessionInfo, SupervisorError> {
        run_preflight_checks()?;

        let install_dir = self.resolve_installation().await?;

        let mut secret_bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut secret_bytes);
        let hmac_secret = BASE64.encode(secret_bytes);

        let (child, pid, bound_port) = self.spawn_with_port_retry(&install_dir, &hmac_secret).await?;

        let info = DaemonSessionInfo {
            host: self.config.host.clone(),
            port: bound_port,
            hmac_secret,
            pid,
            status: DaemonStatus::Running,
        };

        *self.child.lock().unwrap_or_else(|p| p.into_inner()) = Some(child);
        *self.info.lock().unwrap_or_else(|p| p.into_inner()) = Some(info.clone());

        info!(port = bound_port, pid, "daemon is ready");
        Ok(info)
    }

    /// Graceful stop: terminate, wait up to 5s, then force-kill.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
        let Some(mut child) = guard.take() else {
            return Ok(());
        };
        drop(guard);

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
        }

        let waited = tokio::time::timeout(GRACEFUL_STOP_BUDGET, child.wait()).await;
        if waited.is_err() {
            warn!("daemon did not exit gracefully, force-killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        *self.info.lock().unwrap_or_else(|p| p.into_inner()) = Some(DaemonSessionInfo {
            host: self.config.host.clone(),
            port: 0,
            hmac_secret: String::new(),
            pid: None,
            status: DaemonStatus::Stopped,
        });
        Ok(())
    }

    pub async fn restart(&self) -> Result<DaemonSessionInfo, SupervisorError> {
        self.stop().await?;
        self.start().await
    }

    /// Invoke the readiness probe via the Client.
    pub async fn health_check(&self) -> bool {
        let Some(info) = self.info() else { return false };
        if info.status != DaemonStatus::Running {
            return false;
        }
        let Ok(client) = DaemonClient::new(&info.host, info.port, &info.hmac_secret) else {
            return false;
        };
        client.ready().await.unwrap_or(false)
    }

    async fn resolve_installation(&self) -> Result<PathBuf, SupervisorError> {
        if let Some(path) = &self.config.install_path {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }

        if let Some(home) = dirs::home_dir() {
            let conventional = home.join(".sandbox-agent").join("daemon");
            if conventional.exists() {
                return Ok(conventional);
            }
        }

        if !self.config.install_enabled {
            return Err(SupervisorError::NotInstalled);
        }

        // Installing means fetching source via a configured repository and
        // invoking the daemon's own build recipe; out of scope for this
        // crate's test doubles, so a disabled/incomplete install path
        // surfaces as `NotInstalled` rather than performing a network
        // fetch here.
        Err(SupervisorError::NotInstalled)
    }

    /// Pick a starting port: the configured port, or the first one in the
    /// conventional range that a local bind test finds free. This is only a
    /// starting point — the daemon process itself may still report the port
    /// taken once spawned (a race this bind test cannot close), which is
    /// what `spawn_with_port_retry` retries against.
    async fn negotiate_port(&self) -> Result<u16, SupervisorError> {
        if self.config.port != 0 {
            return Ok(self.config.port);
        }

        for port in PORT_RANGE_START..=PORT_RANGE_END {
            let addr = format!("{}:{port}", self.config.host);
            if let Ok(listener) = TcpListener::bind(&addr).await {
                drop(listener);
                return Ok(port);
            }
        }

        Err(SupervisorError::NoPortAvailable { start: PORT_RANGE_START, end: PORT_RANGE_END })
    }

    /// Spawn the daemon, retrying with an incremented port up to
    /// `MAX_PORT_RETRIES` times whenever the child itself reports the port
    /// was taken (`PORT_IN_USE` on stderr) — the bind test in
    /// `negotiate_port` only rules out the common case; it can't close the
    /// race between that probe and the child's own bind.
    async fn spawn_with_port_retry(
        &self,
        install_dir: &Path,
        hmac_secret: &str,
    ) -> Result<(Child, Option<u32>, u16), SupervisorError> {
        let mut port = self.negotiate_port().await?;

        for attempt in 0..MAX_PORT_RETRIES {
            let run_config_path = write_run_config(install_dir, &self.config, hmac_secret, port)?;

            let mut command = Command::new(install_dir.join("bin").join("daemon"));
            command
                .arg("--config")
                .arg(&run_config_path)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let mut child = command.spawn().map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;
            let pid = child.id();

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| SupervisorError::SpawnFailed("no stdout handle".to_owned()))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| SupervisorError::SpawnFailed("no stderr handle".to_owned()))?;

            match race_readiness(stdout, stderr, port, &self.config).await? {
                SpawnOutcome::Ready(bound_port) => return Ok((child, pid, bound_port)),
                SpawnOutcome::PortInUse => {
                    warn!(port, attempt, "daemon reported PORT_IN_USE, retrying with incremented port");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    port += 1;
                }
            }
        }

        Err(SupervisorError::NoPortAvailable { start: PORT_RANGE_START, end: port })
    }
}

fn run_preflight_checks() -> Result<(), SupervisorError> {
    if !command_exists("git") {
        return Err(SupervisorError::Preflight("source-control tool 'git' not found on PATH".to_owned()));
    }
    #[cfg(target_os = "linux")]
    if !command_exists("cc") && !command_exists("gcc") {
        return Err(SupervisorError::Preflight("no C compiler found on PATH".to_owned()));
    }
    Ok(())
}

fn command_exists(name: &str) -> bool {
    std::process::Command::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

#[derive(Debug, Serialize)]
struct RunConfig<'a> {
    hmac_secret: &'a str,
    host: &'a str,
    port: u16,
    log_level: &'a str,
    completion_timeout_s: f64,
    keep_logfiles: bool,
    use_vim_stdout: bool,
}

fn write_run_config(
    install_dir: &Path,
    config: &DaemonConfig,
    hmac_secret: &str,
    port: u16,
) -> Result<PathBuf, SupervisorError> {
    let run_config = RunConfig {
        hmac_secret,
        host: &config.host,
        port,
        log_level: &config.log_level,
        completion_timeout_s: config.completion_timeout_ms as f64 / 1000.0,
        keep_logfiles: config.keep_logfiles,
        use_vim_stdout: false,
    };
    let serialized =
        serde_json::to_string_pretty(&run_config).map_err(|e| SupervisorError::Preflight(e.to_string()))?;
    let path = install_dir.join("run_config.json");
    std::fs::write(&path, serialized)?;
    Ok(path)
}

/// Race the child's stdout (readiness banner, or a fallback readiness
/// probe every `READINESS_POLL_INTERVAL`) against its stderr (a
/// `PORT_IN_USE` signal) until one side resolves or `STARTUP_BUDGET` runs out.
async fn race_readiness(
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    expected_port: u16,
    config: &DaemonConfig,
) -> Result<SpawnOutcome, SupervisorError> {
    let readiness_patterns: Vec<regex::Regex> =
        READINESS_BANNERS.iter().map(|p| regex::Regex::new(p).expect("static pattern")).collect();
    let port_in_use = regex::Regex::new(PORT_IN_USE_PATTERN).expect("static pattern");

    let deadline = Instant::now() + STARTUP_BUDGET;
    let mut stdout_lines = tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(stdout));
    let mut stderr_lines = tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(stderr));

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SupervisorError::ReadinessTimeout(STARTUP_BUDGET.as_millis() as u64));
        }

        tokio::select! {
            line = stdout_lines.next_line() => {
                if let Ok(Some(line)) = line {
                    for pattern in &readiness_patterns {
                        if let Some(captures) = pattern.captures(&line) {
                            let bound_port = captures
                                .get(1)
                                .and_then(|m| m.as_str().parse().ok())
                                .unwrap_or(expected_port);
                            return Ok(SpawnOutcome::Ready(bound_port));
                        }
                    }
                }
            }
            line = stderr_lines.next_line() => {
                if let Ok(Some(line)) = line {
                    if port_in_use.is_match(&line) {
                        return Ok(SpawnOutcome::PortInUse);
                    }
                }
            }
            _ = tokio::time::sleep(READINESS_POLL_INTERVAL) => {
                if let Ok(client) = DaemonClient::new(&config.host, expected_port, "") {
                    if client.ready().await.unwrap_or(false) {
                        return Ok(SpawnOutcome::Ready(expected_port));
                    }
                }
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_exists_true_for_a_real_binary() {
        assert!(command_exists("git") || command_exists("sh"));
    }

    #[test]
    fn command_exists_false_for_nonsense_binary() {
        assert!(!command_exists("definitely-not-a-real-binary-xyz"));
    }

    #[tokio::test]
    async fn negotiate_port_respects_explicit_port() {
        let mut config = DaemonConfig::default();
        config.port = 9999;
        let supervisor = DaemonSupervisor::new(config);
        assert_eq!(supervisor.negotiate_port().await.unwrap(), 9999);
    }

    #[tokio::test]
    async fn negotiate_port_scans_range_when_auto() {
        let mut config = DaemonConfig::default();
        config.port = 0;
        let supervisor = DaemonSupervisor::new(config);
        let port = supervisor.negotiate_port().await.unwrap();
        assert!((PORT_RANGE_START..=PORT_RANGE_END).contains(&port));
    }

    #[tokio::test]
    async fn race_readiness_reports_port_in_use_from_stderr() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("echo 'ERROR: PORT_IN_USE' 1>&2")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let stderr = child.stderr.take().unwrap();
        let outcome = race_readiness(stdout, stderr, 8080, &DaemonConfig::default()).await.unwrap();
        assert!(matches!(outcome, SpawnOutcome::PortInUse));
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn race_readiness_reports_ready_from_stdout_banner() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("echo 'Server running at http://127.0.0.1:8080'")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let stderr = child.stderr.take().unwrap();
        let outcome = race_readiness(stdout, stderr, 8080, &DaemonConfig::default()).await.unwrap();
        assert!(matches!(outcome, SpawnOutcome::Ready(8080)));
        let _ = child.wait().await;
    }

    #[test]
    fn is_running_false_before_start() {
        let supervisor = DaemonSupervisor::new(DaemonConfig::default());
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn resolve_installation_errs_when_not_found_and_install_disabled() {
        let mut config = DaemonConfig::default();
        config.install_enabled = false;
        config.install_path = Some("/nonexistent/path/xyz".to_owned());
        let supervisor = DaemonSupervisor::new(config);
        let result = supervisor.resolve_installation().await;
        assert!(matches!(result, Err(SupervisorError::NotInstalled)));
    }
}
