//! Error types for every subsystem, rolling up into a single [`CoreError`].

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the policy enforcer: static validation and per-call gating.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("script exceeds max_script_length ({actual} > {limit})")]
    ScriptTooLong { actual: usize, limit: usize },

    #[error("script failed static validation: {0}")]
    ScriptValidationFailed(String),

    #[error("tool '{0}' is denied by policy")]
    ToolDenied(String),

    #[error("tool '{0}' is not in the allow list")]
    ToolNotAllowed(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
}

/// Errors raised by the sandbox runtime while compiling or running a script.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to compile script: {0}")]
    CompileError(String),

    #[error("failed to instantiate isolate: {0}")]
    InstantiationError(String),

    #[error("script execution failed: {0}")]
    ExecutionError(String),

    #[error("execution exceeded wall-clock ceiling of {0}ms")]
    TimedOut(u64),

    #[error("execution exceeded memory ceiling of {0}MB")]
    OutOfMemory(u64),

    #[error("isolate I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the host bridge while marshalling a capability call.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("nested execution of the executor tool is not permitted")]
    NestedExecutionDenied,

    #[error("sleep duration {0}ms is out of bounds (0..=2000)")]
    InvalidSleepDuration(u64),

    #[error("tool call failed: {0}")]
    ToolCallFailed(String),

    #[error("completion request failed: {0}")]
    CompletionFailed(String),

    #[error("value marshalling error: {0}")]
    Marshalling(#[from] serde_json::Error),
}

/// Errors raised by the daemon client while talking to the language-intelligence daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("daemon returned status {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("HMAC signing error: {0}")]
    Hmac(String),
}

/// Errors raised by the daemon supervisor while installing, spawning, or
/// health-checking the daemon process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("preflight check failed: {0}")]
    Preflight(String),

    #[error("daemon installation not found and install is disabled")]
    NotInstalled,

    #[error("failed to spawn daemon process: {0}")]
    SpawnFailed(String),

    #[error("no free port found in range {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("daemon did not become ready within {0}ms")]
    ReadinessTimeout(u64),

    #[error("daemon process exited unexpectedly: {0}")]
    ProcessExited(String),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the executor while orchestrating a single run.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Top-level error taxonomy: `PolicyViolation | SandboxFault | HostCallError |
/// ProtocolError | TransportError | SupervisorError`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("policy violation: {0}")]
    PolicyViolation(#[from] PolicyError),

    #[error("sandbox fault: {0}")]
    SandboxFault(#[from] SandboxError),

    #[error("host call error: {0}")]
    HostCallError(#[from] BridgeError),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("transport error: {0}")]
    TransportError(DaemonError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// `DaemonError::Protocol`/`BadStatus` (HMAC rejection, malformed response,
/// non-2xx status) surface as `ProtocolError`; everything else (connection
/// failure, timeout, local HMAC signing fault) surfaces as `TransportError`.
impl From<DaemonError> for CoreError {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::Protocol(message) => CoreError::ProtocolError(message),
            DaemonError::BadStatus { status, body } => {
                CoreError::ProtocolError(format!("daemon returned status {status}: {body}"))
            }
            other => CoreError::TransportError(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_shaped_daemon_errors_become_protocol_error() {
        let err: CoreError = DaemonError::Protocol("malformed response".to_owned()).into();
        assert!(matches!(err, CoreError::ProtocolError(_)));

        let err: CoreError = DaemonError::BadStatus { status: 401, body: "denied".to_owned() }.into();
        assert!(matches!(err, CoreError::ProtocolError(_)));
    }

    #[test]
    fn transport_shaped_daemon_errors_stay_transport_error() {
        let err: CoreError = DaemonError::Transport("connection refused".to_owned()).into();
        assert!(matches!(err, CoreError::TransportError(_)));

        let err: CoreError = DaemonError::Timeout(5_000).into();
        assert!(matches!(err, CoreError::TransportError(_)));
    }
}
