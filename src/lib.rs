pub mod bridge;
pub mod config;
pub mod daemon;
pub mod error;
pub mod executor;
pub mod llm;
pub mod policy;
pub mod sandbox;
pub mod tools;
pub mod tracer;

/// Convenience re-exports for the most commonly used traits and types.
///
/// ```rust
/// use agent_sandbox_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::bridge::{Artifact, ArtifactType, HostBridge};
    pub use crate::config::{AppConfig, load_default_config};
    pub use crate::daemon::{DaemonClient, DaemonSessionManager, DaemonSessionInfo, DaemonSupervisor};
    pub use crate::error::{CoreError, Result};
    pub use crate::executor::{ExecutionRequest, ExecutionResult, Executor};
    pub use crate::llm::{CompletionClient, CompletionRequest, CompletionResponse, Message};
    pub use crate::policy::{PolicyEnforcer, ResourceQuotas, SecurityPolicy};
    pub use crate::sandbox::SandboxRuntime;
    pub use crate::tools::{Tool, ToolRegistry, ToolResult};
    pub use crate::tracer::{ExecutionTrace, Tracer};
}
