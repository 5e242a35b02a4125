//! Headless CLI: run a script against the sandbox, or drive the daemon
//! supervisor/session manager.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use agent_sandbox_core::config::{load_default_config, AppConfig};
use agent_sandbox_core::daemon::DaemonSessionManager;
use agent_sandbox_core::executor::{ExecutionRequest, Executor};
use agent_sandbox_core::llm::StaticCompletionClient;
use agent_sandbox_core::policy::{ResourceQuotas, SecurityPolicy};
use agent_sandbox_core::sandbox::SandboxRuntime;
use agent_sandbox_core::tools::example_registry;

#[derive(Parser)]
#[command(name = "agent-sandbox", version, about = "Sandboxed script execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a WAT script file through the sandbox and print the execution result as JSON.
    Run {
        script_file: PathBuf,
        #[arg(long)]
        max_wall_ms: Option<u64>,
        #[arg(long)]
        max_memory_mb: Option<u64>,
    },
    /// Control the language-intelligence daemon.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    Start,
    Stop,
    Status,
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_env("SANDBOX_AGENT_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.daemon.log_level.clone()));
    fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_default_config();
    init_logging(&config);

    let cli = Cli::parse();

    match cli.command {
        Command::Run { script_file, max_wall_ms, max_memory_mb } => {
            let script = std::fs::read_to_string(&script_file)?;

            let mut quotas = ResourceQuotas::from(&config.executor);
            if let Some(ms) = max_wall_ms {
                quotas.max_wall_ms = ms;
            }
            if let Some(mb) = max_memory_mb {
                quotas.max_memory_mb = mb;
            }
            let policy = SecurityPolicy::from(&config.executor.policy);

            let executor = Executor::new(
                Arc::new(example_registry()),
                Arc::new(StaticCompletionClient::new("stub completion")),
                Arc::new(SandboxRuntime::new()?),
            )
            .with_defaults(quotas, policy);

            let request = ExecutionRequest::new(script);
            let result = executor.execute(request).await;

            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }

        Command::Daemon { action } => {
            let manager = DaemonSessionManager::global();
            match action {
                DaemonAction::Start => {
                    let info = manager.start().await?;
                    println!("{}", serde_json::to_string_pretty(&info)?);
                }
                DaemonAction::Stop => {
                    manager.stop().await?;
                    println!("daemon stopped");
                }
                DaemonAction::Status => {
                    let running = manager.is_running().await;
                    println!("{{\"running\": {running}}}");
                }
            }
        }
    }

    Ok(())
}
