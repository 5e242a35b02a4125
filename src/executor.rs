//! Executor — orchestrates the Tracer, Policy Enforcer, Host Bridge, and
//! Sandbox Runtime for a single script run and composes the final
//! `ExecutionResult`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::bridge::{Artifact, HostBridge};
use crate::llm::CompletionClient;
use crate::policy::{
    validate_script, PolicyEnforcer, PolicyViolation, ResourceQuotaOverrides, ResourceQuotas,
    SecurityPolicy, SecurityPolicyOverrides,
};
use crate::sandbox::SandboxRuntime;
use crate::tools::ToolRegistry;
use crate::tracer::{ExecutionTrace, Tracer};

/// Immutable bundle describing a single run; consumed once by the
/// Executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub script: String,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub quota_overrides: ResourceQuotaOverrides,
    #[serde(default)]
    pub policy_overrides: SecurityPolicyOverrides,
}

impl ExecutionRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            context: None,
            quota_overrides: ResourceQuotaOverrides::default(),
            policy_overrides: SecurityPolicyOverrides::default(),
        }
    }
}

/// The full outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub error: Option<String>,
    pub result: Value,
    pub trace: ExecutionTrace,
    pub artifacts: Vec<Artifact>,
    pub console_output: Vec<String>,
    pub violations: Vec<PolicyViolation>,
}

/// Orchestrates a single run end to end.
pub struct Executor {
    tool_registry: Arc<ToolRegistry>,
    completion_client: Arc<dyn CompletionClient>,
    sandbox: Arc<SandboxRuntime>,
    default_quotas: ResourceQuotas,
    default_policy: SecurityPolicy,
}

impl Executor {
    pub fn new(
        tool_registry: Arc<ToolRegistry>,
        completion_client: Arc<dyn CompletionClient>,
        sandbox: Arc<SandboxRuntime>,
    ) -> Self {
        Self {
            tool_registry,
            completion_client,
            sandbox,
            default_quotas: ResourceQuotas::default(),
            default_policy: SecurityPolicy::default(),
        }
    }

    pub fn with_defaults(mut self, quotas: ResourceQuotas, policy: SecurityPolicy) -> Self {
        self.default_quotas = quotas;
        self.default_policy = policy;
        self
    }

    /// Execute `request` end to end. Never propagates an error: any fault
    /// below the Executor is captured into a failed `ExecutionResult` with
    /// the trace intact.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let quotas = self.default_quotas.merge(&request.quota_overrides);
        let policy = self.default_policy.clone().merge(&request.policy_overrides);

        let tracer = Arc::new(Tracer::new());
        let enforcer = Arc::new(PolicyEnforcer::new(policy.clone(), quotas));

        tracer.emit(
            "execution_start",
            serde_json::json!({
                "script_length": request.script.len(),
                "quotas": quotas_summary(&quotas),
                "policy": policy_summary(&policy),
            }),
        );

        let validation = validate_script(&request.script, &policy);
        if !validation.valid {
            let message = validation
                .issues
                .iter()
                .map(|i| i.description.clone())
                .collect::<Vec<_>>()
                .join("; ");
            enforcer.record_script_validation_failure(message.clone());
            tracer.emit("script_validation_failed", serde_json::json!({ "issues": message }));
            error!(issues = %message, "script failed static validation");
            return self.compose_result(
                &tracer,
                None,
                Vec::new(),
                Vec::new(),
                Some(message),
                enforcer.violations(),
            );
        }

        let bridge = Arc::new(HostBridge::new(
            self.tool_registry.clone(),
            self.completion_client.clone(),
            tracer.clone(),
            enforcer.clone(),
        ));

        let run_outcome = self.sandbox.run(&request.script, bridge.clone(), &quotas, &tracer).await;

        match run_outcome {
            Ok(result) => {
                tracer.emit("execution_complete", serde_json::json!({ "usage": tracer.current_usage() }));
                info!("execution complete");
                self.compose_result(
                    &tracer,
                    Some(result),
                    bridge.artifacts(),
                    bridge.console_output(),
                    None,
                    enforcer.violations(),
                )
            }
            Err(fault) => {
                let message = fault.to_string();
                tracer.emit("execution_error", serde_json::json!({ "message": message }));
                error!(error = %message, "execution failed");
                self.compose_result(
                    &tracer,
                    None,
                    bridge.artifacts(),
                    bridge.console_output(),
                    Some(message),
                    enforcer.violations(),
                )
            }
        }
    }

    fn compose_result(
        &self,
        tracer: &Tracer,
        result: Option<Value>,
        artifacts: Vec<Artifact>,
        console_output: Vec<String>,
        forced_error: Option<String>,
        violations: Vec<PolicyViolation>,
    ) -> ExecutionResult {
        let trace = tracer.trace(forced_error.clone());
        ExecutionResult {
            success: trace.success,
            error: forced_error,
            result: result.unwrap_or(Value::Null),
            trace,
            artifacts,
            console_output,
            violations,
        }
    }
}

fn quotas_summary(quotas: &ResourceQuotas) -> Value {
    serde_json::to_value(quotas).unwrap_or(Value::Null)
}

fn policy_summary(policy: &SecurityPolicy) -> Value {
    serde_json::json!({
        "allow_list_size": policy.allow_list.len(),
        "deny_list_size": policy.deny_list.len(),
        "max_script_length": policy.max_script_length,
        "allow_network": policy.allow_network,
        "allow_filesystem": policy.allow_filesystem,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
