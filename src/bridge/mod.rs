//! Host Bridge — the curated capability API installed inside the isolate.
//!
//! This is the only surface a sandboxed script can reach: `call_tool`,
//! `llm`, `sleep` (async); `create_artifact`, `get_quota_usage` (sync);
//! `log`/`info`/`warn`/`error` (console). Every argument and return value
//! is deep-copied by value across the boundary; no live host object is
//! ever visible inside the isolate.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::llm::{CompletionClient, CompletionRequest, Message, MessageRole};
use crate::policy::PolicyEnforcer;
use crate::tools::{ToolRegistry, EXECUTOR_TOOL_NAME};
use crate::tracer::{TokenUsage, Tracer, UsageSnapshot};

const MAX_SLEEP_MS: i64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Text,
    Json,
    Csv,
    Html,
    Markdown,
}

/// A named output produced by the script via `create_artifact`. Owned by
/// one run; never shared between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ArtifactType,
    pub content: String,
    pub created_at: chrono::DateTime<Utc>,
}

/// Capability-mediated bridge between the isolate and the host. Fresh per
/// run: tool registry and completion client are shared collaborators, but
/// the tracer, enforcer, artifact list, and console output all belong to
/// exactly one run.
pub struct HostBridge {
    tool_registry: Arc<ToolRegistry>,
    completion_client: Arc<dyn CompletionClient>,
    tracer: Arc<Tracer>,
    enforcer: Arc<PolicyEnforcer>,
    artifacts: Mutex<Vec<Artifact>>,
    console_output: Mutex<Vec<String>>,
}

impl HostBridge {
    pub fn new(
        tool_registry: Arc<ToolRegistry>,
        completion_client: Arc<dyn CompletionClient>,
        tracer: Arc<Tracer>,
        enforcer: Arc<PolicyEnforcer>,
    ) -> Self {
        Self {
            tool_registry,
            completion_client,
            tracer,
            enforcer,
            artifacts: Mutex::new(Vec::new()),
            console_output: Mutex::new(Vec::new()),
        }
    }

    /// A bridge wired to an empty tool registry and a static completion
    /// client, for sandbox-runtime unit tests that do not exercise policy.
    #[cfg(test)]
    pub fn for_test() -> Self {
        Self::new(
            Arc::new(ToolRegistry::new()),
            Arc::new(crate::llm::StaticCompletionClient::new("test")),
            Arc::new(Tracer::new()),
            Arc::new(PolicyEnforcer::new(
                crate::policy::SecurityPolicy::default(),
                crate::policy::ResourceQuotas::default(),
            )),
        )
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        let guard = match self.artifacts.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }

    pub fn console_output(&self) -> Vec<String> {
        let guard = match self.console_output.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }

    /// `call_tool(name, params) -> result`.
    pub async fn call_tool(&self, name: &str, params: Value) -> Result<Value, BridgeError> {
        if name == EXECUTOR_TOOL_NAME {
            self.tracer.emit(
                "tool_call_error",
                serde_json::json!({ "name": name, "message": "nested execution denied" }),
            );
            return Err(BridgeError::NestedExecutionDenied);
        }

        if !self.enforcer.check_tool_call(name) {
            let message = format!("tool '{name}' was denied by policy");
            self.tracer.emit(
                "tool_call_error",
                serde_json::json!({ "name": name, "message": message }),
            );
            return Err(BridgeError::Policy(crate::error::PolicyError::ToolDenied(name.to_owned())));
        }

        self.tracer.emit(
            "tool_call_start",
            serde_json::json!({ "name": name, "params": params.clone() }),
        );

        match self.tool_registry.call(name, params).await {
            Ok(result) if result.success => {
                self.enforcer.record_tool_call();
                self.tracer.emit(
                    "tool_call_success",
                    serde_json::json!({ "name": name, "result": result.output.clone() }),
                );
                Ok(result.output)
            }
            Ok(result) => {
                self.enforcer.record_tool_call();
                let message = result.output.as_str().unwrap_or("tool reported failure").to_owned();
                self.tracer.emit(
                    "tool_call_error",
                    serde_json::json!({ "name": name, "message": message }),
                );
                Err(BridgeError::ToolCallFailed(message))
            }
            Err(message) => {
                self.tracer.emit(
                    "tool_call_error",
                    serde_json::json!({ "name": name, "message": message }),
                );
                Err(BridgeError::ToolCallFailed(message))
            }
        }
    }

    /// `llm(messages, options) -> completion`.
    pub async fn llm(&self, messages: Value, options: Value) -> Result<Value, BridgeError> {
        let parsed_messages: Vec<Message> =
            serde_json::from_value(messages.clone()).unwrap_or_default();
        let estimate = estimate_tokens(&parsed_messages);

        if !self.enforcer.check_token_usage(estimate) {
            let message = "token quota would be exceeded".to_owned();
            self.tracer.emit("llm_call_error", serde_json::json!({ "message": message }));
            return Err(BridgeError::Policy(crate::error::PolicyError::QuotaExceeded(message)));
        }

        self.tracer.emit(
            "llm_call_start",
            serde_json::json!({ "messages": messages, "options": options, "estimated_tokens": estimate }),
        );
        self.enforcer.record_tokens(estimate);

        let model = options
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_owned();
        let provider_hint = options.get("provider_hint").and_then(Value::as_str).unwrap_or("default");
        let request = CompletionRequest::new(model, parsed_messages);

        let response = self
            .completion_client
            .create_completion(provider_hint, request)
            .await
            .map_err(BridgeError::CompletionFailed)?;

        if !self.enforcer.check_cost(response.usd_cost) {
            let message = "cost quota would be exceeded".to_owned();
            self.tracer.emit("llm_call_error", serde_json::json!({ "message": message }));
            return Err(BridgeError::Policy(crate::error::PolicyError::QuotaExceeded(message)));
        }

        let usage = TokenUsage {
            prompt: response.usage.prompt_tokens,
            completion: response.usage.completion_tokens,
            total: response.usage.total_tokens,
        };
        self.tracer.emit(
            "llm_call_success",
            serde_json::json!({ "usage": usage, "usd_cost": response.usd_cost }),
        );
        // The trace's token_usage tracks actual usage only; the estimate used
        // for quota-checking above never itself lands in the trace.
        self.tracer.reconcile_tokens(usage);
        self.enforcer.record_cost(response.usd_cost);
        self.tracer.record_cost(response.usd_cost);

        Ok(serde_json::to_value(&response).unwrap_or(Value::Null))
    }

    /// `sleep(ms)`; must be within `0..=2000`.
    pub async fn sleep(&self, ms: i64) -> Result<(), BridgeError> {
        if !(0..=MAX_SLEEP_MS).contains(&ms) {
            return Err(BridgeError::InvalidSleepDuration(ms as u64));
        }
        tokio::time::sleep(std::time::Duration::from_millis(ms as u64)).await;
        Ok(())
    }

    /// `create_artifact(name, content, type) -> artifact`.
    pub fn create_artifact_sync(&self, args: Value) -> Result<Value, BridgeError> {
        let name = args.get("name").and_then(Value::as_str).unwrap_or("artifact").to_owned();
        let content = args.get("content").and_then(Value::as_str).unwrap_or_default().to_owned();
        let kind = match args.get("type").and_then(Value::as_str) {
            Some("json") => ArtifactType::Json,
            Some("csv") => ArtifactType::Csv,
            Some("html") => ArtifactType::Html,
            Some("markdown") => ArtifactType::Markdown,
            _ => ArtifactType::Text,
        };
        let artifact = Artifact {
            id: Uuid::new_v4().to_string(),
            name,
            kind,
            content,
            created_at: Utc::now(),
        };
        let mut guard = match self.artifacts.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(artifact.clone());
        serde_json::to_value(&artifact).map_err(BridgeError::Marshalling)
    }

    /// `get_quota_usage() -> usage`.
    pub fn quota_usage(&self) -> UsageSnapshot {
        self.enforcer.current_usage()
    }

    /// `log / info / warn / error`: captures a joined string payload into
    /// the run's console output and emits a matching trace event.
    pub fn console(&self, level: &str, payload: Value) {
        let text = join_payload(&payload);
        let mut guard = match self.console_output.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(format!("[{level}] {text}"));
        drop(guard);
        self.tracer.emit(&format!("console_{level}"), serde_json::json!({ "message": text }));
    }
}

fn join_payload(payload: &Value) -> String {
    match payload {
        Value::Array(items) => items
            .iter()
            .map(value_to_display)
            .collect::<Vec<_>>()
            .join(" "),
        other => value_to_display(other),
    }
}

fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Estimate tokens as `ceil(sum(len(content)) / 4)` across all string
/// message content.
fn estimate_tokens(messages: &[Message]) -> u64 {
    let total_chars: u64 = messages.iter().map(|m| m.content.len() as u64).sum();
    total_chars.div_ceil(4)
}

impl From<MessageRole> for &'static str {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StaticCompletionClient;
    use crate::policy::{PolicyEnforcer, ResourceQuotas, SecurityPolicy};
    use crate::tools::example_registry;

    fn bridge() -> HostBridge {
        HostBridge::new(
            Arc::new(example_registry()),
            Arc::new(StaticCompletionClient::new("ok")),
            Arc::new(Tracer::new()),
            Arc::new(PolicyEnforcer::new(SecurityPolicy::default(), ResourceQuotas::default())),
        )
    }

    #[tokio::test]
    async fn call_tool_dispatches_and_records() {
        let b = bridge();
        let result = b.call_tool("echo", serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(result["x"], 1);
        assert_eq!(b.quota_usage().tool_calls, 1);
    }

    #[tokio::test]
    async fn call_tool_denies_nested_execution() {
        let b = bridge();
        let result = b.call_tool(EXECUTOR_TOOL_NAME, Value::Null).await;
        assert!(matches!(result, Err(BridgeError::NestedExecutionDenied)));
    }

    #[tokio::test]
    async fn call_tool_denies_denied_tool() {
        let mut policy = SecurityPolicy::default();
        policy.deny_list.insert("echo".to_owned());
        let b = HostBridge::new(
            Arc::new(example_registry()),
            Arc::new(StaticCompletionClient::new("ok")),
            Arc::new(Tracer::new()),
            Arc::new(PolicyEnforcer::new(policy, ResourceQuotas::default())),
        );
        let result = b.call_tool("echo", Value::Null).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn llm_estimates_and_reconciles_tokens() {
        let b = bridge();
        let messages = serde_json::json!([{"role": "user", "content": "hello world"}]);
        let result = b.llm(messages, Value::Null).await.unwrap();
        assert!(result["usage"]["total_tokens"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn sleep_rejects_out_of_bounds() {
        let b = bridge();
        assert!(b.sleep(-1).await.is_err());
        assert!(b.sleep(3000).await.is_err());
        assert!(b.sleep(10).await.is_ok());
    }

    #[test]
    fn create_artifact_appends_and_returns() {
        let b = bridge();
        let args = serde_json::json!({"name": "report", "content": "hi", "type": "text"});
        let result = b.create_artifact_sync(args).unwrap();
        assert_eq!(result["name"], "report");
        assert_eq!(b.artifacts().len(), 1);
    }

    #[test]
    fn console_joins_array_payload_and_records_output() {
        let b = bridge();
        b.console("log", serde_json::json!(["a", "b", 1]));
        let output = b.console_output();
        assert_eq!(output.len(), 1);
        assert!(output[0].contains("a b 1"));
    }
}
