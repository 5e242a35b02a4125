//! In-memory tool catalog.
//!
//! This is explanatory scaffolding, not the production tool catalog — the
//! real catalog is an external collaborator referenced only by interface.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::traits::{Tool, ToolResult};

/// Name reserved for the executor itself; `call_tool` must refuse to
/// dispatch to it so a script cannot recursively spawn another run.
pub const EXECUTOR_TOOL_NAME: &str = "executeScript";

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Dispatch a call to the named tool. Returns `Err` if the tool is
    /// unknown; `call_tool` in the Host Bridge handles the reserved-name
    /// and policy checks before reaching this point.
    pub async fn call(&self, name: &str, params: Value) -> Result<ToolResult, String> {
        match self.get(name) {
            Some(tool) => Ok(tool.execute(params).await),
            None => Err(format!("unknown tool: {name}")),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Example tools ────────────────────────────────────────────────────────────

/// Echoes its input back unchanged. Harmless by construction; used in
/// examples and tests.
pub struct EchoTool;

#[async_trait::async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Returns the given params unchanged."
    }

    async fn execute(&self, params: Value) -> ToolResult {
        ToolResult::ok(params)
    }
}

/// Returns a fixed, non-sensitive fact about the host environment. Does
/// not read real environment variables — scripts never get ambient
/// authority, not even read-only access to process env.
pub struct ReadEnvFactTool;

#[async_trait::async_trait]
impl Tool for ReadEnvFactTool {
    fn name(&self) -> &str {
        "read_env_fact"
    }

    fn description(&self) -> &str {
        "Returns a fixed, non-sensitive fact; does not read real process environment variables."
    }

    async fn execute(&self, _params: Value) -> ToolResult {
        ToolResult::ok(serde_json::json!({ "fact": "sandboxed scripts have no ambient environment access" }))
    }
}

/// Build a registry pre-populated with the harmless example tools.
pub fn example_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EchoTool));
    registry.register(Arc::new(ReadEnvFactTool));
    registry
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyTool;

    #[async_trait::async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            "dummy"
        }
        fn description(&self) -> &str {
            "a dummy tool"
        }
        async fn execute(&self, params: Value) -> ToolResult {
            ToolResult::ok(params)
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool));
        assert!(registry.get("dummy").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn overwrite_replaces_existing() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool));
        registry.register(Arc::new(DummyTool));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn call_dispatches_to_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DummyTool));
        let result = registry.call("dummy", serde_json::json!({"x": 1})).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["x"], 1);
    }

    #[tokio::test]
    async fn call_unknown_tool_errs() {
        let registry = ToolRegistry::new();
        let result = registry.call("nope", Value::Null).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn echo_tool_returns_input() {
        let registry = example_registry();
        let result = registry.call("echo", serde_json::json!({"a": 1})).await.unwrap();
        assert_eq!(result.output["a"], 1);
    }
}
