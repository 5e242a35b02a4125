//! The tool-registry interface named in the external interfaces section:
//! `call_tool(tool_call) -> result`.

use async_trait::async_trait;
use serde_json::Value;

/// The outcome of a single tool invocation.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub output: Value,
    pub success: bool,
}

impl ToolResult {
    pub fn ok(output: Value) -> Self {
        Self { output, success: true }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { output: Value::String(message.into()), success: false }
    }
}

/// A single callable tool exposed to sandboxed scripts via the Host Bridge.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn execute(&self, params: Value) -> ToolResult;
}
