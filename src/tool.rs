//! Tool trait, registry, and call/outcome types.
//!
//! A [`Tool`] is an async handler that receives parsed JSON arguments and
//! returns its raw output string. [`ToolRegistry`] resolves the name in a
//! [`ToolCall`] to its handler.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::CallContext;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One invocation requested by the model. Position in the batch defines the
/// index used to reassemble results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON text of the arguments; empty means no arguments.
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// Successful result of one call in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub index: usize,
    pub call_id: String,
    pub name: String,
    pub output: String,
    pub duration: Duration,
}

impl ToolOutcome {
    /// Render as a `tool` role message for the conversation history.
    pub fn to_message(&self) -> ToolMessage {
        ToolMessage {
            role: "tool".to_string(),
            tool_call_id: self.call_id.clone(),
            name: self.name.clone(),
            content: self.output.clone(),
        }
    }
}

/// Chat message carrying a tool's output back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolMessage {
    pub role: String,
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
}

/// Metadata describing a tool for discovery by providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Core trait every tool must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name of the tool.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema describing accepted parameters.
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    /// Execute the tool. `ctx` carries the per-call deadline; handlers that
    /// watch it can stop early, others are simply abandoned on timeout.
    async fn execute(&self, ctx: CallContext, args: serde_json::Value) -> anyhow::Result<String>;

    /// Build a [`ToolSpec`] from this tool's metadata.
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

// ---------------------------------------------------------------------------
// FnTool
// ---------------------------------------------------------------------------

type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>>;
type Handler = dyn Fn(CallContext, serde_json::Value) -> BoxFuture + Send + Sync;

/// Adapts an async closure into a [`Tool`].
pub struct FnTool {
    name: String,
    description: String,
    schema: serde_json::Value,
    handler: Box<Handler>,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema: serde_json::json!({ "type": "object" }),
            handler: Box::new(move |ctx: CallContext, args: serde_json::Value| -> BoxFuture {
                Box::pin(f(ctx, args))
            }),
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = schema;
        self
    }
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    async fn execute(&self, ctx: CallContext, args: serde_json::Value) -> anyhow::Result<String> {
        (self.handler)(ctx, args).await
    }
}

// ---------------------------------------------------------------------------
// EchoTool
// ---------------------------------------------------------------------------

/// A tool that echoes its input back. Useful for smoke testing the
/// execution pipeline.
#[derive(Debug, Clone, Default)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes the provided input back as output"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "input": {
                    "type": "string",
                    "description": "Text to echo back"
                }
            },
            "required": ["input"]
        })
    }

    async fn execute(&self, _ctx: CallContext, args: serde_json::Value) -> anyhow::Result<String> {
        Ok(args
            .get("input")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string())
    }
}

// ---------------------------------------------------------------------------
// ToolRegistry
// ---------------------------------------------------------------------------

/// Holds the registered tools, in registration order, with lookup by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.tools.iter().map(|t| t.name()).collect();
        f.debug_struct("ToolRegistry")
            .field("tools", &names)
            .finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name replaces the earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        match self.by_name.get(&name) {
            Some(&idx) => self.tools[idx] = tool,
            None => {
                self.by_name.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(Arc::new(tool));
        self
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.by_name.get(name).map(|&idx| Arc::clone(&self.tools[idx]))
    }

    /// List all registered tool specs.
    pub fn list(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns true if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_tool_echoes_input() {
        let output = EchoTool
            .execute(CallContext::background(), serde_json::json!({"input": "hello world"}))
            .await
            .unwrap();
        assert_eq!(output, "hello world");
    }

    #[tokio::test]
    async fn echo_tool_handles_missing_input() {
        let output = EchoTool
            .execute(CallContext::background(), serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(output, "");
    }

    #[tokio::test]
    async fn fn_tool_runs_closure() {
        let tool = FnTool::new("upper", "Uppercases text", |_ctx, args| async move {
            let text = args["text"].as_str().unwrap_or_default();
            Ok(text.to_uppercase())
        });
        let out = tool
            .execute(CallContext::background(), serde_json::json!({"text": "abc"}))
            .await
            .unwrap();
        assert_eq!(out, "ABC");
        assert_eq!(tool.spec().name, "upper");
    }

    #[test]
    fn registry_register_and_get() {
        let registry = ToolRegistry::new().with(EchoTool);
        assert_eq!(registry.len(), 1);
        let found = registry.get("echo").expect("echo registered");
        assert_eq!(found.name(), "echo");
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn registry_replaces_same_name() {
        let registry = ToolRegistry::new()
            .with(EchoTool)
            .with(FnTool::new("echo", "shadow", |_ctx, _args| async { Ok(String::new()) }));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("echo").unwrap().description(), "shadow");
    }

    #[test]
    fn registry_list_tools_in_order() {
        let registry = ToolRegistry::new()
            .with(EchoTool)
            .with(FnTool::new("noop", "Does nothing", |_ctx, _args| async { Ok(String::new()) }));
        let names: Vec<String> = registry.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["echo", "noop"]);
    }

    #[test]
    fn outcome_renders_tool_message() {
        let outcome = ToolOutcome {
            index: 0,
            call_id: "call_1".to_string(),
            name: "echo".to_string(),
            output: "hi".to_string(),
            duration: Duration::from_millis(3),
        };
        let msg = outcome.to_message();
        assert_eq!(msg.role, "tool");
        assert_eq!(msg.tool_call_id, "call_1");
        assert_eq!(msg.content, "hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["tool_call_id"], "call_1");
    }
}
