//! Tool registry and concurrent execution.
//!
//! Tools are registered under their wire name together with the definition
//! advertised to the model. A batch of requested calls runs concurrently;
//! results come back in the order the calls were requested regardless of
//! completion order, and a failed call never sinks its batch: the failure is
//! captured in that call's outcome.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tracing::debug;

use crate::api::{ChatToolCall, ChatToolDefinition};
use crate::core::tool_calls::{apply_schema_defaults, parse_tool_arguments};
use crate::mcp::McpClient;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<String, String>;
}

/// Runs a remote MCP tool. The client is shared with every other handler for
/// the same server.
pub struct McpToolHandler {
    client: McpClient,
    tool_name: String,
}

impl McpToolHandler {
    pub fn new(client: McpClient, tool_name: impl Into<String>) -> Self {
        Self {
            client,
            tool_name: tool_name.into(),
        }
    }
}

#[async_trait]
impl ToolHandler for McpToolHandler {
    async fn call(&self, arguments: Value) -> Result<String, String> {
        self.client.call_tool(&self.tool_name, arguments).await
    }
}

/// Outcome of one tool call. `content` is what travels back to the model as
/// the tool message; execution failures land in `error` with an error string
/// as content so the model can react to the failure.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call: ChatToolCall,
    pub arguments: Value,
    pub content: String,
    pub error: Option<String>,
}

pub type ToolObserver = Arc<dyn Fn(&ToolOutcome) + Send + Sync>;

#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    definitions: Vec<ChatToolDefinition>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: ChatToolDefinition, handler: Arc<dyn ToolHandler>) {
        let name = definition.name().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            debug!(tool = %name, "Replacing existing tool registration");
            self.definitions
                .retain(|existing| existing.name() != name);
        }
        self.definitions.push(definition);
    }

    /// Register every tool a connected MCP server advertises.
    pub fn register_mcp_server(&mut self, client: &McpClient, tools: Vec<ChatToolDefinition>) {
        for definition in tools {
            let handler = McpToolHandler::new(client.clone(), definition.name());
            self.register(definition, Arc::new(handler));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn definitions(&self) -> &[ChatToolDefinition] {
        &self.definitions
    }

    fn schema_for(&self, name: &str) -> Option<&Value> {
        self.definitions
            .iter()
            .find(|definition| definition.name() == name)
            .map(|definition| &definition.function.parameters)
    }

    /// Parse and default-fill the arguments the model produced for `call`.
    pub fn prepare_arguments(&self, call: &ChatToolCall) -> Value {
        let mut arguments = parse_tool_arguments(&call.function.arguments);
        if let Some(schema) = self.schema_for(&call.function.name) {
            apply_schema_defaults(&mut arguments, schema);
        }
        arguments
    }

    /// Execute a batch of calls concurrently. Outcomes are returned in call
    /// order; the observer fires once per completed call.
    pub async fn execute(
        &self,
        calls: &[ChatToolCall],
        observer: Option<&ToolObserver>,
    ) -> Vec<ToolOutcome> {
        let futures = calls.iter().map(|call| self.execute_one(call));
        let outcomes = join_all(futures).await;
        if let Some(observer) = observer {
            for outcome in &outcomes {
                observer(outcome);
            }
        }
        outcomes
    }

    async fn execute_one(&self, call: &ChatToolCall) -> ToolOutcome {
        let arguments = self.prepare_arguments(call);
        let result = match self.handlers.get(&call.function.name) {
            Some(handler) => {
                debug!(tool = %call.function.name, id = %call.id, "Executing tool call");
                handler.call(arguments.clone()).await
            }
            None => Err(format!("Unknown tool: {}", call.function.name)),
        };
        match result {
            Ok(content) => ToolOutcome {
                call: call.clone(),
                arguments,
                content,
                error: None,
            },
            Err(error) => ToolOutcome {
                call: call.clone(),
                arguments,
                content: format!("Error: {error}"),
                error: Some(error),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ChatToolCallFunction;

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn call(&self, arguments: Value) -> Result<String, String> {
            Ok(arguments.to_string())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl ToolHandler for FailingHandler {
        async fn call(&self, _arguments: Value) -> Result<String, String> {
            Err("backend unavailable".to_string())
        }
    }

    struct SlowAdder;

    #[async_trait]
    impl ToolHandler for SlowAdder {
        async fn call(&self, arguments: Value) -> Result<String, String> {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let a = arguments["a"].as_f64().unwrap_or(0.0);
            let b = arguments["b"].as_f64().unwrap_or(0.0);
            Ok(serde_json::json!({"result": a + b}).to_string())
        }
    }

    fn call(id: &str, name: &str, arguments: &str) -> ChatToolCall {
        ChatToolCall {
            id: id.to_string(),
            kind: "function".to_string(),
            function: ChatToolCallFunction {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    fn number_schema() -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "a": {"type": "number", "default": 10.0},
                "b": {"type": "number", "default": 5.0}
            }
        })
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(
            ChatToolDefinition::function("add_numbers", Some("Add two numbers".to_string()), number_schema()),
            Arc::new(SlowAdder),
        );
        registry.register(
            ChatToolDefinition::function("echo", None, serde_json::json!({"type": "object", "properties": {}})),
            Arc::new(EchoHandler),
        );
        registry.register(
            ChatToolDefinition::function("broken", None, serde_json::json!({"type": "object", "properties": {}})),
            Arc::new(FailingHandler),
        );
        registry
    }

    #[tokio::test]
    async fn outcomes_keep_call_order_despite_completion_order() {
        let registry = registry();
        let calls = vec![
            call("call_1", "add_numbers", r#"{"a": 2, "b": 3}"#),
            call("call_2", "echo", r#"{"x": 1}"#),
        ];
        let outcomes = registry.execute(&calls, None).await;
        assert_eq!(outcomes[0].call.id, "call_1");
        assert_eq!(outcomes[1].call.id, "call_2");
        assert!(outcomes[0].content.contains("\"result\":5"));
    }

    #[tokio::test]
    async fn failures_are_captured_without_sinking_the_batch() {
        let registry = registry();
        let calls = vec![
            call("call_1", "broken", "{}"),
            call("call_2", "echo", r#"{"ok": true}"#),
        ];
        let outcomes = registry.execute(&calls, None).await;
        assert_eq!(outcomes[0].error.as_deref(), Some("backend unavailable"));
        assert_eq!(outcomes[0].content, "Error: backend unavailable");
        assert!(outcomes[1].error.is_none());
    }

    #[tokio::test]
    async fn unknown_tools_produce_error_outcomes() {
        let registry = registry();
        let outcomes = registry.execute(&[call("call_1", "missing", "{}")], None).await;
        assert_eq!(outcomes[0].error.as_deref(), Some("Unknown tool: missing"));
    }

    #[tokio::test]
    async fn schema_defaults_fill_missing_arguments() {
        let registry = registry();
        let prepared = registry.prepare_arguments(&call("call_1", "add_numbers", r#"{"a": 2}"#));
        assert_eq!(prepared["a"], 2);
        assert_eq!(prepared["b"], 5.0);
    }

    #[tokio::test]
    async fn unparseable_arguments_fall_back_to_raw() {
        let registry = registry();
        let prepared = registry.prepare_arguments(&call("call_1", "echo", "{not json"));
        assert_eq!(prepared["_raw"], "{not json");
    }

    #[tokio::test]
    async fn observer_sees_every_outcome() {
        let registry = registry();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let observer: ToolObserver = Arc::new(move |outcome: &ToolOutcome| {
            seen_clone
                .lock()
                .expect("lock")
                .push(outcome.call.function.name.clone());
        });
        let calls = vec![
            call("call_1", "echo", "{}"),
            call("call_2", "broken", "{}"),
        ];
        registry.execute(&calls, Some(&observer)).await;
        assert_eq!(*seen.lock().expect("lock"), vec!["echo", "broken"]);
    }
}
