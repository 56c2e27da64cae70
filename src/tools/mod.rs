//! 工具模块：可调用工具的抽象、注册表与内置工具。
//!
//! # Tools
//!
//! A [`Tool`] validates loosely typed JSON arguments and returns a JSON
//! payload. The [`ToolRegistry`] turns every failure into an `isError`
//! result so a bad call never takes the server down.
//!
//! ## Built-in Tools
//!
//! | Tool | Description |
//! |------|-------------|
//! | [`ApiIntegrationTool`] | Outbound HTTP call through the dispatcher |
//! | [`DatabaseQueryTool`] | Read-only SQL against the durable cache store |
//! | [`CacheStatusTool`] | Cache, limiter and dispatch statistics |

mod api;
mod query;
mod status;

pub use api::ApiIntegrationTool;
pub use query::{DatabaseQueryTool, QueryArgs, DEFAULT_QUERY_LIMIT};
pub use status::CacheStatusTool;

use crate::mcp::{McpTool, McpToolResult};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// JSON payload of a completed tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub value: Value,
    /// The tool ran but the operation it performed failed.
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(value: Value) -> Self {
        Self {
            value,
            is_error: false,
        }
    }

    pub fn failed(value: Value) -> Self {
        Self {
            value,
            is_error: true,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> McpTool;

    /// Validate `arguments` and run. Errors become `isError` results.
    async fn call(&self, arguments: Value) -> Result<ToolOutput>;
}

/// JSON Schema for `T` as a plain value.
pub(crate) fn input_schema<T: schemars::JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its advertised name, replacing any previous one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        let name = tool.definition().name;
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "replaced previously registered tool");
        }
        self
    }

    pub fn definitions(&self) -> Vec<McpTool> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// `None` when no tool has that name.
    pub async fn call(&self, name: &str, arguments: Value) -> Option<McpToolResult> {
        let tool = self.tools.get(name)?;
        let result = match tool.call(arguments).await {
            Ok(output) => McpToolResult::json(&output.value, output.is_error),
            Err(e) => {
                tracing::debug!(tool = name, error = %e, "tool call rejected");
                McpToolResult::error(e.to_string())
            }
        };
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, ErrorContext};
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn definition(&self) -> McpTool {
            McpTool {
                name: "echo".into(),
                description: Some("Echo arguments".into()),
                input_schema: json!({ "type": "object" }),
            }
        }

        async fn call(&self, arguments: Value) -> Result<ToolOutput> {
            if arguments.get("fail").is_some() {
                return Err(Error::validation_with_context(
                    "told to fail",
                    ErrorContext::new().with_field_path("fail"),
                ));
            }
            Ok(ToolOutput::ok(arguments))
        }
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("echo"));

        let ok = registry.call("echo", json!({ "x": 1 })).await.unwrap();
        assert!(!ok.is_error);
        assert!(ok.joined_text().contains("\"x\": 1"));

        let failed = registry.call("echo", json!({ "fail": true })).await.unwrap();
        assert!(failed.is_error);
        assert!(failed.joined_text().contains("told to fail"));

        assert!(registry.call("missing", Value::Null).await.is_none());
    }
}
