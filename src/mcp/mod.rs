//! MCP 服务端模块：通过 stdio 上的 JSON-RPC 暴露工具
//!
//! Model Context Protocol server surface. Tools registered in a
//! [`ToolRegistry`](crate::tools::ToolRegistry) are listed and invoked over
//! newline-delimited JSON-RPC 2.0.
//!
//! This module handles:
//! - MCP wire types for tool descriptors and tool results
//! - JSON-RPC request/response framing and standard error codes
//! - The concurrent read loop with a single ordered writer ([`McpServer`])

mod jsonrpc;
mod server;

pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use server::{McpServer, ServerInfo, PROTOCOL_VERSION};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A tool as advertised in a `tools/list` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    /// Tool name (unique within a server).
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema describing the tool's input parameters.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// A `tools/call` request's params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolInvocation {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Result of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolResult {
    pub content: Vec<McpContent>,
    /// Tool-level failure; the JSON-RPC call itself still succeeded.
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl McpToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![McpContent::text(text)],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![McpContent::text(text)],
            is_error: true,
        }
    }

    /// Pretty-printed JSON as a single text block.
    pub fn json(value: &Value, is_error: bool) -> Self {
        let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        Self {
            content: vec![McpContent::text(text)],
            is_error,
        }
    }

    /// All text blocks joined by newlines.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Content block within a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl McpContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: Some(text.into()),
            extra: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_result_wire_shape() {
        let v = serde_json::to_value(McpToolResult::error("boom")).unwrap();
        assert_eq!(
            v,
            json!({ "content": [{ "type": "text", "text": "boom" }], "isError": true })
        );
    }

    #[test]
    fn test_tool_descriptor_uses_camel_case_schema() {
        let tool = McpTool {
            name: "cache_status".into(),
            description: None,
            input_schema: json!({ "type": "object" }),
        };
        let v = serde_json::to_value(&tool).unwrap();
        assert_eq!(v["inputSchema"]["type"], "object");
        assert!(v.get("description").is_none());
    }

    #[test]
    fn test_joined_text() {
        let result = McpToolResult {
            content: vec![McpContent::text("a"), McpContent::text("b")],
            is_error: false,
        };
        assert_eq!(result.joined_text(), "a\nb");
    }

    #[test]
    fn test_invocation_defaults_arguments() {
        let inv: McpToolInvocation = serde_json::from_value(json!({ "name": "ping" })).unwrap();
        assert_eq!(inv.arguments, Value::Null);
    }
}
