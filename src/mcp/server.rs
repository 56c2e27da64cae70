use super::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use super::McpToolInvocation;
use crate::tools::ToolRegistry;
use crate::{Error, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Newline-delimited JSON-RPC server over any async reader/writer pair.
///
/// Each request runs on its own task; responses go through one writer task
/// so lines never interleave. Responses may arrive out of request order.
pub struct McpServer {
    registry: Arc<ToolRegistry>,
    info: ServerInfo,
}

impl McpServer {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            info: ServerInfo::default(),
        }
    }

    pub fn with_info(mut self, info: ServerInfo) -> Self {
        self.info = info;
        self
    }

    /// Serve until `reader` reaches EOF and every in-flight request has answered.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = rx.recv().await {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        });

        info!(server = %self.info.name, version = %self.info.version, "mcp server listening");
        let mut lines = reader.lines();
        let mut in_flight = JoinSet::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let server = Arc::clone(&self);
            let tx = tx.clone();
            in_flight.spawn(async move {
                if let Some(response) = server.handle_line(&line).await {
                    // The writer only goes away once every sender is dropped.
                    let _ = tx.send(response);
                }
            });
            while in_flight.try_join_next().is_some() {}
        }
        while let Some(res) = in_flight.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "request task failed");
            }
        }
        drop(tx);

        writer_task
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))??;
        info!("mcp server input closed");
        Ok(())
    }

    /// Handle one raw line; `None` for notifications.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let response = match serde_json::from_str::<Value>(line) {
            Err(e) => Some(JsonRpcResponse::error(Value::Null, JsonRpcError::parse_error(e))),
            Ok(raw) => {
                let id = raw.get("id").cloned().unwrap_or(Value::Null);
                match serde_json::from_value::<JsonRpcRequest>(raw) {
                    Err(e) => Some(JsonRpcResponse::error(id, JsonRpcError::invalid_request(e))),
                    Ok(request) => self.handle(request).await,
                }
            }
        }?;
        match serde_json::to_string(&response) {
            Ok(line) => Some(line),
            Err(e) => {
                warn!(error = %e, "failed to encode response");
                None
            }
        }
    }

    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        debug!(method = %request.method, "rpc request");
        if request.jsonrpc != "2.0" {
            let id = request.id.unwrap_or(Value::Null);
            return Some(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request("jsonrpc must be \"2.0\""),
            ));
        }
        let Some(id) = request.id.clone() else {
            // Notifications never get a response.
            debug!(method = %request.method, "notification");
            return None;
        };

        let outcome = match request.method.as_str() {
            "initialize" => Ok(self.initialize(request.params.as_ref())),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.registry.definitions() })),
            "tools/call" => self.call_tool(request.params).await,
            other => Err(JsonRpcError::method_not_found(other)),
        };
        Some(match outcome {
            Ok(result) => JsonRpcResponse::result(id, result),
            Err(error) => JsonRpcResponse::error(id, error),
        })
    }

    fn initialize(&self, params: Option<&Value>) -> Value {
        let version = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION);
        json!({
            "protocolVersion": version,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": { "name": self.info.name, "version": self.info.version },
        })
    }

    async fn call_tool(&self, params: Option<Value>) -> std::result::Result<Value, JsonRpcError> {
        let invocation: McpToolInvocation = params
            .ok_or_else(|| JsonRpcError::invalid_params("missing params"))
            .and_then(|p| serde_json::from_value(p).map_err(JsonRpcError::invalid_params))?;
        let result = self
            .registry
            .call(&invocation.name, invocation.arguments)
            .await
            .ok_or_else(|| JsonRpcError::invalid_params(format!("unknown tool: {}", invocation.name)))?;
        serde_json::to_value(result)
            .map_err(|e| JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, e.to_string()))
    }
}
