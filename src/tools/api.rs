use super::{input_schema, Tool, ToolOutput};
use crate::dispatch::Dispatcher;
use crate::mcp::McpTool;
use crate::request::ApiCallArgs;
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// `api_integration`: one outbound HTTP call with caching, rate limiting and
/// retries.
pub struct ApiIntegrationTool {
    dispatcher: Arc<Dispatcher>,
    schema: Value,
}

impl ApiIntegrationTool {
    pub const NAME: &'static str = "api_integration";

    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            schema: input_schema::<ApiCallArgs>(),
        }
    }
}

#[async_trait]
impl Tool for ApiIntegrationTool {
    fn definition(&self) -> McpTool {
        McpTool {
            name: Self::NAME.to_string(),
            description: Some(
                "Call an external HTTP API with response caching, per-host rate limiting and retries"
                    .to_string(),
            ),
            input_schema: self.schema.clone(),
        }
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let args = ApiCallArgs::from_value(arguments)?;
        let request = args.into_descriptor()?;
        let envelope = self.dispatcher.dispatch(&request).await;

        let value = json!({
            "endpoint": request.endpoint(),
            "method": request.method().as_str(),
            "outcome": envelope.outcome,
            "status_code": envelope.status,
            "from_cache": envelope.from_cache,
            "attempts": envelope.attempts,
            "headers": envelope.headers,
            "response": envelope.body,
            "parsed_response": envelope.parsed_body(),
            "fingerprint": envelope.fingerprint,
            "error": envelope.error,
        });
        Ok(if envelope.is_success() {
            ToolOutput::ok(value)
        } else {
            ToolOutput::failed(value)
        })
    }
}
