use super::{input_schema, Tool, ToolOutput};
use crate::dispatch::Dispatcher;
use crate::mcp::McpTool;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct StatusArgs {
    /// Remove expired entries before reporting.
    #[serde(default)]
    sweep: bool,
}

/// `cache_status`: backend, entry count and counters.
pub struct CacheStatusTool {
    dispatcher: Arc<Dispatcher>,
    schema: Value,
}

impl CacheStatusTool {
    pub const NAME: &'static str = "cache_status";

    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            schema: input_schema::<StatusArgs>(),
        }
    }
}

#[async_trait]
impl Tool for CacheStatusTool {
    fn definition(&self) -> McpTool {
        McpTool {
            name: Self::NAME.to_string(),
            description: Some("Report response cache and dispatch statistics".to_string()),
            input_schema: self.schema.clone(),
        }
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let args: StatusArgs = if arguments.is_null() {
            StatusArgs::default()
        } else {
            serde_json::from_value(arguments).map_err(|e| {
                Error::validation_with_context(
                    format!("invalid arguments: {}", e),
                    ErrorContext::new().with_source("argument_validator"),
                )
            })?
        };

        let cache = self.dispatcher.cache();
        let swept = if args.sweep {
            Some(cache.sweep().await?)
        } else {
            None
        };
        // Entry count is informational; a failing store still reports counters.
        let entries = cache.len().await.ok();

        Ok(ToolOutput::ok(json!({
            "backend": cache.backend_name(),
            "enabled": cache.is_enabled(),
            "entries": entries,
            "swept": swept,
            "cache": cache.stats(),
            "hit_ratio": cache.stats().hit_ratio(),
            "dispatch": self.dispatcher.stats(),
            "limiter": self.dispatcher.limiter().stats(),
            "single_flight": self.dispatcher.single_flight(),
        })))
    }
}
