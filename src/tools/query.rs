use super::{input_schema, Tool, ToolOutput};
use crate::cache::{SqliteStore, MAX_QUERY_ROWS};
use crate::mcp::McpTool;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

pub const DEFAULT_QUERY_LIMIT: usize = 100;

fn default_limit() -> usize {
    DEFAULT_QUERY_LIMIT
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct QueryArgs {
    /// Read-only SQL statement.
    pub query: String,
    /// Row limit appended to SELECTs without a LIMIT clause.
    #[serde(default = "default_limit")]
    pub limit: usize,
}

/// `database_query`: read-only SQL against the durable cache database.
pub struct DatabaseQueryTool {
    store: Arc<SqliteStore>,
    schema: Value,
}

impl DatabaseQueryTool {
    pub const NAME: &'static str = "database_query";

    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            schema: input_schema::<QueryArgs>(),
        }
    }
}

#[async_trait]
impl Tool for DatabaseQueryTool {
    fn definition(&self) -> McpTool {
        McpTool {
            name: Self::NAME.to_string(),
            description: Some(
                "Run a read-only SQL query against the cache database (table api_cache)".to_string(),
            ),
            input_schema: self.schema.clone(),
        }
    }

    async fn call(&self, arguments: Value) -> Result<ToolOutput> {
        let args: QueryArgs = serde_json::from_value(arguments).map_err(|e| {
            Error::validation_with_context(
                format!("invalid arguments: {}", e),
                ErrorContext::new().with_source("argument_validator"),
            )
        })?;
        if args.query.trim().is_empty() {
            return Err(Error::validation_with_context(
                "query must not be empty",
                ErrorContext::new().with_field_path("query"),
            ));
        }
        if args.limit == 0 || args.limit > MAX_QUERY_ROWS {
            return Err(Error::validation_with_context(
                format!("limit must be between 1 and {}", MAX_QUERY_ROWS),
                ErrorContext::new()
                    .with_field_path("limit")
                    .with_details(args.limit.to_string()),
            ));
        }
        let output = self.store.query_readonly(&args.query, args.limit).await?;
        Ok(ToolOutput::ok(serde_json::to_value(output)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::request::RequestDescriptor;
    use crate::cache::{CacheEntry, Fingerprint};
    use chrono::Utc;
    use serde_json::json;

    async fn seeded() -> DatabaseQueryTool {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        for i in 0..3 {
            let req = RequestDescriptor::builder(format!("https://api.example.com/items/{}", i))
                .build()
                .unwrap();
            let entry = CacheEntry::for_response(&req, Fingerprint::of(&req), 200, "{}", Utc::now());
            store.put(entry).await.unwrap();
        }
        DatabaseQueryTool::new(store)
    }

    #[tokio::test]
    async fn test_select_with_default_limit() {
        let tool = seeded().await;
        let out = tool
            .call(json!({ "query": "SELECT endpoint FROM api_cache ORDER BY endpoint" }))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(out.value["row_count"], 3);
        assert!(out.value["query"].as_str().unwrap().ends_with("LIMIT 100"));
        assert_eq!(out.value["data"][0]["endpoint"], "https://api.example.com/items/0");
    }

    #[tokio::test]
    async fn test_explicit_limit() {
        let tool = seeded().await;
        let out = tool
            .call(json!({ "query": "SELECT * FROM api_cache", "limit": 2 }))
            .await
            .unwrap();
        assert_eq!(out.value["row_count"], 2);
    }

    #[tokio::test]
    async fn test_writes_are_rejected() {
        let tool = seeded().await;
        for sql in ["DELETE FROM api_cache", "DROP TABLE api_cache", "INSERT INTO api_cache DEFAULT VALUES"] {
            let err = tool.call(json!({ "query": sql })).await.unwrap_err();
            assert!(matches!(err, Error::Validation { .. }), "{}", sql);
        }
        let out = tool
            .call(json!({ "query": "SELECT COUNT(*) AS n FROM api_cache" }))
            .await
            .unwrap();
        assert_eq!(out.value["data"][0]["n"], 3);
    }

    #[tokio::test]
    async fn test_argument_validation() {
        let tool = seeded().await;
        assert!(tool.call(json!({ "query": "  " })).await.is_err());
        assert!(tool.call(json!({ "query": "SELECT 1", "limit": 0 })).await.is_err());
        assert!(tool.call(json!({ "sql": "SELECT 1" })).await.is_err());
    }
}
