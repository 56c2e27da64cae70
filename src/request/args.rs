//! Typed arguments of the `api_integration` tool.

use super::{HttpMethod, RequestBody, RequestDescriptor};
use crate::{Error, ErrorContext, Result};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_hours() -> f64 {
    1.0
}

fn default_timeout_seconds() -> f64 {
    30.0
}

fn default_retry_attempts() -> u32 {
    super::DEFAULT_MAX_ATTEMPTS
}

/// Arguments accepted by the `api_integration` tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ApiCallArgs {
    /// API endpoint URL.
    pub endpoint: String,
    /// HTTP method (GET, HEAD, POST, PUT, PATCH, DELETE).
    #[serde(default = "default_method")]
    pub method: String,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body. Strings are sent raw, anything else as JSON.
    #[serde(default, alias = "data")]
    pub body: Option<Value>,
    /// Query parameters (scalar values).
    #[serde(default, alias = "query")]
    pub params: BTreeMap<String, Value>,
    /// Serve from and write to the response cache.
    #[serde(default = "default_true")]
    pub use_cache: bool,
    /// Cache lifetime in hours.
    #[serde(default = "default_cache_ttl_hours", alias = "cache_duration_hours")]
    pub cache_ttl_hours: f64,
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    /// Maximum number of network attempts.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Optional overall budget in seconds for the whole call, retries included.
    #[serde(default)]
    pub deadline_seconds: Option<f64>,
}

impl ApiCallArgs {
    /// Parse loosely typed tool arguments.
    pub fn from_value(arguments: Value) -> Result<Self> {
        serde_json::from_value(arguments).map_err(|e| {
            Error::validation_with_context(
                format!("invalid arguments: {}", e),
                ErrorContext::new().with_source("argument_validator"),
            )
        })
    }

    /// Convert into a validated descriptor.
    pub fn into_descriptor(self) -> Result<RequestDescriptor> {
        let method: HttpMethod = self.method.parse()?;

        let mut builder = RequestDescriptor::builder(self.endpoint)
            .method(method)
            .use_cache(self.use_cache)
            .timeout(seconds("timeout_seconds", self.timeout_seconds)?)
            .max_attempts(self.retry_attempts);

        if self.use_cache {
            builder = builder.cache_ttl(seconds("cache_ttl_hours", self.cache_ttl_hours * 3600.0)?);
        }
        if let Some(d) = self.deadline_seconds {
            builder = builder.deadline(Some(seconds("deadline_seconds", d)?));
        }

        for (name, value) in self.headers {
            builder = builder.header(name, value);
        }

        for (key, value) in self.params {
            let value = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(Error::validation_with_context(
                        "query parameter values must be strings, numbers or booleans",
                        ErrorContext::new().with_field_path(format!("params.{}", key)),
                    ))
                }
            };
            builder = builder.param(key, value);
        }

        let body = match self.body {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(RequestBody::Raw(s)),
            Some(v) => Some(RequestBody::Json(v)),
        };

        builder.body(body).build()
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(Error::validation_with_context(
            "must be a positive, finite number",
            ErrorContext::new()
                .with_field_path(field)
                .with_details(value.to_string()),
        ));
    }
    Duration::try_from_secs_f64(value).map_err(|e| {
        Error::validation_with_context(
            e.to_string(),
            ErrorContext::new().with_field_path(field),
        )
    })
}
