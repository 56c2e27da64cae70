//! 请求描述模块：出站 API 调用的不可变请求描述及其构建与校验。
//!
//! # Request Descriptors
//!
//! A [`RequestDescriptor`] is the strongly typed form of one outbound API call.
//! It is built once (through [`RequestBuilder`] or from validated tool
//! arguments, see [`ApiCallArgs`]) and never mutated afterwards.
//!
//! Validation happens at construction: a descriptor that exists is always
//! dispatchable, so malformed input is rejected before it reaches the
//! dispatcher.

mod args;

pub use args::ApiCallArgs;

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Upper bound on attempts a single descriptor may ask for.
pub const MAX_ATTEMPTS: u32 = 10;
/// Upper bound on cache TTL (one year).
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "HEAD" => Ok(HttpMethod::Head),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(Error::validation_with_context(
                format!("unsupported HTTP method '{}'", other),
                ErrorContext::new()
                    .with_field_path("method")
                    .with_details("expected one of GET, HEAD, POST, PUT, PATCH, DELETE"),
            )),
        }
    }
}

/// Request body, either structured JSON or raw text sent as-is.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(serde_json::Value),
    Raw(String),
}

impl RequestBody {
    /// Exact bytes put on the wire.
    ///
    /// JSON is serialized compactly from the parsed value, so two bodies that
    /// only differ in the caller's whitespace produce the same bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            RequestBody::Json(v) => serde_json::to_vec(v).unwrap_or_default(),
            RequestBody::Raw(s) => s.as_bytes().to_vec(),
        }
    }
}

/// Immutable description of one outbound call.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    endpoint: String,
    url: Url,
    method: HttpMethod,
    headers: Vec<(String, String)>,
    body: Option<RequestBody>,
    params: BTreeMap<String, String>,
    use_cache: bool,
    cache_ttl: Duration,
    timeout: Duration,
    max_attempts: u32,
    deadline: Option<Duration>,
}

impl RequestDescriptor {
    pub fn builder(endpoint: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(endpoint)
    }

    /// Endpoint exactly as the caller supplied it.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    /// Query parameters, sorted by key.
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn use_cache(&self) -> bool {
        self.use_cache
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Per-attempt network timeout; also bounds each rate-limiter wait.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Overall budget for the whole dispatch, if any.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Rate-limiting target: the endpoint host, plus the port when explicit.
    pub fn target(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }
}

/// Builder for [`RequestDescriptor`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    endpoint: String,
    method: HttpMethod,
    headers: Vec<(String, String)>,
    body: Option<RequestBody>,
    params: BTreeMap<String, String>,
    use_cache: bool,
    cache_ttl: Duration,
    timeout: Duration,
    max_attempts: u32,
    deadline: Option<Duration>,
}

impl RequestBuilder {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: HttpMethod::Get,
            headers: Vec::new(),
            body: None,
            params: BTreeMap::new(),
            use_cache: true,
            cache_ttl: DEFAULT_CACHE_TTL,
            timeout: DEFAULT_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            deadline: None,
        }
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn raw_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(RequestBody::Raw(body.into()));
        self
    }

    pub fn body(mut self, body: Option<RequestBody>) -> Self {
        self.body = body;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn use_cache(mut self, enable: bool) -> Self {
        self.use_cache = enable;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Validate and freeze the descriptor.
    pub fn build(self) -> Result<RequestDescriptor> {
        let url = Url::parse(&self.endpoint).map_err(|e| {
            Error::validation_with_context(
                format!("invalid endpoint URL: {}", e),
                ErrorContext::new()
                    .with_field_path("endpoint")
                    .with_details(self.endpoint.clone()),
            )
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(Error::validation_with_context(
                "endpoint must be an absolute http(s) URL with a host",
                ErrorContext::new()
                    .with_field_path("endpoint")
                    .with_details(self.endpoint.clone()),
            ));
        }

        for (name, value) in &self.headers {
            if reqwest::header::HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(Error::validation_with_context(
                    format!("invalid header name '{}'", name),
                    ErrorContext::new().with_field_path(format!("headers.{}", name)),
                ));
            }
            if reqwest::header::HeaderValue::from_str(value).is_err() {
                return Err(Error::validation_with_context(
                    "invalid header value",
                    ErrorContext::new().with_field_path(format!("headers.{}", name)),
                ));
            }
        }

        if self.timeout.is_zero() {
            return Err(Error::validation_with_context(
                "timeout must be positive",
                ErrorContext::new().with_field_path("timeout_seconds"),
            ));
        }
        if self.max_attempts == 0 || self.max_attempts > MAX_ATTEMPTS {
            return Err(Error::validation_with_context(
                format!("retry_attempts must be between 1 and {}", MAX_ATTEMPTS),
                ErrorContext::new()
                    .with_field_path("retry_attempts")
                    .with_details(self.max_attempts.to_string()),
            ));
        }
        if self.use_cache && (self.cache_ttl.is_zero() || self.cache_ttl > MAX_CACHE_TTL) {
            return Err(Error::validation_with_context(
                "cache TTL must be positive and at most one year",
                ErrorContext::new().with_field_path("cache_ttl_hours"),
            ));
        }
        if matches!(self.deadline, Some(d) if d.is_zero()) {
            return Err(Error::validation_with_context(
                "deadline must be positive",
                ErrorContext::new().with_field_path("deadline_seconds"),
            ));
        }

        Ok(RequestDescriptor {
            endpoint: self.endpoint,
            url,
            method: self.method,
            headers: self.headers,
            body: self.body,
            params: self.params,
            use_cache: self.use_cache,
            cache_ttl: self.cache_ttl,
            timeout: self.timeout,
            max_attempts: self.max_attempts,
            deadline: self.deadline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parsing_is_case_insensitive() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!(" Post ".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
        assert!("TRACE".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let req = RequestDescriptor::builder("https://api.example.com/weather")
            .build()
            .unwrap();
        assert_eq!(req.method(), HttpMethod::Get);
        assert!(req.use_cache());
        assert_eq!(req.cache_ttl(), DEFAULT_CACHE_TTL);
        assert_eq!(req.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(req.max_attempts(), DEFAULT_MAX_ATTEMPTS);
        assert!(req.deadline().is_none());
        assert_eq!(req.target(), "api.example.com");
    }

    #[test]
    fn test_target_keeps_explicit_port() {
        let req = RequestDescriptor::builder("http://127.0.0.1:8080/v1/items")
            .build()
            .unwrap();
        assert_eq!(req.target(), "127.0.0.1:8080");
    }

    #[test]
    fn test_endpoint_is_kept_verbatim() {
        let req = RequestDescriptor::builder("https://API.example.com/Weather")
            .build()
            .unwrap();
        assert_eq!(req.endpoint(), "https://API.example.com/Weather");
    }

    #[test]
    fn test_rejects_malformed_descriptors() {
        assert!(RequestDescriptor::builder("not a url").build().is_err());
        assert!(RequestDescriptor::builder("ftp://example.com/file")
            .build()
            .is_err());
        assert!(RequestDescriptor::builder("https://example.com")
            .max_attempts(0)
            .build()
            .is_err());
        assert!(RequestDescriptor::builder("https://example.com")
            .timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(RequestDescriptor::builder("https://example.com")
            .cache_ttl(Duration::ZERO)
            .build()
            .is_err());
        assert!(RequestDescriptor::builder("https://example.com")
            .header("bad header", "x")
            .build()
            .is_err());
    }

    #[test]
    fn test_zero_ttl_allowed_without_cache() {
        let req = RequestDescriptor::builder("https://example.com")
            .use_cache(false)
            .cache_ttl(Duration::ZERO)
            .build();
        assert!(req.is_ok());
    }

    #[test]
    fn test_json_body_bytes_are_compact() {
        let body: serde_json::Value = serde_json::from_str("{ \"a\" :  1 }").unwrap();
        assert_eq!(RequestBody::Json(body).to_bytes(), br#"{"a":1}"#.to_vec());
        assert_eq!(RequestBody::Raw(" x ".into()).to_bytes(), b" x ".to_vec());
    }
}
