//! 传输层模块：对外 HTTP 调用的抽象与实现。
//!
//! # Transport Layer
//!
//! The dispatcher never talks to `reqwest` directly. It sends a
//! [`RequestDescriptor`] through a [`Transport`] and gets back the raw status,
//! headers and body of a single attempt. Classification, retries and caching
//! all happen above this layer.

pub mod http;

pub use http::{HttpTransport, HttpTransportConfig};

use crate::request::RequestDescriptor;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// What came back from one upstream attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Lower-cased header names; repeated headers are joined with `", "`.
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// Parsed `Retry-After`, if the upstream sent one.
    pub retry_after: Option<Duration>,
}

impl UpstreamResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// One network attempt. Implementations must not retry on their own.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &RequestDescriptor,
        timeout: Duration,
    ) -> std::result::Result<UpstreamResponse, TransportError>;

    fn name(&self) -> &'static str {
        "transport"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Network-level failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout(_) | TransportError::Connect(_) => true,
            TransportError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_body() || e.is_request()
            }
            TransportError::InvalidRequest(_) | TransportError::Other(_) => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Timeout(_) => true,
            TransportError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(TransportError::Connect("refused".into()).is_transient());
        assert!(!TransportError::InvalidRequest("bad header".into()).is_transient());
        assert!(!TransportError::Other("boom".into()).is_transient());
    }

    #[test]
    fn test_response_builder_lowercases_headers() {
        let resp = UpstreamResponse::new(200, "{}").with_header("Content-Type", "application/json");
        assert_eq!(resp.headers.get("content-type").map(String::as_str), Some("application/json"));
    }
}
