use crate::cache::{CacheEntry, Fingerprint};
use crate::transport::UpstreamResponse;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Terminal state of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    RateLimited,
    TimedOut,
    PermanentUpstreamFailure,
    RetriesExhausted,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::RateLimited => "rate_limited",
            OutcomeKind::TimedOut => "timed_out",
            OutcomeKind::PermanentUpstreamFailure => "permanent_upstream_failure",
            OutcomeKind::RetriesExhausted => "retries_exhausted",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeKind::Success)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform result of [`Dispatcher::dispatch`](super::Dispatcher::dispatch),
/// whatever happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultEnvelope {
    pub outcome: OutcomeKind,
    /// Upstream status of the served response, or of the last failed attempt.
    pub status: Option<u16>,
    pub body: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub from_cache: bool,
    /// Network calls actually made.
    pub attempts: u32,
    /// Total time spent in backoff sleeps (ms).
    pub backoff_ms: u64,
    pub fingerprint: Option<Fingerprint>,
    pub error: Option<String>,
}

impl ResultEnvelope {
    pub(crate) fn served(entry: CacheEntry) -> Self {
        Self {
            outcome: OutcomeKind::Success,
            status: Some(entry.status),
            body: Some(entry.body),
            headers: entry.headers,
            from_cache: true,
            attempts: 0,
            backoff_ms: 0,
            fingerprint: Some(entry.fingerprint),
            error: None,
        }
    }

    pub(crate) fn success(
        response: UpstreamResponse,
        attempts: u32,
        backoff_ms: u64,
        fingerprint: Option<Fingerprint>,
    ) -> Self {
        Self {
            outcome: OutcomeKind::Success,
            status: Some(response.status),
            body: Some(response.body),
            headers: response.headers,
            from_cache: false,
            attempts,
            backoff_ms,
            fingerprint,
            error: None,
        }
    }

    pub(crate) fn failure(
        error: &Error,
        attempts: u32,
        backoff_ms: u64,
        fingerprint: Option<Fingerprint>,
    ) -> Self {
        Self {
            outcome: error.outcome_kind(),
            status: error.status(),
            body: error.body().map(str::to_string),
            headers: BTreeMap::new(),
            from_cache: false,
            attempts,
            backoff_ms,
            fingerprint,
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Body decoded as JSON, when it is JSON.
    pub fn parsed_body(&self) -> Option<serde_json::Value> {
        self.body
            .as_deref()
            .and_then(|b| serde_json::from_str(b).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_outcome_serializes_snake_case() {
        let v = serde_json::to_value(OutcomeKind::PermanentUpstreamFailure).unwrap();
        assert_eq!(v, "permanent_upstream_failure");
        assert_eq!(OutcomeKind::RetriesExhausted.to_string(), "retries_exhausted");
    }

    #[test]
    fn test_failure_envelope_carries_last_status_and_body() {
        let last = Error::TransientUpstream {
            status: Some(503),
            message: "unavailable".into(),
            body: Some("try later".into()),
            retry_after: None,
        };
        let err = Error::RetriesExhausted {
            attempts: 3,
            last: Box::new(last),
        };
        let env = ResultEnvelope::failure(&err, 3, 300, None);
        assert_eq!(env.outcome, OutcomeKind::RetriesExhausted);
        assert_eq!(env.status, Some(503));
        assert_eq!(env.body.as_deref(), Some("try later"));
        assert!(env.error.unwrap().contains("3 attempts"));
    }

    #[test]
    fn test_rate_limited_envelope() {
        let err = Error::RateLimited {
            target: "h".into(),
            waited: Duration::from_millis(5),
        };
        let env = ResultEnvelope::failure(&err, 0, 0, None);
        assert_eq!(env.outcome, OutcomeKind::RateLimited);
        assert_eq!(env.status, None);
        assert!(!env.is_success());
    }

    #[test]
    fn test_parsed_body() {
        let env = ResultEnvelope::success(UpstreamResponse::new(200, r#"{"t":21}"#), 1, 0, None);
        assert_eq!(env.parsed_body().unwrap()["t"], 21);
        let text = ResultEnvelope::success(UpstreamResponse::new(200, "plain"), 1, 0, None);
        assert!(text.parsed_body().is_none());
    }
}
