use crate::dispatch::OutcomeKind;
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or argument key that caused the error (e.g., "arguments.endpoint")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "sqlite_store", "argument_validator")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the relay.
///
/// The first six variants form the dispatch taxonomy; the rest are ambient
/// failures (bad input, bad config, I/O).
#[derive(Debug, Error)]
pub enum Error {
    #[error("Cache unavailable: {message}{}", format_context(.context))]
    CacheUnavailable {
        message: String,
        context: ErrorContext,
    },

    #[error("Rate limited: no permit for {target} within {}ms", .waited.as_millis())]
    RateLimited { target: String, waited: Duration },

    #[error("Transient upstream failure{}: {message}", format_status(.status))]
    TransientUpstream {
        status: Option<u16>,
        message: String,
        body: Option<String>,
        retry_after: Option<Duration>,
    },

    #[error("Permanent upstream failure{}: {message}", format_status(.status))]
    PermanentUpstream {
        status: Option<u16>,
        message: String,
        body: Option<String>,
    },

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    #[error("Deadline of {}ms exceeded while {stage}", .deadline.as_millis())]
    TimedOut {
        deadline: Duration,
        stage: &'static str,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Network transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

fn format_status(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" (HTTP {})", s),
        None => String::new(),
    }
}

impl Error {
    /// Create a cache-unavailable error with structured context
    pub fn cache_unavailable(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::CacheUnavailable {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::CacheUnavailable { context, .. }
            | Error::Validation { context, .. }
            | Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientUpstream { .. } => true,
            Error::Transport(e) => e.is_transient(),
            _ => false,
        }
    }

    /// HTTP status carried by upstream failures, looking through `RetriesExhausted`.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::TransientUpstream { status, .. } | Error::PermanentUpstream { status, .. } => {
                *status
            }
            Error::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Upstream response body carried by the failure, if any.
    pub fn body(&self) -> Option<&str> {
        match self {
            Error::TransientUpstream { body, .. } | Error::PermanentUpstream { body, .. } => {
                body.as_deref()
            }
            Error::RetriesExhausted { last, .. } => last.body(),
            _ => None,
        }
    }

    /// Map a terminal failure onto the envelope outcome kind.
    ///
    /// Anything that is not one of the dispatch kinds (e.g. a transport error
    /// that escaped classification) is reported as a permanent failure.
    pub fn outcome_kind(&self) -> OutcomeKind {
        match self {
            Error::RateLimited { .. } => OutcomeKind::RateLimited,
            Error::RetriesExhausted { .. } => OutcomeKind::RetriesExhausted,
            Error::TimedOut { .. } => OutcomeKind::TimedOut,
            Error::TransientUpstream { .. } => OutcomeKind::RetriesExhausted,
            _ => OutcomeKind::PermanentUpstreamFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_rendered() {
        let err = Error::validation_with_context(
            "endpoint is required",
            ErrorContext::new()
                .with_field_path("arguments.endpoint")
                .with_source("argument_validator"),
        );
        let text = err.to_string();
        assert!(text.contains("endpoint is required"));
        assert!(text.contains("field: arguments.endpoint"));
        assert!(text.contains("source: argument_validator"));
        assert!(err.context().is_some());
    }

    #[test]
    fn test_status_looks_through_exhaustion() {
        let err = Error::RetriesExhausted {
            attempts: 3,
            last: Box::new(Error::TransientUpstream {
                status: Some(503),
                message: "service unavailable".into(),
                body: Some("down".into()),
                retry_after: None,
            }),
        };
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.body(), Some("down"));
        assert_eq!(err.outcome_kind(), OutcomeKind::RetriesExhausted);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_outcome_kinds() {
        let limited = Error::RateLimited {
            target: "api.example.com".into(),
            waited: Duration::from_millis(10),
        };
        assert_eq!(limited.outcome_kind(), OutcomeKind::RateLimited);

        let timed_out = Error::TimedOut {
            deadline: Duration::from_secs(1),
            stage: "calling upstream",
        };
        assert_eq!(timed_out.outcome_kind(), OutcomeKind::TimedOut);

        let permanent = Error::PermanentUpstream {
            status: Some(404),
            message: "not found".into(),
            body: None,
        };
        assert_eq!(permanent.outcome_kind(), OutcomeKind::PermanentUpstreamFailure);
        assert!(permanent.to_string().contains("HTTP 404"));
    }
}
