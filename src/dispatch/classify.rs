//! Upstream status classification

use crate::transport::UpstreamResponse;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// Worth another attempt.
    Transient,
    /// Will fail the same way every time.
    Permanent,
}

/// 1xx-3xx succeed; 5xx, 408 and 429 are transient; other 4xx are permanent.
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        100..=399 => StatusClass::Success,
        408 | 429 => StatusClass::Transient,
        500..=599 => StatusClass::Transient,
        _ => StatusClass::Permanent,
    }
}

/// Short class name for logs and error messages.
pub(crate) fn error_class(status: u16) -> &'static str {
    match status {
        400 | 422 => "invalid_request",
        401 => "authentication",
        403 => "permission_denied",
        404 => "not_found",
        408 => "timeout",
        409 => "conflict",
        413 => "request_too_large",
        429 => "rate_limited",
        502..=504 | 529 => "overloaded",
        500..=599 => "server_error",
        _ => "http_error",
    }
}

/// Turn a non-success response into the matching upstream error.
pub(crate) fn upstream_error(response: UpstreamResponse) -> Error {
    let status = response.status;
    let reason = reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("unknown status");
    let message = format!("{} {} ({})", status, reason, error_class(status));
    let body = Some(response.body).filter(|b| !b.is_empty());
    match classify_status(status) {
        StatusClass::Transient => Error::TransientUpstream {
            status: Some(status),
            message,
            body,
            retry_after: response.retry_after,
        },
        _ => Error::PermanentUpstream {
            status: Some(status),
            message,
            body,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_classify_status() {
        for s in [100, 200, 201, 204, 301, 304] {
            assert_eq!(classify_status(s), StatusClass::Success, "{}", s);
        }
        for s in [408, 429, 500, 502, 503, 504, 599] {
            assert_eq!(classify_status(s), StatusClass::Transient, "{}", s);
        }
        for s in [400, 401, 403, 404, 410, 422, 600] {
            assert_eq!(classify_status(s), StatusClass::Permanent, "{}", s);
        }
    }

    #[test]
    fn test_upstream_error_shapes() {
        let err = upstream_error(
            UpstreamResponse::new(429, "slow down").with_retry_after(Duration::from_secs(2)),
        );
        assert!(err.is_transient());
        match err {
            Error::TransientUpstream {
                status, retry_after, ref message, ..
            } => {
                assert_eq!(status, Some(429));
                assert_eq!(retry_after, Some(Duration::from_secs(2)));
                assert!(message.contains("Too Many Requests"));
                assert!(message.contains("rate_limited"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let err = upstream_error(UpstreamResponse::new(404, ""));
        assert!(!err.is_transient());
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.body(), None);
    }
}
