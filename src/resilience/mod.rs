//! 弹性模块：指数退避与按目标限流。
//!
//! # Resilience Primitives Module
//!
//! The two admission and pacing mechanisms the dispatcher applies to every
//! outbound call.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BackoffPolicy`] | Capped exponential delays with optional jitter and an attempt ceiling |
//! | [`RateLimiter`] | Per-target concurrent-call permits plus an optional token bucket |
//!
//! ## Backoff
//!
//! ```rust
//! use std::time::Duration;
//! use tool_relay::resilience::BackoffPolicy;
//!
//! let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(2))
//!     .with_jitter(false);
//! assert_eq!(policy.delay(1), Duration::from_millis(100));
//! assert_eq!(policy.delay(3), Duration::from_millis(400));
//! assert_eq!(policy.next_delay(3, Some(3), None), None);
//! ```
//!
//! ## Rate Limiter
//!
//! Permits are scoped to a target (the endpoint's `host[:port]`) and released
//! when the [`RatePermit`] guard is dropped.
//!
//! ```rust
//! use std::time::Duration;
//! use tool_relay::resilience::{RateLimiter, RateLimiterConfig};
//!
//! # tokio_test_block_on();
//! # fn tokio_test_block_on() {
//! # let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! # rt.block_on(async {
//! let limiter = RateLimiter::new(RateLimiterConfig::new().with_max_concurrent(2));
//! let permit = limiter.acquire("api.example.com", Duration::from_secs(1)).await.unwrap();
//! assert_eq!(permit.target(), "api.example.com");
//! # });
//! # }
//! ```

pub mod backoff;
pub mod rate_limiter;

pub use backoff::BackoffPolicy;
pub use rate_limiter::{
    RateLimiter, RateLimiterConfig, RateLimiterStats, RatePermit, RateWindowSnapshot,
};
