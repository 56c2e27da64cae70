//! # tool-relay
//!
//! 带缓存、限流与重试的外部请求层，通过 MCP 工具接口对外提供服务。
//!
//! An MCP tool server whose core is a resilient, cached outbound request
//! layer.
//!
//! ## Overview
//!
//! Every outbound call is described by an immutable [`RequestDescriptor`] and
//! run by the [`Dispatcher`], which:
//!
//! - serves live responses from the cache, keyed by a request [`Fingerprint`]
//! - admits calls through a per-target [`RateLimiter`]
//! - retries transient failures with capped exponential backoff
//! - always answers with a uniform [`ResultEnvelope`]
//!
//! The same dispatcher backs the `api_integration` tool exposed over
//! newline-delimited JSON-RPC on stdio (see [`mcp`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tool_relay::{Dispatcher, RequestDescriptor};
//!
//! #[tokio::main]
//! async fn main() -> tool_relay::Result<()> {
//!     let dispatcher = Dispatcher::builder().build()?;
//!     let request = RequestDescriptor::builder("https://api.example.com/weather")
//!         .param("city", "Oslo")
//!         .build()?;
//!
//!     let first = dispatcher.dispatch(&request).await;
//!     let second = dispatcher.dispatch(&request).await;
//!     assert!(!first.from_cache && second.from_cache);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`request`] | Request descriptors and tool argument validation |
//! | [`cache`] | Fingerprints, cache stores and the cache manager |
//! | [`resilience`] | Backoff policy and per-target rate limiting |
//! | [`transport`] | Network seam and the HTTP transport |
//! | [`dispatch`] | The attempt loop and result envelopes |
//! | [`tools`] | Tool trait, registry and built-in tools |
//! | [`mcp`] | JSON-RPC stdio server |
//! | [`config`] | YAML and environment configuration |

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod mcp;
pub mod relay;
pub mod request;
pub mod resilience;
pub mod tools;
pub mod transport;

pub use cache::{CacheEntry, CacheManager, CacheStore, Fingerprint};
pub use config::RelayConfig;
pub use dispatch::{Dispatcher, DispatcherBuilder, OutcomeKind, ResultEnvelope};
pub use relay::Relay;
pub use request::{HttpMethod, RequestBody, RequestDescriptor};
pub use resilience::{BackoffPolicy, RateLimiter};
pub use transport::{Transport, UpstreamResponse};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
