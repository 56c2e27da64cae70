//! 响应缓存模块：请求指纹、带过期时间的缓存存储与缓存管理。
//!
//! # Response Caching Module
//!
//! Fingerprinting, storage with expiry, and the manager the dispatcher talks
//! to.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Fingerprint`] | Deterministic cache key derived from a request |
//! | [`CacheStore`] | Trait for storage backends (`get` / `put` / `sweep`) |
//! | [`MemoryStore`] | Bounded in-memory LRU store |
//! | [`SqliteStore`] | Durable SQLite store, also queryable read-only |
//! | [`NullStore`] | No-op store for disabling caching |
//! | [`CacheManager`] | Failure-absorbing front with statistics and periodic sweeps |
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tool_relay::cache::{CacheConfig, CacheManager, MemoryStore};
//!
//! let manager = CacheManager::new(CacheConfig::default(), Arc::new(MemoryStore::new(1000)));
//! assert_eq!(manager.backend_name(), "memory");
//! ```
//!
//! ## Expiry
//!
//! An entry is live while `now < expires_at`. Stores never return an expired
//! entry; they may delete it lazily on read, and [`CacheStore::sweep`] removes
//! the rest in bulk.

mod backend;
mod key;
mod manager;
mod sqlite;

pub use backend::{CacheEntry, CacheStore, MemoryStore, NullStore};
pub use key::Fingerprint;
pub use manager::{CacheConfig, CacheManager, CacheStats};
pub use sqlite::{QueryOutput, SqliteStore, MAX_QUERY_ROWS};
