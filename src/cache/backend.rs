//! Cache store implementations.

use super::key::Fingerprint;
use crate::request::RequestDescriptor;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A cached upstream response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub method: String,
    pub endpoint: String,
    pub status: u16,
    pub body: String,
    /// Upstream response headers, lower-cased names.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body size in bytes.
    pub size: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Entry for a response to `request`, expiring after the request's cache TTL.
    pub fn for_response(
        request: &RequestDescriptor,
        fingerprint: Fingerprint,
        status: u16,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let body = body.into();
        Self {
            fingerprint,
            method: request.method().to_string(),
            endpoint: request.endpoint().to_string(),
            status,
            size: body.len(),
            body,
            headers: BTreeMap::new(),
            created_at,
            expires_at: expiry(created_at, request.cache_ttl()),
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.expires_at <= self.created_at {
            return Err(Error::validation_with_context(
                "cache entry must expire after it was created",
                ErrorContext::new()
                    .with_field_path("expires_at")
                    .with_details(self.fingerprint.to_string()),
            ));
        }
        Ok(())
    }
}

/// `created_at + ttl`, at least one millisecond later and saturating at the
/// far end of the calendar.
fn expiry(created_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = ttl.max(Duration::from_millis(1));
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| created_at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Storage behind the response cache.
///
/// Implementations must make `put` atomic per fingerprint and must never
/// report an expired entry as live.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Live entry for `fingerprint`, or `None` if absent or expired.
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>>;
    /// Upsert by fingerprint; the last write wins.
    async fn put(&self, entry: CacheEntry) -> Result<()>;
    /// Remove every entry with `expires_at <= now`, returning how many went.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize>;
    /// Number of live entries.
    async fn len(&self) -> Result<usize>;
    async fn clear(&self) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Bounded in-memory store with least-recently-used eviction.
pub struct MemoryStore {
    entries: Mutex<LruCache<Fingerprint, CacheEntry>>,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LruCache<Fingerprint, CacheEntry>>> {
        self.entries.lock().map_err(|_| {
            Error::cache_unavailable(
                "memory store lock poisoned",
                ErrorContext::new().with_source("memory_store"),
            )
        })
    }

    fn remove_expired(entries: &mut LruCache<Fingerprint, CacheEntry>, now: DateTime<Utc>) -> usize {
        let expired: Vec<Fingerprint> = entries
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &expired {
            entries.pop(k);
        }
        expired.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let now = Utc::now();
        let mut entries = self.lock()?;
        let expired = match entries.get(fingerprint) {
            Some(e) if !e.is_expired_at(now) => return Ok(Some(e.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(fingerprint);
        }
        Ok(None)
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        entry.validate()?;
        let mut entries = self.lock()?;
        // Prefer dropping dead entries over evicting live ones.
        if entries.len() >= entries.cap().get() && !entries.contains(&entry.fingerprint) {
            Self::remove_expired(&mut entries, Utc::now());
        }
        entries.put(entry.fingerprint.clone(), entry);
        Ok(())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.lock()?;
        Ok(Self::remove_expired(&mut entries, now))
    }

    async fn len(&self) -> Result<usize> {
        let now = Utc::now();
        Ok(self
            .lock()?
            .iter()
            .filter(|(_, e)| !e.is_expired_at(now))
            .count())
    }

    async fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Store that keeps nothing; every lookup is a miss.
pub struct NullStore;

impl NullStore {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for NullStore {
    async fn get(&self, _: &Fingerprint) -> Result<Option<CacheEntry>> {
        Ok(None)
    }
    async fn put(&self, _: CacheEntry) -> Result<()> {
        Ok(())
    }
    async fn sweep(&self, _: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }
    async fn len(&self) -> Result<usize> {
        Ok(0)
    }
    async fn clear(&self) -> Result<()> {
        Ok(())
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
