use super::Dispatcher;
use crate::cache::{CacheConfig, CacheManager, MemoryStore};
use crate::resilience::{BackoffPolicy, RateLimiter, RateLimiterConfig};
use crate::transport::{HttpTransport, HttpTransportConfig, Transport};
use crate::Result;
use std::sync::Arc;

/// Builder for [`Dispatcher`].
///
/// Every collaborator is optional; the defaults are an in-memory cache,
/// a limiter with 8 permits per target, the stock backoff policy and an
/// [`HttpTransport`].
pub struct DispatcherBuilder {
    cache: Option<Arc<CacheManager>>,
    limiter: Option<Arc<RateLimiter>>,
    transport: Option<Arc<dyn Transport>>,
    backoff: BackoffPolicy,
    single_flight: bool,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self {
            cache: None,
            limiter: None,
            transport: None,
            backoff: BackoffPolicy::default(),
            single_flight: false,
        }
    }

    pub fn cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Coalesce concurrent identical cacheable requests into one upstream call.
    pub fn single_flight(mut self, enable: bool) -> Self {
        self.single_flight = enable;
        self
    }

    pub fn build(self) -> Result<Dispatcher> {
        let cache = match self.cache {
            Some(c) => c,
            None => Arc::new(CacheManager::new(
                CacheConfig::default(),
                Arc::new(MemoryStore::default()),
            )),
        };
        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(RateLimiter::new(RateLimiterConfig::default())));
        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::new(&HttpTransportConfig::default())?),
        };
        tracing::debug!(
            cache = cache.backend_name(),
            transport = transport.name(),
            single_flight = self.single_flight,
            "dispatcher ready"
        );
        Ok(Dispatcher::from_parts(
            cache,
            limiter,
            transport,
            self.backoff,
            self.single_flight,
        ))
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}
