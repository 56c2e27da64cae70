//! Shared fakes for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tool_relay::cache::{CacheConfig, CacheManager, CacheStore, MemoryStore};
use tool_relay::resilience::{BackoffPolicy, RateLimiter, RateLimiterConfig};
use tool_relay::transport::{Transport, TransportError, UpstreamResponse};
use tool_relay::{Dispatcher, RequestDescriptor};

type Reply = Result<UpstreamResponse, TransportError>;
type Handler = dyn Fn(u32, &RequestDescriptor) -> Reply + Send + Sync;

/// Transport that answers from a closure and records every call.
pub struct FakeUpstream {
    handler: Box<Handler>,
    calls: AtomicU32,
    call_times: Mutex<Vec<Instant>>,
    latency: Duration,
}

impl FakeUpstream {
    /// `handler` receives the 1-based call number.
    pub fn new(handler: impl Fn(u32, &RequestDescriptor) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        })
    }

    /// Answers `status` only after `latency` has passed.
    pub fn slow(latency: Duration, status: u16, body: &'static str) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(move |_, _| Ok(UpstreamResponse::new(status, body))),
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
            latency,
        })
    }

    pub fn always(status: u16, body: &'static str) -> Arc<Self> {
        Self::new(move |_, _| Ok(UpstreamResponse::new(status, body)))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Time between consecutive calls.
    pub fn gaps(&self) -> Vec<Duration> {
        let times = self.call_times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl Transport for FakeUpstream {
    async fn send(&self, request: &RequestDescriptor, _timeout: Duration) -> Reply {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.call_times.lock().unwrap().push(Instant::now());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.handler)(n, request)
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

pub fn backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10)).with_jitter(false)
}

pub fn dispatcher_with(
    upstream: Arc<FakeUpstream>,
    store: Arc<dyn CacheStore>,
    limiter: RateLimiterConfig,
) -> Dispatcher {
    Dispatcher::builder()
        .cache(Arc::new(CacheManager::new(CacheConfig::default(), store)))
        .limiter(Arc::new(RateLimiter::new(limiter)))
        .transport(upstream)
        .backoff(backoff())
        .build()
        .expect("dispatcher")
}

pub fn dispatcher(upstream: Arc<FakeUpstream>) -> Dispatcher {
    dispatcher_with(
        upstream,
        Arc::new(MemoryStore::new(100)),
        RateLimiterConfig::new().with_max_concurrent(4),
    )
}
