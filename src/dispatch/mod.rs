//! 请求分发模块：缓存查询、限流、重试与统一结果封装。
//!
//! # Request Dispatcher
//!
//! [`Dispatcher::dispatch`] turns a [`RequestDescriptor`] into a
//! [`ResultEnvelope`]:
//!
//! 1. With `use_cache`, look the fingerprint up and return a live entry
//!    immediately (no limiter, no network).
//! 2. Acquire a per-target permit, waiting at most the request timeout.
//! 3. Call the upstream once; success is cached and returned, permanent
//!    failures return immediately, transient failures back off and loop to 2
//!    until the attempt ceiling is reached.
//!
//! An optional overall deadline bounds the whole loop and is reported as
//! [`OutcomeKind::TimedOut`].
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Dispatcher`] | The attempt loop |
//! | [`DispatcherBuilder`] | Wires cache, limiter, transport and backoff |
//! | [`ResultEnvelope`] / [`OutcomeKind`] | Uniform result shape |
//! | [`classify_status`] | Status code to success / transient / permanent |

mod builder;
mod classify;
mod envelope;

pub use builder::DispatcherBuilder;
pub use classify::{classify_status, StatusClass};
pub use envelope::{OutcomeKind, ResultEnvelope};

use crate::cache::{CacheEntry, CacheManager, Fingerprint};
use crate::request::RequestDescriptor;
use crate::resilience::{BackoffPolicy, RateLimiter};
use crate::transport::Transport;
use crate::Error;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub dispatches: u64,
    pub cache_hits: u64,
    pub network_calls: u64,
    pub retries: u64,
    pub success: u64,
    pub rate_limited: u64,
    pub timed_out: u64,
    pub permanent_failures: u64,
    pub retries_exhausted: u64,
}

#[derive(Default)]
struct AtomicDispatchStats {
    dispatches: AtomicU64,
    cache_hits: AtomicU64,
    network_calls: AtomicU64,
    retries: AtomicU64,
    success: AtomicU64,
    rate_limited: AtomicU64,
    timed_out: AtomicU64,
    permanent_failures: AtomicU64,
    retries_exhausted: AtomicU64,
}

impl AtomicDispatchStats {
    fn record(&self, outcome: OutcomeKind) {
        let counter = match outcome {
            OutcomeKind::Success => &self.success,
            OutcomeKind::RateLimited => &self.rate_limited,
            OutcomeKind::TimedOut => &self.timed_out,
            OutcomeKind::PermanentUpstreamFailure => &self.permanent_failures,
            OutcomeKind::RetriesExhausted => &self.retries_exhausted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn to_stats(&self) -> DispatchStats {
        DispatchStats {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            network_calls: self.network_calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Per-dispatch bookkeeping; never shared.
#[derive(Debug)]
struct AttemptState {
    attempts: u32,
    waited: Duration,
    last_error: Option<String>,
    stage: &'static str,
}

impl AttemptState {
    fn new() -> Self {
        Self {
            attempts: 0,
            waited: Duration::ZERO,
            last_error: None,
            stage: "checking the cache",
        }
    }

    fn backoff_ms(&self) -> u64 {
        self.waited.as_millis() as u64
    }
}

type Flights = DashMap<Fingerprint, Arc<Mutex<()>>>;

/// Exclusive right to call upstream for one fingerprint.
struct FlightGuard {
    guard: Option<OwnedMutexGuard<()>>,
    flights: Arc<Flights>,
    fingerprint: Fingerprint,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.flights
            .remove_if(&self.fingerprint, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct Dispatcher {
    cache: Arc<CacheManager>,
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn Transport>,
    backoff: BackoffPolicy,
    flights: Option<Arc<Flights>>,
    stats: AtomicDispatchStats,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub(crate) fn from_parts(
        cache: Arc<CacheManager>,
        limiter: Arc<RateLimiter>,
        transport: Arc<dyn Transport>,
        backoff: BackoffPolicy,
        single_flight: bool,
    ) -> Self {
        Self {
            cache,
            limiter,
            transport,
            backoff,
            flights: single_flight.then(|| Arc::new(DashMap::new())),
            stats: AtomicDispatchStats::default(),
        }
    }

    /// Run one request to completion. Never panics and never returns an
    /// error: every failure is described by the envelope.
    pub async fn dispatch(&self, request: &RequestDescriptor) -> ResultEnvelope {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "dispatch",
            %request_id,
            method = %request.method(),
            target = %request.target(),
        );
        self.dispatch_inner(request).instrument(span).await
    }

    async fn dispatch_inner(&self, request: &RequestDescriptor) -> ResultEnvelope {
        self.stats.dispatches.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let fingerprint = request.use_cache().then(|| Fingerprint::of(request));
        let mut state = AttemptState::new();

        let envelope = match request.deadline() {
            None => self.run(request, fingerprint.clone(), &mut state).await,
            Some(deadline) => {
                let bounded =
                    tokio::time::timeout(deadline, self.run(request, fingerprint.clone(), &mut state))
                        .await;
                match bounded {
                    Ok(envelope) => envelope,
                    Err(_) => {
                        let err = Error::TimedOut {
                            deadline,
                            stage: state.stage,
                        };
                        warn!(
                            attempts = state.attempts,
                            last_error = state.last_error.as_deref().unwrap_or(""),
                            "{}",
                            err
                        );
                        ResultEnvelope::failure(&err, state.attempts, state.backoff_ms(), fingerprint)
                    }
                }
            }
        };

        self.stats.record(envelope.outcome);
        info!(
            outcome = %envelope.outcome,
            status = envelope.status,
            attempts = envelope.attempts,
            from_cache = envelope.from_cache,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dispatch finished"
        );
        envelope
    }

    async fn run(
        &self,
        request: &RequestDescriptor,
        fingerprint: Option<Fingerprint>,
        state: &mut AttemptState,
    ) -> ResultEnvelope {
        let Some(fp) = fingerprint else {
            return self.call_with_retries(request, None, state).await;
        };

        if let Some(entry) = self.cache.lookup(&fp).await {
            return self.served(entry);
        }

        let _flight = match &self.flights {
            Some(flights) => {
                let guard = self.join_flight(flights, &fp).await;
                // Whoever held the lock before us may have filled the cache.
                if let Some(entry) = self.cache.lookup(&fp).await {
                    return self.served(entry);
                }
                Some(guard)
            }
            None => None,
        };

        self.call_with_retries(request, Some(fp), state).await
    }

    /// Take the per-fingerprint lock, queueing behind an in-flight twin.
    async fn join_flight(&self, flights: &Arc<Flights>, fp: &Fingerprint) -> FlightGuard {
        let lock = Arc::clone(flights.entry(fp.clone()).or_default().value());
        let guard = match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(fingerprint = %fp, "joining in-flight request");
                lock.lock_owned().await
            }
        };
        FlightGuard {
            guard: Some(guard),
            flights: Arc::clone(flights),
            fingerprint: fp.clone(),
        }
    }

    fn served(&self, entry: CacheEntry) -> ResultEnvelope {
        self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        ResultEnvelope::served(entry)
    }

    async fn call_with_retries(
        &self,
        request: &RequestDescriptor,
        fingerprint: Option<Fingerprint>,
        state: &mut AttemptState,
    ) -> ResultEnvelope {
        let target = request.target();
        let ceiling = request.max_attempts();

        loop {
            state.stage = "waiting for a rate-limit permit";
            let permit = match self.limiter.acquire(&target, request.timeout()).await {
                Ok(permit) => permit,
                Err(err) => {
                    warn!(error = %err, "no rate-limit permit");
                    return ResultEnvelope::failure(&err, state.attempts, state.backoff_ms(), fingerprint);
                }
            };

            state.stage = "calling upstream";
            state.attempts += 1;
            self.stats.network_calls.fetch_add(1, Ordering::Relaxed);
            let result = self.transport.send(request, request.timeout()).await;
            drop(permit);

            let err = match result {
                Ok(response) if classify_status(response.status) == StatusClass::Success => {
                    if let Some(fp) = &fingerprint {
                        let entry = CacheEntry::for_response(
                            request,
                            fp.clone(),
                            response.status,
                            response.body.clone(),
                            Utc::now(),
                        )
                        .with_headers(response.headers.clone());
                        self.cache.store(entry).await;
                    }
                    return ResultEnvelope::success(
                        response,
                        state.attempts,
                        state.backoff_ms(),
                        fingerprint,
                    );
                }
                Ok(response) => classify::upstream_error(response),
                Err(e) => Error::Transport(e),
            };

            if !err.is_transient() {
                debug!(error = %err, attempt = state.attempts, "permanent failure");
                return ResultEnvelope::failure(&err, state.attempts, state.backoff_ms(), fingerprint);
            }

            let retry_after = match &err {
                Error::TransientUpstream { retry_after, .. } => *retry_after,
                _ => None,
            };
            let Some(delay) = self.backoff.next_delay(state.attempts, Some(ceiling), retry_after) else {
                let exhausted = Error::RetriesExhausted {
                    attempts: state.attempts,
                    last: Box::new(err),
                };
                return ResultEnvelope::failure(&exhausted, state.attempts, state.backoff_ms(), fingerprint);
            };

            if let Some(hint) = retry_after {
                self.limiter
                    .block_for(&target, hint.min(self.backoff.max_delay))
                    .await;
            }
            warn!(
                attempt = state.attempts,
                max_attempts = ceiling,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient upstream failure, backing off"
            );
            state.last_error = Some(err.to_string());
            state.stage = "backing off";
            state.waited += delay;
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.to_stats()
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn single_flight(&self) -> bool {
        self.flights.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, MemoryStore};
    use crate::resilience::RateLimiterConfig;
    use crate::transport::{TransportError, UpstreamResponse};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Replays scripted responses; repeats the last one when the script runs out.
    struct Scripted {
        script: StdMutex<VecDeque<std::result::Result<UpstreamResponse, TransportError>>>,
        calls: AtomicU64,
        delay: Duration,
    }

    impl Scripted {
        fn new(responses: Vec<std::result::Result<UpstreamResponse, TransportError>>) -> Self {
            Self {
                script: StdMutex::new(responses.into()),
                calls: AtomicU64::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(
            &self,
            _request: &RequestDescriptor,
            _timeout: Duration,
        ) -> std::result::Result<UpstreamResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                match script.front().unwrap() {
                    Ok(r) => Ok(r.clone()),
                    Err(e) => Err(TransportError::Other(e.to_string())),
                }
            }
        }
    }

    fn dispatcher(transport: Arc<Scripted>, single_flight: bool) -> Dispatcher {
        Dispatcher::from_parts(
            Arc::new(CacheManager::new(CacheConfig::default(), Arc::new(MemoryStore::new(100)))),
            Arc::new(RateLimiter::new(RateLimiterConfig::new().with_max_concurrent(4))),
            transport,
            BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5)).with_jitter(false),
            single_flight,
        )
    }

    fn get(url: &str) -> RequestDescriptor {
        RequestDescriptor::builder(url).build().unwrap()
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let transport = Arc::new(Scripted::new(vec![
            Ok(UpstreamResponse::new(502, "")),
            Err(TransportError::Timeout(Duration::from_secs(1))),
            Ok(UpstreamResponse::new(200, "ok")),
        ]));
        let d = dispatcher(transport.clone(), false);
        let env = d.dispatch(&get("https://api.example.com/x")).await;
        assert_eq!(env.outcome, OutcomeKind::Success);
        assert_eq!(env.attempts, 3);
        assert_eq!(env.backoff_ms, 3);
        assert_eq!(transport.calls(), 3);
        assert_eq!(d.stats().retries, 2);
    }

    #[tokio::test]
    async fn test_non_transient_transport_error_is_permanent() {
        let transport = Arc::new(Scripted::new(vec![Err(TransportError::InvalidRequest(
            "bad header".into(),
        ))]));
        let d = dispatcher(transport.clone(), false);
        let env = d.dispatch(&get("https://api.example.com/x")).await;
        assert_eq!(env.outcome, OutcomeKind::PermanentUpstreamFailure);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_uncached_request_has_no_fingerprint() {
        let transport = Arc::new(Scripted::new(vec![Ok(UpstreamResponse::new(200, "ok"))]));
        let d = dispatcher(transport.clone(), false);
        let req = RequestDescriptor::builder("https://api.example.com/x")
            .use_cache(false)
            .build()
            .unwrap();
        assert!(d.dispatch(&req).await.fingerprint.is_none());
        d.dispatch(&req).await;
        assert_eq!(transport.calls(), 2);
        assert_eq!(d.cache().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_identical_requests() {
        let mut scripted = Scripted::new(vec![Ok(UpstreamResponse::new(200, "once"))]);
        scripted.delay = Duration::from_millis(50);
        let transport = Arc::new(scripted);
        let d = Arc::new(dispatcher(transport.clone(), true));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..5 {
            let d = Arc::clone(&d);
            tasks.spawn(async move { d.dispatch(&get("https://api.example.com/same")).await });
        }
        let mut from_cache = 0;
        while let Some(env) = tasks.join_next().await {
            let env = env.unwrap();
            assert_eq!(env.body.as_deref(), Some("once"));
            if env.from_cache {
                from_cache += 1;
            }
        }
        assert_eq!(transport.calls(), 1);
        assert_eq!(from_cache, 4);
        assert!(d.flights.as_ref().unwrap().is_empty());
    }
}
