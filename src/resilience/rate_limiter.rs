use crate::{Error, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Concurrent calls allowed per target.
    pub max_concurrent: usize,
    /// Calls per second per target; `None` disables the token bucket.
    pub rps: Option<f64>,
    /// Maximum burst size (tokens).
    pub burst: f64,
}

impl RateLimiterConfig {
    pub fn new() -> Self {
        Self {
            max_concurrent: 8,
            rps: None,
            burst: 1.0,
        }
    }

    /// Config with a token bucket of `rps`, burst of one second's worth (at least 1).
    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps < 0.0 {
            return None;
        }
        Some(Self::new().with_rps(rps))
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    /// Set the refill rate. Zero, negative or non-finite rates disable the bucket.
    pub fn with_rps(mut self, rps: f64) -> Self {
        if rps.is_finite() && rps > 0.0 {
            self.rps = Some(rps);
            self.burst = rps.max(1.0);
        } else {
            self.rps = None;
        }
        self
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = f64::from(burst.max(1));
        self
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateWindowSnapshot {
    pub target: String,
    pub max_concurrent: usize,
    pub in_flight: usize,
    pub tokens: Option<f64>,
    /// Remaining time the target is paused for (ms), if paused.
    pub blocked_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimiterStats {
    pub requested: u64,
    pub granted: u64,
    pub rejected: u64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
    /// Set when the upstream asked us to back off (e.g. `Retry-After`).
    blocked_until: Option<Instant>,
}

/// Admission state for one target.
#[derive(Debug)]
struct RateWindow {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    bucket: Mutex<BucketState>,
}

impl RateWindow {
    fn new(cfg: &RateLimiterConfig) -> Self {
        let max_concurrent = cfg.max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            bucket: Mutex::new(BucketState {
                tokens: cfg.burst,
                last: Instant::now(),
                blocked_until: None,
            }),
        }
    }

    fn refill_locked(cfg: &RateLimiterConfig, st: &mut BucketState, now: Instant) {
        if let Some(rps) = cfg.rps {
            let elapsed = now.duration_since(st.last).as_secs_f64();
            if elapsed > 0.0 {
                st.tokens = (st.tokens + elapsed * rps).min(cfg.burst);
                st.last = now;
            }
        }
    }

    /// Take a token if one is available, otherwise report how long to wait.
    fn poll_locked(cfg: &RateLimiterConfig, st: &mut BucketState, now: Instant) -> Option<Duration> {
        if let Some(until) = st.blocked_until {
            if until > now {
                return Some(until.duration_since(now));
            }
            st.blocked_until = None;
        }
        let rps = cfg.rps?;
        Self::refill_locked(cfg, st, now);
        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            return None;
        }
        let missing = 1.0 - st.tokens;
        Some(Duration::from_secs_f64(missing / rps))
    }

    /// No permit out, no pause pending and a full bucket: dropping the window
    /// loses nothing. A locked bucket counts as busy.
    fn is_idle(&self, cfg: &RateLimiterConfig, now: Instant) -> bool {
        if self.permits.available_permits() < self.max_concurrent {
            return false;
        }
        let Ok(mut st) = self.bucket.try_lock() else {
            return false;
        };
        if st.blocked_until.is_some_and(|until| until > now) {
            return false;
        }
        Self::refill_locked(cfg, &mut st, now);
        cfg.rps.is_none() || st.tokens >= cfg.burst
    }

    async fn take_token(&self, cfg: &RateLimiterConfig) {
        loop {
            let wait = {
                let mut st = self.bucket.lock().await;
                Self::poll_locked(cfg, &mut st, Instant::now())
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d.max(Duration::from_millis(1))).await,
            }
        }
    }
}

/// Held while a call to a target is in flight. Dropping it releases the slot,
/// whether the call succeeded, failed, timed out or was cancelled.
#[derive(Debug)]
pub struct RatePermit {
    target: String,
    _permit: OwnedSemaphorePermit,
}

impl RatePermit {
    pub fn target(&self) -> &str {
        &self.target
    }
}

/// Per-target admission gate.
///
/// Each target (endpoint host) gets a fixed pool of concurrent-call permits
/// and, when `rps` is configured, a token bucket on top. Acquisition takes a
/// permit first and then a token, so a wait that times out on the bucket
/// gives its permit back.
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    windows: DashMap<String, Arc<RateWindow>>,
    requested: AtomicU64,
    granted: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        Self {
            cfg,
            windows: DashMap::new(),
            requested: AtomicU64::new(0),
            granted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn window(&self, target: &str) -> Arc<RateWindow> {
        if let Some(w) = self.windows.get(target) {
            return Arc::clone(w.value());
        }
        Arc::clone(
            self.windows
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(RateWindow::new(&self.cfg)))
                .value(),
        )
    }

    /// Acquire a permit for `target`, waiting at most `wait`.
    ///
    /// Fails with [`Error::RateLimited`] when no capacity frees up in time.
    pub async fn acquire(&self, target: &str, wait: Duration) -> Result<RatePermit> {
        self.requested.fetch_add(1, Ordering::Relaxed);
        let window = self.window(target);
        let started = Instant::now();

        let admitted = tokio::time::timeout(wait, async {
            let permit = Arc::clone(&window.permits).acquire_owned().await;
            window.take_token(&self.cfg).await;
            permit
        })
        .await;

        match admitted {
            Ok(Ok(permit)) => {
                self.granted.fetch_add(1, Ordering::Relaxed);
                Ok(RatePermit {
                    target: target.to_string(),
                    _permit: permit,
                })
            }
            // The semaphore is never closed; treat it like running out of time.
            Ok(Err(_)) | Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(target_host = target, waited_ms = started.elapsed().as_millis() as u64, "rate limiter wait expired");
                Err(Error::RateLimited {
                    target: target.to_string(),
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Non-blocking variant: `None` means the call would have to wait.
    pub async fn try_acquire(&self, target: &str) -> Option<RatePermit> {
        self.requested.fetch_add(1, Ordering::Relaxed);
        let window = self.window(target);
        let permit = match Arc::clone(&window.permits).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let admitted = {
            let mut st = window.bucket.lock().await;
            RateWindow::poll_locked(&self.cfg, &mut st, Instant::now()).is_none()
        };
        if admitted {
            self.granted.fetch_add(1, Ordering::Relaxed);
            Some(RatePermit {
                target: target.to_string(),
                _permit: permit,
            })
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Pause admissions to `target` for `duration` (extends, never shortens, a pause).
    pub async fn block_for(&self, target: &str, duration: Duration) {
        let window = self.window(target);
        let mut st = window.bucket.lock().await;
        let until = Instant::now() + duration;
        st.blocked_until = Some(st.blocked_until.map_or(until, |cur| cur.max(until)));
    }

    pub async fn snapshot(&self, target: &str) -> Option<RateWindowSnapshot> {
        let window = Arc::clone(self.windows.get(target)?.value());
        let now = Instant::now();
        let mut st = window.bucket.lock().await;
        RateWindow::refill_locked(&self.cfg, &mut st, now);
        let blocked_ms = st
            .blocked_until
            .filter(|until| *until > now)
            .map(|until| until.duration_since(now).as_millis() as u64);
        Some(RateWindowSnapshot {
            target: target.to_string(),
            max_concurrent: window.max_concurrent,
            in_flight: window
                .max_concurrent
                .saturating_sub(window.permits.available_permits()),
            tokens: self.cfg.rps.map(|_| st.tokens),
            blocked_ms,
        })
    }

    /// Drop windows for targets with nothing in flight and nothing owed.
    ///
    /// A window still referenced by a waiting caller is kept. Returns the
    /// number of windows removed.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|_, window| Arc::strong_count(window) > 1 || !window.is_idle(&self.cfg, now));
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.windows.len(), "pruned idle rate windows");
        }
        removed
    }

    /// Run [`prune_idle`](Self::prune_idle) every `period` until the handle is aborted.
    pub fn spawn_pruner(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = period.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.prune_idle();
            }
        })
    }

    /// Number of targets currently tracked.
    pub fn tracked_targets(&self) -> usize {
        self.windows.len()
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            requested: self.requested.load(Ordering::Relaxed),
            granted: self.granted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}
