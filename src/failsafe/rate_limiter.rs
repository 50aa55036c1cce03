//! Keyed token-bucket rate limiting
//!
//! One governor bucket per key (source IP, user hash). Buckets that have not
//! been touched for `idle_expiry` are dropped by a periodic sweep so the map
//! stays bounded by the set of recently active keys.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorLimiter};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Bucket {
    limiter: DefaultDirectRateLimiter,
    last_access: Mutex<Instant>,
}

/// Rate limiter keyed by an arbitrary string
pub struct KeyedRateLimiter {
    enabled: bool,
    quota: Quota,
    idle_expiry: Duration,
    buckets: DashMap<String, Bucket>,
}

impl KeyedRateLimiter {
    /// Create a limiter allowing `rps` sustained and `burst` instantaneous requests per key
    #[must_use]
    pub fn new(rps: u32, burst: u32, idle_expiry: Duration) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(rps).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN));
        Self {
            enabled: true,
            quota,
            idle_expiry,
            buckets: DashMap::new(),
        }
    }

    /// A limiter that admits everything
    #[must_use]
    pub fn disabled() -> Self {
        let mut limiter = Self::new(1, 1, Duration::from_secs(60));
        limiter.enabled = false;
        limiter
    }

    /// Try to take one token for `key`
    pub fn check(&self, key: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            limiter: GovernorLimiter::direct(self.quota),
            last_access: Mutex::new(Instant::now()),
        });
        *bucket.last_access.lock() = Instant::now();
        bucket.limiter.check().is_ok()
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no keys are tracked
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop buckets idle for longer than the expiry; returns how many were dropped
    pub fn cleanup(&self) -> usize {
        let before = self.buckets.len();
        let expiry = self.idle_expiry;
        self.buckets
            .retain(|_, bucket| bucket.last_access.lock().elapsed() <= expiry);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(expired_count = removed, remaining = self.buckets.len(), "Cleaned up idle rate limiters");
        }
        removed
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until `shutdown` fires
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        limiter.cleanup();
                    }
                }
            }
        })
    }
}
