//! Token-bucket pacing: one global bucket for the whole scan plus on-demand
//! per-host buckets that age out when a host has not been touched for a
//! while.
//!
//! Buckets refill linearly. Waiters queue on a `tokio::sync::Mutex`, whose
//! FIFO wakeups give acquisition fairness for free. An acquire that cannot
//! be served before the caller's deadline consumes nothing.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::debug;

/// Per-host buckets idle longer than this are dropped.
pub const HOST_BUCKET_IDLE: Duration = Duration::from_secs(300);

/// Linear-refill token bucket.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate: f64,
    capacity: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket refilling `rate` tokens per second, holding at most `capacity`.
    /// Starts full so the first burst goes out immediately.
    pub fn new(rate: u32, capacity: u32) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            rate: f64::from(rate.max(1)),
            capacity,
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Take one token, suspending until one accrues.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.refill(&mut state, now);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take one token only if it can be had before `deadline`. Returns
    /// `false`, consuming nothing, when the wait would outlive the deadline.
    pub async fn acquire_before(&self, deadline: Instant) -> bool {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                self.refill(&mut state, now);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return true;
                }
                let wait = Duration::from_secs_f64((1.0 - state.tokens) / self.rate);
                if now + wait > deadline {
                    return false;
                }
                wait
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens available right now, for stats and tests.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        state.tokens
    }
}

/// On-demand per-destination buckets keyed by address.
pub struct HostLimiter {
    buckets: Mutex<HashMap<IpAddr, HostBucket>>,
    rate: u32,
    burst: u32,
}

struct HostBucket {
    bucket: Arc<TokenBucket>,
    last_used: Instant,
}

impl HostLimiter {
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate,
            burst,
        }
    }

    async fn bucket_for(&self, addr: IpAddr) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().await;
        let entry = buckets.entry(addr).or_insert_with(|| HostBucket {
            bucket: Arc::new(TokenBucket::new(self.rate, self.burst)),
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();
        Arc::clone(&entry.bucket)
    }

    /// Take a token for `addr` before `deadline`; consumes nothing on refusal.
    pub async fn acquire_before(&self, addr: IpAddr, deadline: Instant) -> bool {
        self.bucket_for(addr).await.acquire_before(deadline).await
    }

    /// Drop buckets idle longer than `max_idle`. Returns how many went.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let before = buckets.len();
        buckets.retain(|_, entry| now.duration_since(entry.last_used) < max_idle);
        let evicted = before - buckets.len();
        if evicted > 0 {
            debug!(evicted, remaining = buckets.len(), "evicted idle host buckets");
        }
        evicted
    }

    pub async fn tracked_hosts(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

/// Per-host connection permits, capping sockets simultaneously open to one
/// destination.
pub struct HostPermits {
    semaphores: Mutex<HashMap<IpAddr, Arc<Semaphore>>>,
    per_host: usize,
}

impl HostPermits {
    pub fn new(per_host: usize) -> Self {
        Self {
            semaphores: Mutex::new(HashMap::new()),
            per_host: per_host.max(1),
        }
    }

    pub async fn acquire(&self, addr: IpAddr) -> tokio::sync::OwnedSemaphorePermit {
        let semaphore = {
            let mut semaphores = self.semaphores.lock().await;
            Arc::clone(
                semaphores
                    .entry(addr)
                    .or_insert_with(|| Arc::new(Semaphore::new(self.per_host))),
            )
        };
        semaphore
            .acquire_owned()
            .await
            .expect("host semaphore never closed")
    }

    /// Drop semaphores with no outstanding permits.
    pub async fn sweep(&self) {
        let mut semaphores = self.semaphores.lock().await;
        semaphores.retain(|_, sem| Arc::strong_count(sem) > 1);
    }
}

#[async_trait::async_trait]
impl crate::memory::CacheEvict for HostLimiter {
    async fn evict_stale(&self) -> usize {
        self.evict_idle(HOST_BUCKET_IDLE).await
    }

    fn cache_name(&self) -> &'static str {
        "host-limiter"
    }
}

#[async_trait::async_trait]
impl crate::memory::CacheEvict for HostPermits {
    async fn evict_stale(&self) -> usize {
        self.sweep().await;
        0
    }

    fn cache_name(&self) -> &'static str {
        "host-permits"
    }
}
