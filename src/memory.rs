//! Memory pressure governor.
//!
//! Samples process RSS once a second and steers the scan instead of letting
//! the allocator find out the hard way: above the high watermark the target
//! producer is paused, close to the ceiling the per-host limiter and caches
//! are evicted, and at the ceiling the scan shuts down gracefully.

use crate::config::MemoryConfig;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Producer pauses above this fraction of the configured cap.
const PAUSE_AT: f64 = 0.85;
/// Producer resumes below this fraction.
const RESUME_AT: f64 = 0.70;
/// Caches are evicted above this fraction.
const EVICT_AT: f64 = 0.95;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Something holding evictable per-entry state (limiter buckets, geo cache).
#[async_trait]
pub trait CacheEvict: Send + Sync {
    async fn evict_stale(&self) -> usize;
    fn cache_name(&self) -> &'static str;
}

type Sampler = Box<dyn Fn() -> Option<u64> + Send>;

pub struct MemoryGovernor {
    config: MemoryConfig,
    caches: Vec<Arc<dyn CacheEvict>>,
    sampler: Sampler,
}

impl MemoryGovernor {
    pub fn new(config: MemoryConfig, caches: Vec<Arc<dyn CacheEvict>>) -> Self {
        Self {
            config,
            caches,
            sampler: Box::new(rss_bytes),
        }
    }

    /// Replace the RSS sampler; tests drive the governor with synthetic values.
    #[doc(hidden)]
    pub fn with_sampler(mut self, sampler: impl Fn() -> Option<u64> + Send + 'static) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    /// Run the sampling loop. The returned receiver reads `true` while the
    /// producer should hold off; `shutdown` is cancelled at the hard ceiling.
    pub fn spawn(
        self,
        shutdown: CancellationToken,
        cancel: CancellationToken,
    ) -> watch::Receiver<bool> {
        let (pause_tx, pause_rx) = watch::channel(false);
        if !self.config.enable_monitoring {
            debug!("memory monitoring disabled");
            return pause_rx;
        }
        let cap = self.config.max_memory_mb.saturating_mul(1024 * 1024) as f64;
        let gc_interval = self.config.gc_interval.max(1);
        tokio::spawn(async move {
            let mut paused = false;
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(SAMPLE_INTERVAL) => {}
                }
                ticks += 1;

                // periodic maintenance regardless of pressure
                if ticks % gc_interval == 0 {
                    for cache in &self.caches {
                        let evicted = cache.evict_stale().await;
                        if evicted > 0 {
                            debug!(cache = cache.cache_name(), evicted, "maintenance sweep");
                        }
                    }
                }

                let Some(rss) = (self.sampler)() else {
                    continue;
                };
                let usage = rss as f64 / cap;

                if usage >= 1.0 {
                    warn!(
                        rss_mb = rss / (1024 * 1024),
                        cap_mb = self.config.max_memory_mb,
                        "memory ceiling reached, initiating shutdown"
                    );
                    shutdown.cancel();
                    break;
                }
                if usage > EVICT_AT {
                    for cache in &self.caches {
                        let evicted = cache.evict_stale().await;
                        warn!(cache = cache.cache_name(), evicted, "pressure eviction");
                    }
                }
                if !paused && usage > PAUSE_AT {
                    paused = true;
                    info!(usage_pct = (usage * 100.0) as u64, "pausing producer");
                    let _ = pause_tx.send(true);
                } else if paused && usage < RESUME_AT {
                    paused = false;
                    info!(usage_pct = (usage * 100.0) as u64, "resuming producer");
                    let _ = pause_tx.send(false);
                }
            }
        });
        pause_rx
    }
}

/// Current RSS from `/proc/self/status` (`VmRSS` in kB). `None` off Linux
/// or when procfs is unavailable; the governor then idles.
pub fn rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}
