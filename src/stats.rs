//! Scan counters and the progress event publisher.
//!
//! The counter block is the only process-wide mutable state in the crate:
//! plain relaxed atomics bumped from workers and pipeline tasks, read by a
//! single publisher task that derives rates and fans events out on a
//! broadcast channel.

use crate::errors::ProbeFailure;
use crate::model::{ProbeOutcome, ProgressEvent, ScanResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Smoothing factor for the rate estimate.
const RATE_EMA_ALPHA: f64 = 0.2;

#[derive(Default)]
pub struct ScanStats {
    pub attempted: AtomicU64,
    pub found: AtomicU64,
    pub legacy_found: AtomicU64,
    pub timeouts: AtomicU64,
    pub refused: AtomicU64,
    pub resets: AtomicU64,
    pub unreachable: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub tls_unexpected: AtomicU64,
    pub exhausted: AtomicU64,
    pub blacklisted: AtomicU64,
    pub rate_limited: AtomicU64,
    pub pipeline_dropped: AtomicU64,
    pub store_errors: AtomicU64,
    last_success: Mutex<Option<Arc<ScanResult>>>,
}

impl ScanStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count a finished probe under the right bucket.
    pub fn record_outcome(&self, outcome: &ProbeOutcome) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
        match outcome {
            ProbeOutcome::Success(..) => {
                self.found.fetch_add(1, Ordering::Relaxed);
            }
            ProbeOutcome::LegacyDetected(_) => {
                self.found.fetch_add(1, Ordering::Relaxed);
                self.legacy_found.fetch_add(1, Ordering::Relaxed);
            }
            ProbeOutcome::Failed(failure) => {
                let counter = match failure {
                    ProbeFailure::Timeout => &self.timeouts,
                    ProbeFailure::Refused => &self.refused,
                    ProbeFailure::Reset => &self.resets,
                    ProbeFailure::Unreachable => &self.unreachable,
                    ProbeFailure::Protocol(_) => &self.protocol_errors,
                    ProbeFailure::TlsUnexpected => &self.tls_unexpected,
                    ProbeFailure::Exhausted => &self.exhausted,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
            ProbeOutcome::BlacklistSkipped => {
                self.blacklisted.fetch_add(1, Ordering::Relaxed);
            }
            ProbeOutcome::RateLimited => {
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn note_success(&self, result: Arc<ScanResult>) {
        *self.last_success.lock().expect("stats lock poisoned") = Some(result);
    }

    pub fn last_success(&self) -> Option<Arc<ScanResult>> {
        self.last_success
            .lock()
            .expect("stats lock poisoned")
            .clone()
    }

    pub fn failed_total(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
            + self.refused.load(Ordering::Relaxed)
            + self.resets.load(Ordering::Relaxed)
            + self.unreachable.load(Ordering::Relaxed)
            + self.protocol_errors.load(Ordering::Relaxed)
            + self.tls_unexpected.load(Ordering::Relaxed)
            + self.exhausted.load(Ordering::Relaxed)
    }

    /// One-line counters for the shutdown summary.
    pub fn summary(&self) -> String {
        format!(
            "attempted {} | found {} (legacy {}) | timeout {} | refused {} | reset {} | unreachable {} | protocol {} | tls {} | blacklisted {} | rate-limited {}",
            self.attempted.load(Ordering::Relaxed),
            self.found.load(Ordering::Relaxed),
            self.legacy_found.load(Ordering::Relaxed),
            self.timeouts.load(Ordering::Relaxed),
            self.refused.load(Ordering::Relaxed),
            self.resets.load(Ordering::Relaxed),
            self.unreachable.load(Ordering::Relaxed),
            self.protocol_errors.load(Ordering::Relaxed),
            self.tls_unexpected.load(Ordering::Relaxed),
            self.blacklisted.load(Ordering::Relaxed),
            self.rate_limited.load(Ordering::Relaxed),
        )
    }
}

/// Periodically derive rate/ETA from the counters and broadcast a snapshot.
pub struct ProgressPublisher {
    stats: Arc<ScanStats>,
    sender: broadcast::Sender<ProgressEvent>,
    refresh_rate: u32,
    universe: Option<u64>,
}

impl ProgressPublisher {
    pub fn new(stats: Arc<ScanStats>, refresh_rate: u32, universe: Option<u64>) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self::with_sender(stats, refresh_rate, universe, sender)
    }

    /// Publish over an existing broadcast channel, so subscriptions taken
    /// before the scan starts keep working.
    pub fn with_sender(
        stats: Arc<ScanStats>,
        refresh_rate: u32,
        universe: Option<u64>,
        sender: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            stats,
            sender,
            refresh_rate: refresh_rate.max(1),
            universe,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn spawn(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let stats = Arc::clone(&self.stats);
        let sender = self.sender.clone();
        let interval = Duration::from_secs_f64(1.0 / f64::from(self.refresh_rate));
        let universe = self.universe;
        tokio::spawn(async move {
            let mut ema = 0.0_f64;
            let mut last_attempted = 0_u64;
            let mut last_tick = Instant::now();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let now = Instant::now();
                let elapsed = now.duration_since(last_tick).as_secs_f64().max(1e-6);
                last_tick = now;

                let attempted = stats.attempted.load(Ordering::Relaxed);
                let instant_rate = (attempted - last_attempted) as f64 / elapsed;
                last_attempted = attempted;
                ema = RATE_EMA_ALPHA * instant_rate + (1.0 - RATE_EMA_ALPHA) * ema;

                let eta_seconds = universe.and_then(|total| {
                    let remaining = total.saturating_sub(attempted);
                    (ema > 0.01).then(|| (remaining as f64 / ema) as u64)
                });

                // fine if nobody is listening
                let _ = sender.send(ProgressEvent {
                    attempted,
                    succeeded: stats.found.load(Ordering::Relaxed),
                    failed: stats.failed_total(),
                    blacklisted: stats.blacklisted.load(Ordering::Relaxed),
                    rate_eps: ema,
                    eta_seconds,
                    last_success: stats.last_success(),
                });
            }
        })
    }
}
