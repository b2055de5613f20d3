use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::discovery::{self, TargetSource};
use crate::errors::{ProbeFailure, ScanError};
use crate::limiter::{HostLimiter, HostPermits, TokenBucket};
use crate::memory::{CacheEvict, MemoryGovernor};
use crate::model::{ProbeOutcome, ProgressEvent, ScanResult, Target};
use crate::modules::filter::FilterModule;
use crate::modules::geo::GeoModule;
use crate::modules::persist::{MemoryStore, PersistModule, ServerStore};
use crate::modules::webhook::WebhookModule;
use crate::modules::{ModuleContext, ModulePipeline, ScannerModule};
use crate::parser::{self, ParseOptions};
use crate::protocol::ProtocolClient;
use crate::stats::{ProgressPublisher, ScanStats};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Worker backoff after a descriptor-exhaustion failure.
const EXHAUSTION_BACKOFF: Duration = Duration::from_secs(1);
/// This many exhaustion hits inside [`EXHAUSTION_WINDOW`] end the scan.
const EXHAUSTION_LIMIT: usize = 3;
const EXHAUSTION_WINDOW: Duration = Duration::from_secs(10);

/// Main scan orchestrator: owns the target channel, the worker pool, the
/// module pipeline, the pacing state and the shutdown machinery.
pub struct ScanEngine {
    config: Arc<Config>,
    stats: Arc<ScanStats>,
    blacklist: Arc<Blacklist>,
    global_limiter: Arc<TokenBucket>,
    host_limiter: Arc<HostLimiter>,
    host_permits: Arc<HostPermits>,
    protocol: ProtocolClient,
    pipeline: Option<ModulePipeline>,
    geo_module: Arc<GeoModule>,
    progress_tx: broadcast::Sender<ProgressEvent>,
    /// Soft stop: producer halts, workers drain
    shutdown: CancellationToken,
    /// Hard stop: in-flight probes are abandoned (grace period expired)
    abort: CancellationToken,
    /// Stops background tasks (publisher, pollers, flushers)
    background: CancellationToken,
}

impl ScanEngine {
    /// Build an engine with the default module chain
    /// (filter → geolocation → persist-to-memory → webhook).
    pub fn new(config: Config) -> Result<Self, ScanError> {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Build an engine writing through the given persistence sink.
    pub fn with_store(config: Config, store: Arc<dyn ServerStore>) -> Result<Self, ScanError> {
        config.validate()?;
        let config = Arc::new(config);
        let stats = ScanStats::new();
        let blacklist = Arc::new(Blacklist::from_config(&config.blacklist)?);

        let parse_opts = ParseOptions {
            store_favicon_bytes: config.storage.store_favicons,
        };
        let protocol = ProtocolClient::new(&config.scanner, &config.advanced, parse_opts);

        let geo_module = Arc::new(GeoModule::new(config.geolocation.clone()));
        let mut pipeline = ModulePipeline::new(Arc::clone(&stats));
        pipeline.add_module(Arc::new(FilterModule::new(Arc::clone(&blacklist))));
        pipeline.add_module(Arc::clone(&geo_module) as Arc<dyn ScannerModule>);
        pipeline.add_module(Arc::new(PersistModule::new(store, config.storage.clone())));
        pipeline.add_module(Arc::new(WebhookModule::new(config.webhook.clone())));

        Ok(Self {
            stats,
            blacklist,
            global_limiter: Arc::new(TokenBucket::new(
                config.scanner.rate_limit,
                config.scanner.rate_limit,
            )),
            host_limiter: Arc::new(HostLimiter::new(
                config.scanner.per_host_rate_limit,
                config.scanner.burst_allowance,
            )),
            host_permits: Arc::new(HostPermits::new(config.concurrency.max_connections_per_host)),
            protocol,
            pipeline: Some(pipeline),
            geo_module,
            progress_tx: broadcast::channel(64).0,
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            background: CancellationToken::new(),
            config,
        })
    }

    /// Register an extra pipeline hook after the default chain.
    pub fn add_module(&mut self, module: Arc<dyn ScannerModule>) {
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.add_module(module);
        }
    }

    /// Token an embedder cancels to stop the scan gracefully.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<ScanStats> {
        self.stats.clone()
    }

    /// Run a scan over the given target specification to completion.
    pub async fn run(&mut self, spec: &str) -> Result<(), ScanError> {
        let mut pipeline = self
            .pipeline
            .take()
            .ok_or_else(|| ScanError::Other("engine already ran".to_string()))?;
        let source = discovery::build_source(spec, &self.config.discovery, &self.config.advanced)?;
        let universe = source.size_hint();
        info!(spec, source = source.name(), ?universe, "starting scan");

        // modules come up before anything moves
        let ctx = ModuleContext {
            config: Arc::clone(&self.config),
            stats: Arc::clone(&self.stats),
            cancel: self.background.clone(),
        };
        pipeline.initialize(&ctx).await?;
        if self.config.blacklist.auto_update {
            Arc::clone(&self.blacklist).spawn_auto_update(self.background.clone());
        }

        // governor watches RSS and sweeps the limiter and geo caches
        let caches: Vec<Arc<dyn CacheEvict>> = vec![
            Arc::clone(&self.host_limiter) as Arc<dyn CacheEvict>,
            Arc::clone(&self.host_permits) as Arc<dyn CacheEvict>,
            Arc::clone(&self.geo_module) as Arc<dyn CacheEvict>,
        ];
        let governor = MemoryGovernor::new(self.config.memory.clone(), caches);
        let paused = governor.spawn(self.shutdown.clone(), self.background.clone());

        let publisher = ProgressPublisher::with_sender(
            Arc::clone(&self.stats),
            self.config.ui.refresh_rate,
            universe,
            self.progress_tx.clone(),
        );
        publisher.spawn(self.background.clone());

        let started = Instant::now();
        let capacity = self.config.discovery.batch_size.saturating_mul(4).max(4);
        let (tx, rx) = mpsc::channel::<Target>(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let producer = spawn_producer(source, tx, paused, self.shutdown.clone());

        let exhaustion = Arc::new(Mutex::new(VecDeque::<Instant>::new()));
        let pipeline = Arc::new(pipeline);

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.concurrency.max_concurrent {
            workers.spawn(worker_loop(WorkerShared {
                worker_id,
                rx: Arc::clone(&rx),
                blacklist: Arc::clone(&self.blacklist),
                global_limiter: Arc::clone(&self.global_limiter),
                host_limiter: Arc::clone(&self.host_limiter),
                host_permits: Arc::clone(&self.host_permits),
                protocol: self.protocol.clone(),
                pipeline: Arc::clone(&pipeline),
                stats: Arc::clone(&self.stats),
                shutdown: self.shutdown.clone(),
                abort: self.abort.clone(),
                exhaustion: Arc::clone(&exhaustion),
                probe_budget: probe_budget(&self.config),
            }));
        }

        // Drain workers; once a soft shutdown lands, the grace clock runs
        // and expiry abandons whatever is still in flight.
        let grace = Duration::from_secs(self.config.advanced.grace_period.max(1));
        let shutdown = self.shutdown.clone();
        let graceful = async {
            while workers.join_next().await.is_some() {}
        };
        tokio::pin!(graceful);
        tokio::select! {
            _ = &mut graceful => {}
            _ = async {
                shutdown.cancelled().await;
                tokio::time::sleep(grace).await;
            } => {
                warn!("grace period expired, aborting in-flight probes");
                self.abort.cancel();
                graceful.await;
            }
        }

        drop(rx);
        let _ = producer.await;

        // flush hooks, then stop the background tasks
        pipeline.finalize().await;
        self.background.cancel();

        info!(
            elapsed_secs = started.elapsed().as_secs(),
            summary = %self.stats.summary(),
            "scan finished"
        );
        Ok(())
    }

    /// Subscribe to the progress event stream; valid before or during `run`.
    pub fn progress_channel(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }
}

/// Total wall-clock budget one target may cost, used as the pacing deadline.
fn probe_budget(config: &Config) -> Duration {
    let per_protocol =
        config.scanner.timeout_duration() * (config.scanner.retries + 1).max(1);
    per_protocol * config.scanner.protocol_candidates().len().max(1) as u32
}

fn spawn_producer(
    mut source: Box<dyn TargetSource>,
    tx: mpsc::Sender<Target>,
    mut paused: tokio::sync::watch::Receiver<bool>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut produced: u64 = 0;
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            // hold while the governor has the producer paused
            while *paused.borrow_and_update() {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    result = paused.changed() => {
                        if result.is_err() {
                            break;
                        }
                    }
                }
            }
            let target = match source.next_target().await {
                Ok(Some(target)) => target,
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "target source failed, ending production");
                    break;
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                sent = tx.send(target) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
            produced += 1;
        }
        debug!(produced, "producer finished");
        // tx drops here, closing the channel; workers drain what is queued
    })
}

struct WorkerShared {
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Target>>>,
    blacklist: Arc<Blacklist>,
    global_limiter: Arc<TokenBucket>,
    host_limiter: Arc<HostLimiter>,
    host_permits: Arc<HostPermits>,
    protocol: ProtocolClient,
    pipeline: Arc<ModulePipeline>,
    stats: Arc<ScanStats>,
    shutdown: CancellationToken,
    abort: CancellationToken,
    exhaustion: Arc<Mutex<VecDeque<Instant>>>,
    probe_budget: Duration,
}

async fn worker_loop(shared: WorkerShared) {
    loop {
        // pull one target; channel close means drain is done
        let target = {
            let mut rx = shared.rx.lock().await;
            tokio::select! {
                _ = shared.abort.cancelled() => None,
                target = rx.recv() => target,
            }
        };
        let Some(target) = target else {
            break;
        };

        let outcome = probe_one(&shared, &target).await;
        let Some(outcome) = outcome else {
            // aborted mid-probe; the scan was cancelled, nothing recorded
            break;
        };
        shared.stats.record_outcome(&outcome);

        match outcome {
            ProbeOutcome::Success(doc, latency) => {
                let result =
                    parser::build_result(target.addr, target.port, doc, latency.as_millis() as u64);
                finish_result(&shared, result).await;
            }
            ProbeOutcome::LegacyDetected(doc) => {
                let result = parser::build_result(target.addr, target.port, doc, 0);
                finish_result(&shared, result).await;
            }
            ProbeOutcome::Failed(ProbeFailure::Exhausted) => {
                if note_exhaustion(&shared).await {
                    warn!("repeated descriptor exhaustion, requesting shutdown");
                    shared.shutdown.cancel();
                }
                tokio::time::sleep(EXHAUSTION_BACKOFF).await;
            }
            _ => {}
        }
    }
    debug!(worker = shared.worker_id, "worker exited");
}

/// Run the full per-target sequence: blacklist, pacing, permit, probe.
/// `None` means the probe was abandoned by a hard abort.
async fn probe_one(shared: &WorkerShared, target: &Target) -> Option<ProbeOutcome> {
    if shared.blacklist.is_blacklisted(target.addr) {
        return Some(ProbeOutcome::BlacklistSkipped);
    }

    let deadline = Instant::now() + shared.probe_budget;
    let acquired = tokio::select! {
        _ = shared.abort.cancelled() => return None,
        ok = shared.global_limiter.acquire_before(deadline) => ok,
    };
    if !acquired {
        return Some(ProbeOutcome::RateLimited);
    }
    let acquired = tokio::select! {
        _ = shared.abort.cancelled() => return None,
        ok = shared.host_limiter.acquire_before(target.addr, deadline) => ok,
    };
    if !acquired {
        return Some(ProbeOutcome::RateLimited);
    }

    let _permit = tokio::select! {
        _ = shared.abort.cancelled() => return None,
        permit = shared.host_permits.acquire(target.addr) => permit,
    };

    tokio::select! {
        _ = shared.abort.cancelled() => None,
        outcome = shared.protocol.probe(target) => Some(outcome),
    }
}

async fn finish_result(shared: &WorkerShared, mut result: ScanResult) {
    debug!(
        target = %result.socket_addr(),
        software = result.software.as_str(),
        version = %result.version_string,
        "server found"
    );
    shared.pipeline.process(&mut result).await;
    shared.stats.note_success(Arc::new(result));
}

/// Record one exhaustion event; true when the window limit is crossed.
async fn note_exhaustion(shared: &WorkerShared) -> bool {
    let mut events = shared.exhaustion.lock().await;
    let now = Instant::now();
    events.push_back(now);
    while let Some(front) = events.front() {
        if now.duration_since(*front) > EXHAUSTION_WINDOW {
            events.pop_front();
        } else {
            break;
        }
    }
    events.len() >= EXHAUSTION_LIMIT
}
