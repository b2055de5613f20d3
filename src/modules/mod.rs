use crate::config::Config;
use crate::errors::ScanError;
use crate::model::ScanResult;
use crate::stats::ScanStats;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// Submodule declarations
pub mod filter;
pub mod geo;
pub mod persist;
pub mod webhook;

/// Every pipeline hook gets at most this long per result.
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Capabilities handed to modules instead of a scanner back-pointer:
/// counters, the config, and a token for background tasks a module spawns.
#[derive(Clone)]
pub struct ModuleContext {
    pub config: Arc<Config>,
    pub stats: Arc<ScanStats>,
    pub cancel: CancellationToken,
}

/// What a hook wants done with the result it just saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleAction {
    /// Hand the result to the next hook
    Continue,
    /// Stop processing this result
    Drop,
}

/// Outcome of a module's initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleInit {
    Active,
    /// Dependency unavailable; skip this module for the whole scan
    Disabled,
}

/// One processing hook in the per-result pipeline.
///
/// Each result flows through the hooks in declared order. A hook failure is
/// logged and the result continues; only an explicit [`ModuleAction::Drop`]
/// stops it.
#[async_trait]
pub trait ScannerModule: Send + Sync {
    /// Return a human-readable name for this module
    fn name(&self) -> &'static str;

    /// Startup rank: lower initializes earlier, finalization runs in the
    /// reverse of this order. Processing order stays the declared one.
    fn init_order(&self) -> u8 {
        50
    }

    /// Prepare the module. `Disabled` skips it with a warning; an error
    /// aborts startup (a required dependency was missing).
    async fn initialize(&self, ctx: &ModuleContext) -> Result<ModuleInit, ScanError>;

    /// Process one result, possibly enriching it in place
    async fn process(&self, result: &mut ScanResult) -> Result<ModuleAction, ScanError>;

    /// Flush buffers and release resources when scanning is complete
    async fn finalize(&self) -> Result<(), ScanError>;
}

/// Ordered hook chain over scan results.
pub struct ModulePipeline {
    modules: Vec<Arc<dyn ScannerModule>>,
    active: Vec<Arc<dyn ScannerModule>>,
    stats: Arc<ScanStats>,
}

impl ModulePipeline {
    pub fn new(stats: Arc<ScanStats>) -> Self {
        Self {
            modules: Vec::new(),
            active: Vec::new(),
            stats,
        }
    }

    /// Add a processing module; order of registration is processing order.
    pub fn add_module(&mut self, module: Arc<dyn ScannerModule>) {
        self.modules.push(module);
    }

    /// Initialize every module in startup order, keeping the ones that came
    /// up; the processing order stays the declared one. A hard error
    /// propagates and aborts startup.
    pub async fn initialize(&mut self, ctx: &ModuleContext) -> Result<(), ScanError> {
        self.active.clear();
        let mut startup: Vec<Arc<dyn ScannerModule>> = self.modules.clone();
        startup.sort_by_key(|module| module.init_order());

        let mut up = Vec::new();
        for module in &startup {
            match module.initialize(ctx).await? {
                ModuleInit::Active => {
                    debug!(module = module.name(), "module initialized");
                    up.push(module.name());
                }
                ModuleInit::Disabled => {
                    warn!(module = module.name(), "module disabled, skipping");
                }
            }
        }
        self.active = self
            .modules
            .iter()
            .filter(|module| up.contains(&module.name()))
            .cloned()
            .collect();
        Ok(())
    }

    /// Run one result through the active hooks in order.
    pub async fn process(&self, result: &mut ScanResult) {
        for module in &self.active {
            match tokio::time::timeout(HOOK_TIMEOUT, module.process(result)).await {
                Ok(Ok(ModuleAction::Continue)) => {}
                Ok(Ok(ModuleAction::Drop)) => {
                    self.stats
                        .pipeline_dropped
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    debug!(module = module.name(), target = %result.socket_addr(), "result dropped");
                    return;
                }
                Ok(Err(err)) => {
                    warn!(module = module.name(), %err, "module processing failed");
                }
                Err(_) => {
                    warn!(module = module.name(), "module hook timed out");
                }
            }
        }
    }

    /// Finalize active modules in reverse init order.
    pub async fn finalize(&self) {
        let mut order: Vec<Arc<dyn ScannerModule>> = self.active.clone();
        order.sort_by_key(|module| std::cmp::Reverse(module.init_order()));
        for module in &order {
            if let Err(err) = module.finalize().await {
                warn!(module = module.name(), %err, "module finalization failed");
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
