use super::{ModuleAction, ModuleContext, ModuleInit, ScannerModule};
use crate::blacklist::Blacklist;
use crate::errors::ScanError;
use crate::model::ScanResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// A favicon hash showing up on more distinct endpoints than this smells
/// like a honeypot farm and gets filtered.
const FAVICON_FLOOD_LIMIT: u32 = 250;

/// First hook in the chain: drops results the rest of the pipeline should
/// never see. The blacklist is consulted again here because the file may
/// have been reloaded after the worker's pre-connect check.
pub struct FilterModule {
    blacklist: Arc<Blacklist>,
    favicon_counts: Mutex<HashMap<String, u32>>,
}

impl FilterModule {
    pub fn new(blacklist: Arc<Blacklist>) -> Self {
        Self {
            blacklist,
            favicon_counts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ScannerModule for FilterModule {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn init_order(&self) -> u8 {
        30
    }

    async fn initialize(&self, _ctx: &ModuleContext) -> Result<ModuleInit, ScanError> {
        Ok(ModuleInit::Active)
    }

    async fn process(&self, result: &mut ScanResult) -> Result<ModuleAction, ScanError> {
        if let Some(prefix) = self.blacklist.matches(result.ip) {
            debug!(target = %result.socket_addr(), %prefix, "filtered by reloaded blacklist");
            return Ok(ModuleAction::Drop);
        }

        // nonsense counters are a lie a parser upstream could not reject
        if result.players_online < 0 || result.players_max < 0 {
            debug!(target = %result.socket_addr(), "filtered for negative player counts");
            return Ok(ModuleAction::Drop);
        }

        if let Some(hash) = &result.favicon_hash {
            let mut counts = self.favicon_counts.lock().await;
            let count = counts.entry(hash.clone()).or_insert(0);
            *count += 1;
            if *count > FAVICON_FLOOD_LIMIT {
                debug!(target = %result.socket_addr(), %hash, "filtered repeated favicon flood");
                return Ok(ModuleAction::Drop);
            }
        }

        Ok(ModuleAction::Continue)
    }

    async fn finalize(&self) -> Result<(), ScanError> {
        Ok(())
    }
}
