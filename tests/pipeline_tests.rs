use async_trait::async_trait;
use craftscan::config::{Config, StorageConfig};
use craftscan::errors::ScanError;
use craftscan::model::{ModEntry, SamplePlayer, ScanResult};
use craftscan::modules::persist::{MemoryStore, PersistModule, ServerStore};
use craftscan::modules::{ModuleAction, ModuleContext, ModuleInit, ModulePipeline, ScannerModule};
use craftscan::stats::ScanStats;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use test_utils::{sample_result, temp_path};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

mod test_utils;

fn context(stats: &Arc<ScanStats>) -> ModuleContext {
    ModuleContext {
        config: Arc::new(Config::default()),
        stats: Arc::clone(stats),
        cancel: CancellationToken::new(),
    }
}

/// Records the order it was entered in; optionally drops or fails.
struct ProbeHook {
    label: &'static str,
    trace: Arc<Mutex<Vec<&'static str>>>,
    action: ModuleAction,
    fail: bool,
}

#[async_trait]
impl ScannerModule for ProbeHook {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn initialize(&self, _ctx: &ModuleContext) -> Result<ModuleInit, ScanError> {
        Ok(ModuleInit::Active)
    }

    async fn process(&self, _result: &mut ScanResult) -> Result<ModuleAction, ScanError> {
        self.trace.lock().unwrap().push(self.label);
        if self.fail {
            return Err(ScanError::ModuleError {
                module: self.label.to_string(),
                message: "synthetic failure".to_string(),
            });
        }
        Ok(self.action)
    }

    async fn finalize(&self) -> Result<(), ScanError> {
        self.trace.lock().unwrap().push("finalize");
        Ok(())
    }
}

fn hook(
    label: &'static str,
    trace: &Arc<Mutex<Vec<&'static str>>>,
    action: ModuleAction,
    fail: bool,
) -> Arc<dyn ScannerModule> {
    Arc::new(ProbeHook {
        label,
        trace: Arc::clone(trace),
        action,
        fail,
    })
}

#[tokio::test]
async fn hooks_run_in_declared_order() {
    let stats = ScanStats::new();
    let trace = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = ModulePipeline::new(Arc::clone(&stats));
    pipeline.add_module(hook("first", &trace, ModuleAction::Continue, false));
    pipeline.add_module(hook("second", &trace, ModuleAction::Continue, false));
    pipeline.add_module(hook("third", &trace, ModuleAction::Continue, false));
    pipeline.initialize(&context(&stats)).await.unwrap();

    let mut result = sample_result("198.51.100.7", 25565);
    pipeline.process(&mut result).await;

    assert_eq!(*trace.lock().unwrap(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn drop_stops_later_hooks() {
    let stats = ScanStats::new();
    let trace = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = ModulePipeline::new(Arc::clone(&stats));
    pipeline.add_module(hook("first", &trace, ModuleAction::Continue, false));
    pipeline.add_module(hook("dropper", &trace, ModuleAction::Drop, false));
    pipeline.add_module(hook("after", &trace, ModuleAction::Continue, false));
    pipeline.initialize(&context(&stats)).await.unwrap();

    let mut result = sample_result("198.51.100.7", 25565);
    pipeline.process(&mut result).await;

    assert_eq!(*trace.lock().unwrap(), vec!["first", "dropper"]);
    assert_eq!(stats.pipeline_dropped.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn hook_error_logs_and_continues() {
    let stats = ScanStats::new();
    let trace = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = ModulePipeline::new(Arc::clone(&stats));
    pipeline.add_module(hook("broken", &trace, ModuleAction::Continue, true));
    pipeline.add_module(hook("survivor", &trace, ModuleAction::Continue, false));
    pipeline.initialize(&context(&stats)).await.unwrap();

    let mut result = sample_result("198.51.100.7", 25565);
    pipeline.process(&mut result).await;

    assert_eq!(*trace.lock().unwrap(), vec!["broken", "survivor"]);
    assert_eq!(stats.pipeline_dropped.load(Ordering::Relaxed), 0);
}

/// Hook that never returns within the hook budget.
struct StuckHook;

#[async_trait]
impl ScannerModule for StuckHook {
    fn name(&self) -> &'static str {
        "stuck"
    }
    async fn initialize(&self, _ctx: &ModuleContext) -> Result<ModuleInit, ScanError> {
        Ok(ModuleInit::Active)
    }
    async fn process(&self, _result: &mut ScanResult) -> Result<ModuleAction, ScanError> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(ModuleAction::Continue)
    }
    async fn finalize(&self) -> Result<(), ScanError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn stuck_hook_is_timed_out_and_skipped() {
    let stats = ScanStats::new();
    let trace = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = ModulePipeline::new(Arc::clone(&stats));
    pipeline.add_module(Arc::new(StuckHook));
    pipeline.add_module(hook("after-stuck", &trace, ModuleAction::Continue, false));
    pipeline.initialize(&context(&stats)).await.unwrap();

    let mut result = sample_result("198.51.100.7", 25565);
    pipeline.process(&mut result).await;

    assert_eq!(*trace.lock().unwrap(), vec!["after-stuck"]);
}

/// Store whose writes always fail, for the dead-letter path.
struct FailingStore;

#[async_trait]
impl ServerStore for FailingStore {
    async fn init(&self) -> Result<(), ScanError> {
        Ok(())
    }
    async fn upsert_server(&self, _result: &ScanResult) -> Result<(), ScanError> {
        Err(ScanError::StorageError("disk on fire".to_string()))
    }
    async fn record_status(&self, _result: &ScanResult) -> Result<(), ScanError> {
        Err(ScanError::StorageError("disk on fire".to_string()))
    }
    async fn upsert_player(
        &self,
        _player: &SamplePlayer,
        _seen_at: OffsetDateTime,
        _server: SocketAddr,
    ) -> Result<(), ScanError> {
        Err(ScanError::StorageError("disk on fire".to_string()))
    }
    async fn upsert_mod(&self, _entry: &ModEntry, _server: SocketAddr) -> Result<(), ScanError> {
        Err(ScanError::StorageError("disk on fire".to_string()))
    }
    async fn upsert_favicon(&self, _hash: &str, _bytes: Option<&[u8]>) -> Result<(), ScanError> {
        Err(ScanError::StorageError("disk on fire".to_string()))
    }
    async fn close(&self) -> Result<(), ScanError> {
        Ok(())
    }
}

#[tokio::test]
async fn failed_store_writes_land_in_dead_letter_file() {
    let dead_letter = temp_path("dead-letter");
    let storage = StorageConfig {
        dead_letter_path: dead_letter.to_string_lossy().into_owned(),
        store_favicons: false,
        pool_size: 1,
    };
    let module = PersistModule::new(Arc::new(FailingStore), storage);

    let stats = ScanStats::new();
    let ctx = context(&stats);
    assert_eq!(module.initialize(&ctx).await.unwrap(), ModuleInit::Active);

    let mut result = sample_result("198.51.100.9", 25565);
    // a failed write must not stop the pipeline
    assert_eq!(
        module.process(&mut result).await.unwrap(),
        ModuleAction::Continue
    );
    module.finalize().await.unwrap();

    let contents = std::fs::read_to_string(&dead_letter).unwrap();
    let line = contents.lines().next().expect("one dead-letter line");
    let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(parsed["ip"], "198.51.100.9");
    assert_eq!(parsed["port"], 25565);
    let _ = std::fs::remove_file(&dead_letter);
}

#[tokio::test]
async fn memory_store_records_players_mods_and_favicons_once() {
    let store = Arc::new(MemoryStore::new());
    let module = PersistModule::new(
        Arc::clone(&store) as Arc<dyn ServerStore>,
        StorageConfig::default(),
    );
    let stats = ScanStats::new();
    module.initialize(&context(&stats)).await.unwrap();

    let mut result = sample_result("198.51.100.10", 25565);
    result.player_sample = vec![SamplePlayer {
        name: "Alice".to_string(),
        uuid: "a0000000-0000-4000-8000-000000000001".to_string(),
    }];
    result.mods = vec![ModEntry {
        mod_id: "jei".to_string(),
        version: "15.2.0".to_string(),
    }];
    result.favicon_hash = Some("abc123".to_string());

    module.process(&mut result.clone()).await.unwrap();
    module.process(&mut result).await.unwrap();

    let server: SocketAddr = "198.51.100.10:25565".parse().unwrap();
    assert_eq!(store.status_count().await, 2);
    assert_eq!(store.favicon_count().await, 1);
    assert_eq!(
        store.mod_version(server, "jei").await.as_deref(),
        Some("15.2.0")
    );
    let player = store
        .player("a0000000-0000-4000-8000-000000000001")
        .await
        .expect("player recorded");
    assert_eq!(player.name, "Alice");
    assert!(player.servers.contains(&(server.ip(), server.port())));
}
