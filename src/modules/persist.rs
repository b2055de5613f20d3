use super::{ModuleAction, ModuleContext, ModuleInit, ScannerModule};
use crate::config::StorageConfig;
use crate::errors::ScanError;
use crate::model::{ModEntry, Player, SamplePlayer, ScanResult};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Persistence sink interface. Embedded single-file and client/server RDBMS
/// backends are collaborators implementing this; the crate ships an
/// in-memory one.
#[async_trait]
pub trait ServerStore: Send + Sync {
    async fn init(&self) -> Result<(), ScanError>;

    /// Upsert the server row keyed by `(ip, port)`
    async fn upsert_server(&self, result: &ScanResult) -> Result<(), ScanError>;

    /// Append one status snapshot for this scan
    async fn record_status(&self, result: &ScanResult) -> Result<(), ScanError>;

    async fn upsert_player(
        &self,
        player: &SamplePlayer,
        seen_at: OffsetDateTime,
        server: SocketAddr,
    ) -> Result<(), ScanError>;

    async fn upsert_mod(&self, entry: &ModEntry, server: SocketAddr) -> Result<(), ScanError>;

    /// Store favicon content once per distinct hash
    async fn upsert_favicon(&self, hash: &str, bytes: Option<&[u8]>) -> Result<(), ScanError>;

    async fn close(&self) -> Result<(), ScanError>;
}

/// Persistence hook: writes each result through the sink, serializing
/// writes per `(ip, port)` with a keyed mutex. A failed write lands in the
/// dead-letter file and the result continues down the pipeline.
pub struct PersistModule {
    store: Arc<dyn ServerStore>,
    config: StorageConfig,
    target_locks: Mutex<HashMap<SocketAddr, Arc<Mutex<()>>>>,
    favicon_seen: Mutex<HashSet<String>>,
    dead_letter: Mutex<Option<tokio::fs::File>>,
}

impl PersistModule {
    pub fn new(store: Arc<dyn ServerStore>, config: StorageConfig) -> Self {
        Self {
            store,
            config,
            target_locks: Mutex::new(HashMap::new()),
            favicon_seen: Mutex::new(HashSet::new()),
            dead_letter: Mutex::new(None),
        }
    }

    async fn lock_for(&self, addr: SocketAddr) -> Arc<Mutex<()>> {
        let mut locks = self.target_locks.lock().await;
        Arc::clone(locks.entry(addr).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    async fn write_result(&self, result: &ScanResult) -> Result<(), ScanError> {
        self.store.upsert_server(result).await?;
        self.store.record_status(result).await?;
        for player in &result.player_sample {
            self.store
                .upsert_player(player, result.discovered_at, result.socket_addr())
                .await?;
        }
        for entry in &result.mods {
            self.store.upsert_mod(entry, result.socket_addr()).await?;
        }
        if let Some(hash) = &result.favicon_hash {
            let mut seen = self.favicon_seen.lock().await;
            if seen.insert(hash.clone()) {
                self.store
                    .upsert_favicon(hash, result.favicon_bytes.as_deref())
                    .await?;
            }
        }
        Ok(())
    }

    async fn dead_letter(&self, result: &ScanResult, err: &ScanError) {
        warn!(target = %result.socket_addr(), %err, "store write failed, dead-lettering");
        let mut guard = self.dead_letter.lock().await;
        if guard.is_none() {
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.config.dead_letter_path)
                .await
            {
                Ok(file) => *guard = Some(file),
                Err(open_err) => {
                    warn!(%open_err, path = %self.config.dead_letter_path, "cannot open dead-letter file");
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            let Ok(mut line) = serde_json::to_vec(result) else {
                return;
            };
            line.push(b'\n');
            if let Err(write_err) = file.write_all(&line).await {
                warn!(%write_err, "dead-letter append failed");
            }
        }
    }
}

#[async_trait]
impl ScannerModule for PersistModule {
    fn name(&self) -> &'static str {
        "persist"
    }

    // the sink comes up first and closes last
    fn init_order(&self) -> u8 {
        10
    }

    async fn initialize(&self, _ctx: &ModuleContext) -> Result<ModuleInit, ScanError> {
        self.store.init().await?;
        Ok(ModuleInit::Active)
    }

    async fn process(&self, result: &mut ScanResult) -> Result<ModuleAction, ScanError> {
        let lock = self.lock_for(result.socket_addr()).await;
        let _guard = lock.lock().await;
        if let Err(err) = self.write_result(result).await {
            self.dead_letter(result, &err).await;
        }
        Ok(ModuleAction::Continue)
    }

    async fn finalize(&self) -> Result<(), ScanError> {
        if let Some(mut file) = self.dead_letter.lock().await.take() {
            let _ = file.flush().await;
        }
        self.store.close().await
    }
}

/// Server row tracked by the in-memory store.
#[derive(Debug, Clone)]
pub struct StoredServer {
    pub first_seen: OffsetDateTime,
    pub last_seen: OffsetDateTime,
    pub successful_scans: u64,
}

#[derive(Default)]
struct MemoryTables {
    servers: HashMap<SocketAddr, StoredServer>,
    statuses: Vec<ScanResult>,
    players: HashMap<String, Player>,
    server_mods: HashMap<(SocketAddr, String), String>,
    favicons: HashMap<String, Option<Vec<u8>>>,
}

/// Reference sink: everything in process memory. Useful for tests and for
/// runs where only the export at the end matters.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn server_count(&self) -> usize {
        self.tables.lock().await.servers.len()
    }

    pub async fn status_count(&self) -> usize {
        self.tables.lock().await.statuses.len()
    }

    pub async fn server(&self, addr: SocketAddr) -> Option<StoredServer> {
        self.tables.lock().await.servers.get(&addr).cloned()
    }

    pub async fn player(&self, uuid: &str) -> Option<Player> {
        self.tables.lock().await.players.get(uuid).cloned()
    }

    pub async fn mod_version(&self, server: SocketAddr, mod_id: &str) -> Option<String> {
        self.tables
            .lock()
            .await
            .server_mods
            .get(&(server, mod_id.to_string()))
            .cloned()
    }

    pub async fn favicon_count(&self) -> usize {
        self.tables.lock().await.favicons.len()
    }

    pub async fn statuses_for(&self, addr: SocketAddr) -> Vec<ScanResult> {
        self.tables
            .lock()
            .await
            .statuses
            .iter()
            .filter(|s| s.socket_addr() == addr)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ServerStore for MemoryStore {
    async fn init(&self) -> Result<(), ScanError> {
        Ok(())
    }

    async fn upsert_server(&self, result: &ScanResult) -> Result<(), ScanError> {
        let mut tables = self.tables.lock().await;
        let entry = tables
            .servers
            .entry(result.socket_addr())
            .or_insert(StoredServer {
                first_seen: result.discovered_at,
                last_seen: result.discovered_at,
                successful_scans: 0,
            });
        entry.last_seen = result.discovered_at;
        entry.successful_scans += 1;
        Ok(())
    }

    async fn record_status(&self, result: &ScanResult) -> Result<(), ScanError> {
        self.tables.lock().await.statuses.push(result.clone());
        Ok(())
    }

    async fn upsert_player(
        &self,
        player: &SamplePlayer,
        seen_at: OffsetDateTime,
        server: SocketAddr,
    ) -> Result<(), ScanError> {
        let mut tables = self.tables.lock().await;
        let entry = tables
            .players
            .entry(player.uuid.clone())
            .or_insert_with(|| Player {
                uuid: player.uuid.clone(),
                name: player.name.clone(),
                first_seen: seen_at,
                last_seen: seen_at,
                servers: BTreeSet::new(),
            });
        entry.name = player.name.clone();
        entry.last_seen = seen_at;
        entry.servers.insert((server.ip(), server.port()));
        Ok(())
    }

    async fn upsert_mod(&self, entry: &ModEntry, server: SocketAddr) -> Result<(), ScanError> {
        self.tables
            .lock()
            .await
            .server_mods
            .entry((server, entry.mod_id.clone()))
            .or_insert_with(|| entry.version.clone());
        Ok(())
    }

    async fn upsert_favicon(&self, hash: &str, bytes: Option<&[u8]>) -> Result<(), ScanError> {
        self.tables
            .lock()
            .await
            .favicons
            .entry(hash.to_string())
            .or_insert_with(|| bytes.map(<[u8]>::to_vec));
        Ok(())
    }

    async fn close(&self) -> Result<(), ScanError> {
        let tables = self.tables.lock().await;
        debug!(
            servers = tables.servers.len(),
            statuses = tables.statuses.len(),
            players = tables.players.len(),
            "memory store closed"
        );
        Ok(())
    }
}
