//! IP blacklist backed by binary prefix tries, one per address family.
//!
//! Lookups walk address bits most-significant first and report the longest
//! matching prefix, so cost is bounded by prefix length regardless of entry
//! count. The backing file holds one `ip` or `cidr` per line; the whole
//! structure is rebuilt and swapped atomically when the file changes.

use crate::config::BlacklistConfig;
use crate::errors::ScanError;
use ipnet::IpNet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Seconds between mtime polls when auto-update is on.
const RELOAD_POLL: Duration = Duration::from_secs(30);

#[derive(Default)]
struct TrieNode {
    children: [Option<Box<TrieNode>>; 2],
    /// Prefix length terminating here, when an entry ends at this node
    terminal: Option<u8>,
}

/// Fixed-stride binary trie over address prefixes.
#[derive(Default)]
struct PrefixTrie {
    root: TrieNode,
    entries: usize,
}

impl PrefixTrie {
    fn insert(&mut self, bits: u128, width: u8, prefix_len: u8) {
        let mut node = &mut self.root;
        for i in 0..prefix_len {
            let bit = ((bits >> (width - 1 - i)) & 1) as usize;
            node = node.children[bit].get_or_insert_with(Default::default);
        }
        if node.terminal.replace(prefix_len).is_none() {
            self.entries += 1;
        }
    }

    /// Longest prefix covering `bits`, if any.
    fn lookup(&self, bits: u128, width: u8) -> Option<u8> {
        let mut node = &self.root;
        let mut best = node.terminal;
        for i in 0..width {
            let bit = ((bits >> (width - 1 - i)) & 1) as usize;
            match &node.children[bit] {
                Some(child) => {
                    node = child;
                    if node.terminal.is_some() {
                        best = node.terminal;
                    }
                }
                None => break,
            }
        }
        best
    }
}

#[derive(Default)]
struct BlacklistTrees {
    v4: PrefixTrie,
    v6: PrefixTrie,
}

impl BlacklistTrees {
    fn insert(&mut self, net: IpNet) {
        match net {
            IpNet::V4(net) => {
                self.v4
                    .insert(u128::from(u32::from(net.network())), 32, net.prefix_len())
            }
            IpNet::V6(net) => {
                self.v6
                    .insert(u128::from(net.network()), 128, net.prefix_len())
            }
        }
    }

    fn lookup(&self, addr: IpAddr) -> Option<IpNet> {
        match addr {
            IpAddr::V4(v4) => {
                let len = self.v4.lookup(u128::from(u32::from(v4)), 32)?;
                Some(IpNet::new(addr, len).expect("prefix length checked on insert").trunc())
            }
            IpAddr::V6(v6) => {
                let len = self.v6.lookup(u128::from(v6), 128)?;
                Some(IpNet::new(addr, len).expect("prefix length checked on insert").trunc())
            }
        }
    }

    fn len(&self) -> usize {
        self.v4.entries + self.v6.entries
    }
}

/// Shared blacklist handle: read-mostly, rebuilt-and-swapped on reload.
pub struct Blacklist {
    trees: RwLock<Arc<BlacklistTrees>>,
    enabled: bool,
    path: Option<PathBuf>,
}

impl Blacklist {
    /// An always-empty blacklist for disabled configurations.
    pub fn disabled() -> Self {
        Self {
            trees: RwLock::new(Arc::new(BlacklistTrees::default())),
            enabled: false,
            path: None,
        }
    }

    /// Load the configured file. A missing file is a warning unless the
    /// section is marked required.
    pub fn from_config(config: &BlacklistConfig) -> Result<Self, ScanError> {
        if !config.enabled {
            info!("blacklist disabled");
            return Ok(Self::disabled());
        }
        let path = PathBuf::from(&config.file_path);
        let trees = match load_file(&path) {
            Ok(trees) => {
                info!(entries = trees.len(), path = %path.display(), "blacklist loaded");
                trees
            }
            Err(err) if config.required => {
                return Err(ScanError::BlacklistError(format!(
                    "required blacklist unavailable: {err}"
                )))
            }
            Err(err) => {
                warn!(%err, path = %path.display(), "blacklist unavailable, continuing without");
                BlacklistTrees::default()
            }
        };
        Ok(Self {
            trees: RwLock::new(Arc::new(trees)),
            enabled: true,
            path: Some(path),
        })
    }

    /// Longest matching prefix for `addr`, or `None` when not listed.
    pub fn matches(&self, addr: IpAddr) -> Option<IpNet> {
        if !self.enabled {
            return None;
        }
        let trees = self.trees.read().expect("blacklist lock poisoned");
        trees.lookup(addr)
    }

    pub fn is_blacklisted(&self, addr: IpAddr) -> bool {
        self.matches(addr).is_some()
    }

    pub fn len(&self) -> usize {
        self.trees.read().expect("blacklist lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild from the backing file and swap the trees in.
    pub fn reload(&self) -> Result<usize, ScanError> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        let trees = load_file(path)
            .map_err(|e| ScanError::BlacklistError(format!("reload failed: {e}")))?;
        let count = trees.len();
        *self.trees.write().expect("blacklist lock poisoned") = Arc::new(trees);
        Ok(count)
    }

    /// Poll the file's mtime and reload on change, until cancelled.
    pub fn spawn_auto_update(self: Arc<Self>, cancel: CancellationToken) {
        let Some(path) = self.path.clone() else {
            return;
        };
        let blacklist = self;
        tokio::spawn(async move {
            let mut last_mtime = file_mtime(&path);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RELOAD_POLL) => {}
                }
                let mtime = file_mtime(&path);
                if mtime != last_mtime {
                    last_mtime = mtime;
                    match blacklist.reload() {
                        Ok(entries) => info!(entries, "blacklist reloaded"),
                        Err(err) => warn!(%err, "blacklist reload failed"),
                    }
                }
            }
            debug!("blacklist auto-update stopped");
        });
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn load_file(path: &Path) -> std::io::Result<BlacklistTrees> {
    let contents = std::fs::read_to_string(path)?;
    let mut trees = BlacklistTrees::default();
    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let net = if let Ok(net) = IpNet::from_str(line) {
            net
        } else if let Ok(addr) = IpAddr::from_str(line) {
            match addr {
                IpAddr::V4(_) => IpNet::new(addr, 32).expect("host prefix"),
                IpAddr::V6(_) => IpNet::new(addr, 128).expect("host prefix"),
            }
        } else {
            warn!(line_no = line_no + 1, line, "skipping malformed blacklist entry");
            continue;
        };
        trees.insert(net.trunc());
    }
    Ok(trees)
}
