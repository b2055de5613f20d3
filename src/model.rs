use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use time::OffsetDateTime;

/// One endpoint to probe, produced by a target source and consumed exactly once
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub addr: IpAddr,
    pub port: u16,
    /// Hostname advertised in the handshake when the target came from a name
    pub hostname: Option<String>,
}

impl Target {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            addr,
            port,
            hostname: None,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// String to advertise in the handshake address field.
    pub fn handshake_host(&self) -> String {
        self.hostname
            .clone()
            .unwrap_or_else(|| self.addr.to_string())
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Outcome of one probe, as handed from the worker to the orchestrator
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// Modern exchange completed; latency from status request to first byte
    Success(ServerDocument, std::time::Duration),
    /// Pre-Netty server answered a legacy ping
    LegacyDetected(ServerDocument),
    Failed(crate::errors::ProbeFailure),
    /// Target matched the blacklist; no socket was opened
    BlacklistSkipped,
    /// Rate token wait would have outlived the probe deadline
    RateLimited,
}

/// Server software classified from the version string and mod metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Software {
    Vanilla,
    Paper,
    Spigot,
    Bukkit,
    Forge,
    Fabric,
    Velocity,
    Bungeecord,
    Purpur,
    Folia,
    Other,
    Unknown,
}

impl Software {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vanilla => "vanilla",
            Self::Paper => "paper",
            Self::Spigot => "spigot",
            Self::Bukkit => "bukkit",
            Self::Forge => "forge",
            Self::Fabric => "fabric",
            Self::Velocity => "velocity",
            Self::Bungeecord => "bungeecord",
            Self::Purpur => "purpur",
            Self::Folia => "folia",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }
}

/// Whether the server appears to authenticate against the session service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnlineModeGuess {
    LikelyOnline,
    LikelyOffline,
    Unknown,
}

/// One `(name, uuid)` pair from the status player sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplePlayer {
    pub name: String,
    pub uuid: String,
}

/// A mod detected on a server, deduplicated by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModEntry {
    pub mod_id: String,
    pub version: String,
}

/// Semi-structured view of the server's status document.
///
/// Everything beyond `protocol_id`/`version_name` degrades to defaults when
/// the server omits or mangles it; the raw JSON is retained for debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDocument {
    pub protocol_id: i32,
    pub version_name: String,
    pub motd_plain: String,
    pub motd_raw: String,
    pub players_online: i64,
    pub players_max: i64,
    pub player_sample: Vec<SamplePlayer>,
    pub mods: Vec<ModEntry>,
    #[serde(default)]
    pub is_modded: bool,
    pub prevents_chat_reports: Option<bool>,
    pub enforces_secure_chat: Option<bool>,
    pub favicon_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon_bytes: Option<Vec<u8>>,
    pub raw: serde_json::Value,
}

/// Tracked player identity, mutated only by the persistence sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub uuid: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub servers: std::collections::BTreeSet<(IpAddr, u16)>,
}

/// Canonical record for one successful or noteworthy probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub ip: IpAddr,
    pub port: u16,
    #[serde(with = "time::serde::rfc3339")]
    pub discovered_at: OffsetDateTime,
    pub protocol_id: i32,
    pub software: Software,
    pub version_string: String,
    pub motd_plain: String,
    pub motd_raw: String,
    pub players_online: i64,
    pub players_max: i64,
    pub player_sample: Vec<SamplePlayer>,
    pub mods: Vec<ModEntry>,
    pub favicon_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon_bytes: Option<Vec<u8>>,
    pub latency_ms: u64,
    pub online_mode_guess: OnlineModeGuess,
    /// Server reported more online players than `players_max + 1`
    pub count_mismatch: bool,
    pub raw_document: serde_json::Value,
    /// Country code filled in by the enrichment hook when available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
}

impl ScanResult {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Snapshot published to progress subscribers
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub blacklisted: u64,
    pub rate_eps: f64,
    pub eta_seconds: Option<u64>,
    pub last_success: Option<std::sync::Arc<ScanResult>>,
}
