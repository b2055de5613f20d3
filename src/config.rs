use crate::errors::ScanError;
use serde::Deserialize;
use std::path::Path;

/// Protocol ids advertised in order when `scan_all_protocols` is enabled.
/// Most common modern versions first so the sweep usually ends on the first try.
pub const DEFAULT_PROTOCOL_CANDIDATES: &[i32] = &[
    770, // 1.21.5
    767, // 1.21
    766, // 1.20.5-1.20.6
    765, // 1.20.3-1.20.4
    764, // 1.20.2
    763, // 1.20-1.20.1
    762, // 1.19.4
    761, // 1.19.3
    760, // 1.19.1-1.19.2
    759, // 1.19
    758, // 1.18.2
    757, // 1.18-1.18.1
    754, // 1.16.4-1.16.5
    47,  // 1.8.x
    5,   // 1.7.6-1.7.10
];

/// Settings for the probe engine itself
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScannerConfig {
    /// Timeout in seconds for every network operation within a probe
    pub timeout: f64,
    /// Protocol id advertised in single-protocol mode
    pub protocol_version: i32,
    /// Try every candidate protocol id in order until one succeeds
    pub scan_all_protocols: bool,
    /// Candidate ids for multi-protocol mode; empty means the built-in list
    pub protocol_versions: Vec<i32>,
    /// Extra connection attempts after a timeout or reset
    pub retries: u32,
    /// Fall back to the pre-Netty text ping when a 0xFF frame shows up
    pub legacy_support: bool,
    /// Global outbound connection budget in attempts per second
    pub rate_limit: u32,
    /// Per-host refill rate in attempts per second
    pub per_host_rate_limit: u32,
    /// Per-host bucket capacity
    pub burst_allowance: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            timeout: 5.0,
            protocol_version: 770,
            scan_all_protocols: false,
            protocol_versions: Vec::new(),
            retries: 2,
            legacy_support: true,
            rate_limit: 1000,
            per_host_rate_limit: 2,
            burst_allowance: 4,
        }
    }
}

impl ScannerConfig {
    pub fn timeout_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.timeout)
    }

    /// Ordered protocol ids for this scan; single-element unless sweeping.
    pub fn protocol_candidates(&self) -> Vec<i32> {
        if !self.scan_all_protocols {
            return vec![self.protocol_version];
        }
        if self.protocol_versions.is_empty() {
            DEFAULT_PROTOCOL_CANDIDATES.to_vec()
        } else {
            self.protocol_versions.clone()
        }
    }
}

/// How targets are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMethod {
    Range,
    File,
    External,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DiscoveryConfig {
    pub method: DiscoveryMethod,
    /// Ports crossed with every produced address
    pub ports: Vec<u16>,
    /// Granularity for channel capacity and shuffle windows
    pub batch_size: usize,
    /// Command line for the external discovery tool, argv style
    pub external_command: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            method: DiscoveryMethod::Range,
            ports: vec![25565],
            batch_size: 1000,
            external_command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConcurrencyConfig {
    pub max_concurrent: usize,
    pub max_connections_per_host: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1000,
            max_connections_per_host: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MemoryConfig {
    pub max_memory_mb: u64,
    /// Seconds between limiter/cache maintenance sweeps
    pub gc_interval: u64,
    pub enable_monitoring: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 1000,
            gc_interval: 60,
            enable_monitoring: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BlacklistConfig {
    pub enabled: bool,
    /// Reload the file when its mtime changes (polled every 30s)
    pub auto_update: bool,
    pub file_path: String,
    /// Abort startup instead of warning when the file cannot be read
    pub required: bool,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_update: true,
            file_path: "blacklist.txt".to_string(),
            required: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoProviderKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GeolocationConfig {
    pub enabled: bool,
    pub provider: GeoProviderKind,
    pub database_path: String,
    /// Seconds a cached lookup stays valid
    pub cache_duration: u64,
    pub required: bool,
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: GeoProviderKind::Local,
            database_path: "GeoLite2-City.mmdb".to_string(),
            cache_duration: 86_400,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    /// Results buffered before a flush
    pub batch_size: usize,
    pub include_stats: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            batch_size: 50,
            include_stats: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    /// Where results rejected by the sink are appended as JSON lines
    pub dead_letter_path: String,
    /// Keep decoded favicon bytes on results (hash is always kept)
    pub store_favicons: bool,
    pub pool_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dead_letter_path: "dead_letter.jsonl".to_string(),
            store_favicons: false,
            pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AdvancedConfig {
    pub enable_tcp_nodelay: bool,
    pub socket_keepalive: bool,
    pub randomize_scan_order: bool,
    /// Seed for reproducible shuffles; 0 derives one from the clock
    pub shuffle_seed: u64,
    pub skip_private_ranges: bool,
    pub skip_reserved_ranges: bool,
    /// Seconds granted to drain and flush after a shutdown signal
    pub grace_period: u64,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            enable_tcp_nodelay: true,
            socket_keepalive: false,
            randomize_scan_order: false,
            shuffle_seed: 0,
            skip_private_ranges: true,
            skip_reserved_ranges: true,
            grace_period: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UiConfig {
    /// Progress events per second
    pub refresh_rate: u32,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self { refresh_rate: 4 }
    }
}

/// Root configuration, one field per recognized section.
///
/// Unknown sections and unknown keys inside a section are loader errors.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub scanner: ScannerConfig,
    pub discovery: DiscoveryConfig,
    pub concurrency: ConcurrencyConfig,
    pub memory: MemoryConfig,
    pub blacklist: BlacklistConfig,
    pub geolocation: GeolocationConfig,
    pub webhook: WebhookConfig,
    pub storage: StorageConfig,
    pub advanced: AdvancedConfig,
    pub ui: UiConfig,
}

impl Config {
    /// Parse a YAML document, rejecting unknown keys.
    pub fn from_yaml(contents: &str) -> Result<Self, ScanError> {
        let config: Config = serde_yaml::from_str(contents)
            .map_err(|e| ScanError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ScanError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ScanError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&contents)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.scanner.timeout <= 0.0 {
            return Err(ScanError::ConfigError(
                "scanner.timeout must be positive".to_string(),
            ));
        }
        if self.scanner.rate_limit == 0 {
            return Err(ScanError::ConfigError(
                "scanner.rate_limit must be greater than zero".to_string(),
            ));
        }
        if self.concurrency.max_concurrent == 0 {
            return Err(ScanError::ConfigError(
                "concurrency.max_concurrent must be greater than zero".to_string(),
            ));
        }
        if self.discovery.ports.is_empty() {
            return Err(ScanError::ConfigError(
                "discovery.ports must not be empty".to_string(),
            ));
        }
        if self.discovery.batch_size == 0 {
            return Err(ScanError::ConfigError(
                "discovery.batch_size must be greater than zero".to_string(),
            ));
        }
        if self.discovery.method == DiscoveryMethod::External
            && self.discovery.external_command.is_empty()
        {
            return Err(ScanError::ConfigError(
                "discovery.external_command required for the external method".to_string(),
            ));
        }
        if self.webhook.enabled && self.webhook.url.is_empty() {
            return Err(ScanError::ConfigError(
                "webhook.url required when webhooks are enabled".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn yaml_round_trip_with_partial_sections() {
        let config = Config::from_yaml(
            "scanner:\n  timeout: 2.5\n  retries: 1\ndiscovery:\n  ports: [25565, 25566]\n",
        )
        .unwrap();
        assert_eq!(config.scanner.retries, 1);
        assert_eq!(config.discovery.ports, vec![25565, 25566]);
        // untouched sections keep their defaults
        assert_eq!(config.concurrency.max_concurrent, 1000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_yaml("scanner:\n  speed: 9\n").unwrap_err();
        assert!(matches!(err, ScanError::ConfigError(_)));
    }

    #[test]
    fn zero_rate_limit_is_rejected() {
        let err = Config::from_yaml("scanner:\n  rate_limit: 0\n").unwrap_err();
        assert!(err.to_string().contains("rate_limit"));
    }

    #[test]
    fn protocol_candidates_modes() {
        let mut scanner = ScannerConfig::default();
        assert_eq!(scanner.protocol_candidates(), vec![770]);

        scanner.scan_all_protocols = true;
        assert_eq!(
            scanner.protocol_candidates().first().copied(),
            Some(DEFAULT_PROTOCOL_CANDIDATES[0])
        );

        scanner.protocol_versions = vec![763, 47];
        assert_eq!(scanner.protocol_candidates(), vec![763, 47]);
    }
}
