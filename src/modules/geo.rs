use super::{ModuleAction, ModuleContext, ModuleInit, ScannerModule};
use crate::config::{GeoProviderKind, GeolocationConfig};
use crate::errors::ScanError;
use crate::memory::CacheEvict;
use crate::model::ScanResult;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use std::sync::Mutex as SyncMutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// Entries kept even when valid, before pressure eviction trims oldest.
const CACHE_SOFT_CAP: usize = 100_000;

/// Location attributes attached to a result.
#[derive(Debug, Clone, Default)]
pub struct GeoInfo {
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub isp: Option<String>,
}

/// A geolocation backend. The crate ships the remote ip-api provider;
/// MaxMind-style local databases are external collaborators an embedder
/// plugs in through this trait.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<Option<GeoInfo>, ScanError>;

    fn provider_name(&self) -> &'static str;
}

/// ip-api.com lookups, self-throttled to the service's free-tier rate.
pub struct IpApiProvider {
    client: reqwest::Client,
    last_request: Mutex<Option<Instant>>,
    min_gap: Duration,
}

#[derive(Deserialize)]
struct IpApiResponse {
    status: String,
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
    country: Option<String>,
    #[serde(rename = "regionName")]
    region_name: Option<String>,
    city: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    isp: Option<String>,
}

impl IpApiProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            last_request: Mutex::new(None),
            min_gap: Duration::from_secs(1),
        }
    }
}

impl Default for IpApiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeoProvider for IpApiProvider {
    async fn lookup(&self, ip: IpAddr) -> Result<Option<GeoInfo>, ScanError> {
        {
            let mut last = self.last_request.lock().await;
            if let Some(prev) = *last {
                let since = prev.elapsed();
                if since < self.min_gap {
                    tokio::time::sleep(self.min_gap - since).await;
                }
            }
            *last = Some(Instant::now());
        }

        let url = format!("http://ip-api.com/json/{ip}");
        let response = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| ScanError::GeolocationError(e.to_string()))?;
        let body: IpApiResponse = response
            .json()
            .await
            .map_err(|e| ScanError::GeolocationError(e.to_string()))?;
        if body.status != "success" {
            return Ok(None);
        }
        Ok(Some(GeoInfo {
            country_code: body.country_code,
            country_name: body.country,
            region: body.region_name,
            city: body.city,
            latitude: body.lat,
            longitude: body.lon,
            isp: body.isp,
        }))
    }

    fn provider_name(&self) -> &'static str {
        "ip-api"
    }
}

struct CacheEntry {
    info: Option<GeoInfo>,
    stored_at: Instant,
}

/// Enrichment hook: look each result's address up, cache with a TTL, and
/// fail soft. A lookup error never stops the pipeline.
pub struct GeoModule {
    config: GeolocationConfig,
    provider: SyncMutex<Option<Arc<dyn GeoProvider>>>,
    cache: Mutex<HashMap<IpAddr, CacheEntry>>,
    ttl: Duration,
}

impl GeoModule {
    pub fn new(config: GeolocationConfig) -> Self {
        let ttl = Duration::from_secs(config.cache_duration.max(1));
        Self {
            config,
            provider: SyncMutex::new(None),
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Inject a custom provider (a local MaxMind reader, a test stub)
    /// instead of the one picked from config.
    pub fn with_provider(self, provider: Arc<dyn GeoProvider>) -> Self {
        *self.provider.lock().expect("provider lock poisoned") = Some(provider);
        self
    }

    async fn cached_lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&ip) {
                if entry.stored_at.elapsed() < self.ttl {
                    return entry.info.clone();
                }
            }
        }

        let provider = self.provider.lock().expect("provider lock poisoned").clone()?;
        let info = match provider.lookup(ip).await {
            Ok(info) => info,
            Err(err) => {
                debug!(%ip, %err, "geolocation lookup failed");
                return None;
            }
        };

        let mut cache = self.cache.lock().await;
        cache.insert(
            ip,
            CacheEntry {
                info: info.clone(),
                stored_at: Instant::now(),
            },
        );
        info
    }
}

#[async_trait]
impl ScannerModule for GeoModule {
    fn name(&self) -> &'static str {
        "geolocation"
    }

    fn init_order(&self) -> u8 {
        20
    }

    async fn initialize(&self, _ctx: &ModuleContext) -> Result<ModuleInit, ScanError> {
        if !self.config.enabled {
            return Ok(ModuleInit::Disabled);
        }
        let mut provider = self.provider.lock().expect("provider lock poisoned");
        if provider.is_some() {
            return Ok(ModuleInit::Active);
        }
        match self.config.provider {
            GeoProviderKind::Remote => {
                *provider = Some(Arc::new(IpApiProvider::new()));
                Ok(ModuleInit::Active)
            }
            GeoProviderKind::Local => {
                // The MaxMind reader is an external collaborator; without an
                // injected provider the local mode can only verify the file
                // exists and hand off.
                if !Path::new(&self.config.database_path).exists() {
                    if self.config.required {
                        return Err(ScanError::GeolocationError(format!(
                            "required geolocation database missing: {}",
                            self.config.database_path
                        )));
                    }
                    warn!(
                        path = %self.config.database_path,
                        "geolocation database missing, disabling enrichment"
                    );
                    return Ok(ModuleInit::Disabled);
                }
                if self.config.required {
                    return Err(ScanError::GeolocationError(
                        "local geolocation requires an injected provider".to_string(),
                    ));
                }
                warn!("no local geolocation provider injected, disabling enrichment");
                Ok(ModuleInit::Disabled)
            }
        }
    }

    async fn process(&self, result: &mut ScanResult) -> Result<ModuleAction, ScanError> {
        if let Some(info) = self.cached_lookup(result.ip).await {
            result.country_code = info.country_code;
        }
        Ok(ModuleAction::Continue)
    }

    async fn finalize(&self) -> Result<(), ScanError> {
        self.cache.lock().await.clear();
        Ok(())
    }
}

#[async_trait]
impl CacheEvict for GeoModule {
    async fn evict_stale(&self) -> usize {
        let mut cache = self.cache.lock().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        if cache.len() > CACHE_SOFT_CAP {
            // oldest half goes; pressure beats completeness
            let mut ages: Vec<(IpAddr, Instant)> =
                cache.iter().map(|(ip, e)| (*ip, e.stored_at)).collect();
            ages.sort_by_key(|(_, stored_at)| *stored_at);
            for (ip, _) in ages.into_iter().take(cache.len() / 2) {
                cache.remove(&ip);
            }
        }
        before - cache.len()
    }

    fn cache_name(&self) -> &'static str {
        "geolocation"
    }
}
