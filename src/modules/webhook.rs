use super::{ModuleAction, ModuleContext, ModuleInit, ScannerModule};
use crate::config::WebhookConfig;
use crate::errors::ScanError;
use crate::model::ScanResult;
use crate::stats::ScanStats;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::sync::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// Buffered results are flushed at least this often.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Stats messages go out at most once a minute.
const STATS_MIN_GAP: Duration = Duration::from_secs(60);

/// Notification hook: batches found servers and posts them to a webhook.
/// Reentrant: concurrent results just append to the shared queue.
pub struct WebhookModule {
    config: WebhookConfig,
    client: reqwest::Client,
    queue: Arc<Mutex<Vec<serde_json::Value>>>,
    last_stats_sent: Mutex<Option<Instant>>,
    stats: SyncMutex<Option<Arc<ScanStats>>>,
}

impl WebhookModule {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            queue: Arc::new(Mutex::new(Vec::new())),
            last_stats_sent: Mutex::new(None),
            stats: SyncMutex::new(None),
        }
    }

    fn embed_for(result: &ScanResult) -> serde_json::Value {
        json!({
            "title": format!("Server found: {}", result.socket_addr()),
            "description": result.motd_plain.clone(),
            "fields": [
                {"name": "software", "value": result.software.as_str()},
                {"name": "version", "value": result.version_string.clone()},
                {"name": "players", "value": format!("{}/{}", result.players_online, result.players_max)},
                {"name": "latency_ms", "value": result.latency_ms},
            ],
        })
    }

    async fn post(&self, payload: serde_json::Value) -> Result<(), ScanError> {
        let response = self
            .client
            .post(&self.config.url)
            .json(&payload)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ScanError::WebhookError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ScanError::WebhookError(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Send everything queued, in one message.
    async fn flush(&self) -> Result<(), ScanError> {
        let embeds: Vec<serde_json::Value> = {
            let mut queue = self.queue.lock().await;
            if queue.is_empty() {
                return Ok(());
            }
            queue.drain(..).collect()
        };
        debug!(count = embeds.len(), "flushing webhook batch");
        self.post(json!({ "embeds": embeds })).await
    }

    async fn maybe_send_stats(&self) {
        if !self.config.include_stats {
            return;
        }
        let stats = match self.stats.lock().expect("stats slot poisoned").clone() {
            Some(stats) => stats,
            None => return,
        };
        {
            let mut last = self.last_stats_sent.lock().await;
            if let Some(prev) = *last {
                if prev.elapsed() < STATS_MIN_GAP {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        let payload = json!({ "content": format!("scan progress: {}", stats.summary()) });
        if let Err(err) = self.post(payload).await {
            debug!(%err, "stats notification failed");
        }
    }
}

#[async_trait]
impl ScannerModule for WebhookModule {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn init_order(&self) -> u8 {
        40
    }

    async fn initialize(&self, ctx: &ModuleContext) -> Result<ModuleInit, ScanError> {
        if !self.config.enabled {
            return Ok(ModuleInit::Disabled);
        }
        if self.config.url.is_empty() {
            warn!("webhook enabled without a url, disabling");
            return Ok(ModuleInit::Disabled);
        }
        *self.stats.lock().expect("stats slot poisoned") = Some(Arc::clone(&ctx.stats));

        // interval flusher, lives until the scan is cancelled
        let queue = Arc::clone(&self.queue);
        let client = self.client.clone();
        let url = self.config.url.clone();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(FLUSH_INTERVAL) => {}
                }
                let embeds: Vec<serde_json::Value> = {
                    let mut queue = queue.lock().await;
                    if queue.is_empty() {
                        continue;
                    }
                    queue.drain(..).collect()
                };
                let body = json!({ "embeds": embeds });
                match client.post(&url).json(&body).send().await {
                    Ok(response) if !response.status().is_success() => {
                        warn!(status = %response.status(), "interval webhook flush rejected");
                    }
                    Err(err) => warn!(%err, "interval webhook flush failed"),
                    _ => {}
                }
            }
        });
        Ok(ModuleInit::Active)
    }

    async fn process(&self, result: &mut ScanResult) -> Result<ModuleAction, ScanError> {
        let flush_now = {
            let mut queue = self.queue.lock().await;
            queue.push(Self::embed_for(result));
            queue.len() >= self.config.batch_size.max(1)
        };
        if flush_now {
            if let Err(err) = self.flush().await {
                warn!(%err, "webhook batch flush failed");
            }
        }
        self.maybe_send_stats().await;
        Ok(ModuleAction::Continue)
    }

    async fn finalize(&self) -> Result<(), ScanError> {
        self.flush().await?;
        let stats = self.stats.lock().expect("stats slot poisoned").clone();
        if let Some(stats) = stats {
            let payload = json!({ "content": format!("scan complete: {}", stats.summary()) });
            self.post(payload).await?;
        }
        Ok(())
    }
}
