use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::sol_to_lamports;
use crate::telemetry::Telemetry;

/// Tip floor percentiles published by the relay operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TipFloorResponse {
    #[serde(rename = "landed_tips_25th_percentile")]
    pub landed_tips_25th: f64,
    #[serde(rename = "landed_tips_50th_percentile")]
    pub landed_tips_50th: f64,
    #[serde(rename = "landed_tips_75th_percentile")]
    pub landed_tips_75th: f64,
    #[serde(rename = "landed_tips_95th_percentile")]
    pub landed_tips_95th: f64,
    #[serde(rename = "landed_tips_99th_percentile")]
    pub landed_tips_99th: f64,
}

#[derive(Debug, Clone)]
struct CachedTipFloor {
    data: TipFloorResponse,
    fetched_at: Instant,
    cache_duration: Duration,
}

impl CachedTipFloor {
    fn is_expired(&self) -> bool {
        self.fetched_at.elapsed() > self.cache_duration
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TipPercentile {
    P25,
    P50,
    P75,
    P95,
    P99,
}

impl TipPercentile {
    /// One percentile step up, saturating at p99. The retry matrix tip
    /// bump walks this ladder.
    pub fn next_up(self) -> Self {
        match self {
            Self::P25 => Self::P50,
            Self::P50 => Self::P75,
            Self::P75 => Self::P95,
            Self::P95 | Self::P99 => Self::P99,
        }
    }

    fn pick(self, floor: &TipFloorResponse) -> f64 {
        match self {
            Self::P25 => floor.landed_tips_25th,
            Self::P50 => floor.landed_tips_50th,
            Self::P75 => floor.landed_tips_75th,
            Self::P95 => floor.landed_tips_95th,
            Self::P99 => floor.landed_tips_99th,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub block_engine_url: String,
    pub tip_floor_url: String,
    pub base_percentile: TipPercentile,
    pub tip_cache_secs: u64,
    pub min_tip_lamports: u64,
    pub max_tip_lamports: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            block_engine_url: "https://mainnet.block-engine.jito.wtf/api/v1/bundles".to_string(),
            tip_floor_url: "https://bundles.jito.wtf/api/v1/bundles/tip_floor".to_string(),
            base_percentile: TipPercentile::P75,
            tip_cache_secs: 30,
            min_tip_lamports: 10_000,
            max_tip_lamports: 10_000_000,
        }
    }
}

/// Official relay tip accounts for mainnet-beta.
pub const TIP_ACCOUNTS: [&str; 8] = [
    "96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5",
    "HFqU5x63VTqvQss8hp11i4wVV8bD44PvwucfZ2bU7gRe",
    "Cw8CFyM9FkoMi7K7Crf6HNQqf4uEMzpKw6QNghXLvLkY",
    "ADaUMid9yfUytqMBgopwjb2DTLSokTSzL1zt6iGPaS49",
    "DfXygSm4jCyNCybVYYK6DwvWqjKee8pbDmJGcLWNDXjh",
    "ADuUkR4vqLUMWXxW9gh6D6L8pMSawimctcNZ5pGwDcEt",
    "DttWaMuVvTiduZRnguLF7jNxTgiMBZ1hyAumKUiL2KRL",
    "3AVi9Tg9Uo68tJfuvoKvqKNWKkC5wPdSSdeBnizKZ6jT",
];

/// Fire-and-forget client for the shadow-mempool bundle relay. The hot
/// path never awaits the ack; a side task consumes it.
pub struct RelayClient {
    client: reqwest::Client,
    cfg: RelayConfig,
    cached_tip_floor: Mutex<Option<CachedTipFloor>>,
    telemetry: Telemetry,
}

impl RelayClient {
    pub fn new(cfg: RelayConfig, telemetry: Telemetry) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building relay http client")?;
        Ok(Self { client, cfg, cached_tip_floor: Mutex::new(None), telemetry })
    }

    /// Pick a tip account round-robin-ish off the bundle id.
    pub fn tip_account(&self, seed: &str) -> &'static str {
        let idx = seed.bytes().map(|b| b as usize).sum::<usize>() % TIP_ACCOUNTS.len();
        TIP_ACCOUNTS[idx]
    }

    /// Tip for the given bump level: the configured percentile walked up
    /// one step per level, clamped into [min, max].
    pub async fn tip_for_level(&self, bump_level: u32) -> u64 {
        let mut percentile = self.cfg.base_percentile;
        for _ in 0..bump_level {
            percentile = percentile.next_up();
        }

        let floor = self.tip_floor().await;
        let lamports = match floor {
            Some(floor) => sol_to_lamports(percentile.pick(&floor)),
            None => self.cfg.min_tip_lamports,
        };
        lamports.clamp(self.cfg.min_tip_lamports, self.cfg.max_tip_lamports)
    }

    async fn tip_floor(&self) -> Option<TipFloorResponse> {
        let mut cache = self.cached_tip_floor.lock().await;
        if let Some(cached) = cache.as_ref() {
            if !cached.is_expired() {
                return Some(cached.data.clone());
            }
        }

        match self.fetch_tip_floor().await {
            Ok(data) => {
                *cache = Some(CachedTipFloor {
                    data: data.clone(),
                    fetched_at: Instant::now(),
                    cache_duration: Duration::from_secs(self.cfg.tip_cache_secs),
                });
                Some(data)
            }
            Err(e) => {
                warn!("tip floor fetch failed, using configured minimum: {e:#}");
                cache.as_ref().map(|c| c.data.clone())
            }
        }
    }

    async fn fetch_tip_floor(&self) -> Result<TipFloorResponse> {
        let body: serde_json::Value = self
            .client
            .get(&self.cfg.tip_floor_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        // The feed publishes an array with a single row.
        let row = if body.is_array() { body.get(0).cloned().unwrap_or(body) } else { body };
        serde_json::from_value(row).context("tip floor response shape")
    }

    /// Submit a bundle of raw signed transactions. Returns immediately with
    /// the ack channel; the relay answers with a bundle id when it accepts.
    pub fn send_bundle(&self, raw_txs: Vec<Vec<u8>>) -> oneshot::Receiver<Result<String>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let client = self.client.clone();
        let url = self.cfg.block_engine_url.clone();
        let request_id = Uuid::new_v4().to_string();

        tokio::spawn(async move {
            let encoded: Vec<String> = raw_txs.iter().map(|tx| bs58::encode(tx).into_string()).collect();
            let payload = json!({
                "jsonrpc": "2.0",
                "id": request_id,
                "method": "sendBundle",
                "params": [encoded],
            });

            let result = async {
                let response: serde_json::Value = client
                    .post(&url)
                    .json(&payload)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                if let Some(err) = response.get("error") {
                    return Err(anyhow!("relay rejected bundle: {err}"));
                }
                response
                    .get("result")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .ok_or_else(|| anyhow!("relay response missing bundle id"))
            }
            .await;

            let _ = ack_tx.send(result);
        });

        ack_rx
    }

    /// Consume a bundle ack off the hot path. Counts a relay win when the
    /// ack lands before the on-chain confirmation flag flips.
    pub fn consume_ack(&self, ack_rx: oneshot::Receiver<Result<String>>, confirmed: Arc<AtomicBool>) {
        let telemetry = self.telemetry.clone();
        tokio::spawn(async move {
            match ack_rx.await {
                Ok(Ok(bundle_id)) => {
                    if !confirmed.load(Ordering::SeqCst) {
                        telemetry.relay_win_total.inc();
                    }
                    debug!(%bundle_id, "relay ack received");
                }
                Ok(Err(e)) => debug!("relay ack error: {e:#}"),
                Err(_) => {}
            }
        });
    }
}
