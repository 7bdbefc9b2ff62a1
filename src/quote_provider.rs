use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::session_cache::now_ms;

/// Swap direction, matching the aggregator wire format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwapMode {
    #[default]
    ExactIn,
    ExactOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuoteRequest {
    pub input_mint: String,
    pub output_mint: String,
    pub amount: u64,
    pub slippage_bps: u16,
    pub mode: SwapMode,
}

/// A priced route from the quote service. `raw` carries the provider's
/// full response so the swap build round-trips it untouched.
#[derive(Debug, Clone)]
pub struct Quote {
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: u64,
    pub out_amount: u64,
    pub price_impact_pct: f64,
    pub slippage_bps: u16,
    pub mode: SwapMode,
    pub raw: Value,
    pub fetched_at_ms: u64,
    pub latency_ms: u64,
}

impl Quote {
    pub fn age_ms(&self) -> u64 {
        now_ms().saturating_sub(self.fetched_at_ms)
    }
}

/// Knobs applied when the provider assembles the swap transaction.
#[derive(Debug, Clone, Default)]
pub struct SwapBuildOptions {
    pub user_pubkey: String,
    pub priority_fee_lamports: u64,
    pub tip_lamports: u64,
    pub compute_unit_limit: Option<u32>,
    /// Route the swap through the single-pool direct path when available.
    pub direct_route_only: bool,
}

/// Narrow interface to the external quote/swap service.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    async fn fetch_quote(&self, request: &QuoteRequest) -> Result<Quote>;

    /// Build an unsigned transaction for a previously fetched quote.
    /// Returns raw wire bytes ready for signing.
    async fn build_swap_transaction(&self, quote: &Quote, opts: &SwapBuildOptions) -> Result<Vec<u8>>;
}

/// Jupiter-style HTTP client implementation.
pub struct HttpQuoteProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpQuoteProvider {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building quote http client")?;
        Ok(Self { client, base_url })
    }
}

fn field_u64(value: &Value, field: &str) -> Result<u64> {
    let v = value
        .get(field)
        .ok_or_else(|| anyhow!("quote response missing {field}"))?;
    if let Some(n) = v.as_u64() {
        return Ok(n);
    }
    v.as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("quote field {field} is not an amount"))
}

#[async_trait]
impl QuoteProvider for HttpQuoteProvider {
    async fn fetch_quote(&self, request: &QuoteRequest) -> Result<Quote> {
        let started = std::time::Instant::now();
        let mode = match request.mode {
            SwapMode::ExactIn => "ExactIn",
            SwapMode::ExactOut => "ExactOut",
        };
        let url = format!(
            "{}/quote?inputMint={}&outputMint={}&amount={}&slippageBps={}&swapMode={}",
            self.base_url,
            request.input_mint,
            request.output_mint,
            request.amount,
            request.slippage_bps,
            mode,
        );

        let raw: Value = self
            .client
            .get(&url)
            .send()
            .await
            .context("quote request failed")?
            .error_for_status()
            .context("quote request rejected")?
            .json()
            .await
            .context("quote response was not json")?;

        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(input = %request.input_mint, output = %request.output_mint, latency_ms, "quote fetched");

        let price_impact_pct = raw
            .get("priceImpactPct")
            .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or(v.as_f64()))
            .unwrap_or(0.0);

        Ok(Quote {
            input_mint: request.input_mint.clone(),
            output_mint: request.output_mint.clone(),
            in_amount: field_u64(&raw, "inAmount")?,
            out_amount: field_u64(&raw, "outAmount")?,
            price_impact_pct,
            slippage_bps: request.slippage_bps,
            mode: request.mode,
            raw,
            fetched_at_ms: now_ms(),
            latency_ms,
        })
    }

    async fn build_swap_transaction(&self, quote: &Quote, opts: &SwapBuildOptions) -> Result<Vec<u8>> {
        let mut body = serde_json::json!({
            "quoteResponse": quote.raw,
            "userPublicKey": opts.user_pubkey,
            "wrapAndUnwrapSol": true,
            "prioritizationFeeLamports": opts.priority_fee_lamports,
        });
        if let Some(limit) = opts.compute_unit_limit {
            body["computeUnitLimit"] = Value::from(limit);
        }
        if opts.tip_lamports > 0 {
            body["tipLamports"] = Value::from(opts.tip_lamports);
        }
        if opts.direct_route_only {
            body["onlyDirectRoutes"] = Value::from(true);
        }

        let response: Value = self
            .client
            .post(format!("{}/swap", self.base_url))
            .json(&body)
            .send()
            .await
            .context("swap build request failed")?
            .error_for_status()
            .context("swap build rejected")?
            .json()
            .await
            .context("swap build response was not json")?;

        let encoded = response
            .get("swapTransaction")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("swap response missing swapTransaction"))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("swapTransaction was not base64")
    }
}
