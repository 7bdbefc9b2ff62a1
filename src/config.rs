use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;

use crate::constants::*;

/// Envelope crypto parameters. The Argon2id costs are fixed per deployment
/// so existing envelopes keep unwrapping after upgrades.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EnvelopeConfig {
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            argon2_memory_kib: 64 * 1024,
            argon2_iterations: 3,
            argon2_parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SessionConfig {
    pub default_ttl_minutes: u64,
    pub sweep_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_ttl_minutes: DEFAULT_ARM_TTL_MINUTES,
            sweep_interval_ms: SESSION_SWEEP_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct IdempotencyConfig {
    pub ttl_sec: u64,
    /// Folded into the key so rapid duplicates collapse onto one bucket.
    pub bucket_ms: u64,
    pub salt: String,
    pub resume_path: String,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_sec: DEFAULT_IDEMPOTENCY_TTL_SEC,
            bucket_ms: DEFAULT_ID_KEY_BUCKET_MS,
            salt: String::new(),
            resume_path: "data/idempotency.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct QuoteCacheConfig {
    pub default_ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for QuoteCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: DEFAULT_QUOTE_TTL_MS,
            max_entries: 4_096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SizingConfig {
    pub max_impact_pct: f64,
    /// Ceiling as a fraction of the pool reserve, applied when reserves are known.
    pub max_pool_pct: f64,
    pub min_usd: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            max_impact_pct: 8.0,
            max_pool_pct: 2.0,
            min_usd: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ProbeConfig {
    pub enabled: bool,
    /// probe = base / max(2, scaleFactor)
    pub scale_factor: u64,
    pub abort_on_impact_pct: f64,
    pub delay_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scale_factor: 4,
            abort_on_impact_pct: 12.0,
            delay_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LeaderTimingConfig {
    pub enabled: bool,
    pub preflight_ms: u64,
    pub window_slots: u64,
    pub max_hold_ms: u64,
}

impl Default for LeaderTimingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            preflight_ms: 200,
            window_slots: 4,
            max_hold_ms: MAX_LEADER_HOLD_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 4_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct QuorumConfig {
    pub endpoints: Vec<String>,
    /// Distinct acks required before a send counts as accepted.
    pub quorum: usize,
    pub max_fanout: usize,
    pub stagger_ms: u64,
    pub timeout_ms: u64,
    pub blockhash_ttl_ms: u64,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["https://api.mainnet-beta.solana.com".to_string()],
            quorum: 1,
            max_fanout: 3,
            stagger_ms: DEFAULT_SEND_STAGGER_MS,
            timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            blockhash_ttl_ms: DEFAULT_BLOCKHASH_TTL_MS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AutoReturnConfig {
    pub enabled_default: bool,
    pub dest_pubkey: Option<String>,
    pub dest_verified_at: Option<i64>,
    pub grace_seconds: u64,
    pub sweep_tokens: bool,
    pub sol_min_keep_lamports: u64,
    pub fee_buffer_lamports: u64,
    #[serde(default)]
    pub exclude_mints: Vec<String>,
    #[serde(default)]
    pub usdc_mints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct WatcherConfig {
    pub mode: WatchMode,
    pub max_hold_sec: u64,
    pub min_pnl_before_time_exit_pct: f64,
    pub lp_drop_exit_pct: f64,
    pub authority_flip_exit: bool,
    pub interval_sec: u64,
    pub rug_delay_blocks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    Off,
    Time,
    Liquidity,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            mode: WatchMode::Off,
            max_hold_sec: 0,
            min_pnl_before_time_exit_pct: 0.0,
            lp_drop_exit_pct: 50.0,
            authority_flip_exit: true,
            interval_sec: 2,
            rug_delay_blocks: 0,
        }
    }
}

/// Top-level engine configuration, assembled once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EngineConfig {
    pub envelope: EnvelopeConfig,
    pub session: SessionConfig,
    pub idempotency: IdempotencyConfig,
    pub quote_cache: QuoteCacheConfig,
    pub sizing: SizingConfig,
    pub quorum: QuorumConfig,
    pub retry: RetryPolicy,
    /// Fallback unit price used by the sizer when no oracle price rides on the quote.
    pub sol_price_usd: f64,
    pub kill_switch: bool,
    pub encryption_secret: String,
}

impl EngineConfig {
    /// Load configuration from environment variables, with defaults for
    /// everything except the encryption secret.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut cfg = Self::default();

        cfg.encryption_secret =
            env::var("ENCRYPTION_SECRET").context("ENCRYPTION_SECRET environment variable required")?;

        if let Ok(v) = env::var("IDEMPOTENCY_TTL_SEC") {
            cfg.idempotency.ttl_sec = v.parse().context("IDEMPOTENCY_TTL_SEC must be an integer")?;
        }
        if let Ok(v) = env::var("IDEMPOTENCY_SALT") {
            cfg.idempotency.salt = v;
        }
        if let Ok(v) = env::var("RPC_POOL_ENDPOINTS") {
            let endpoints: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !endpoints.is_empty() {
                cfg.quorum.endpoints = endpoints;
            }
        }
        if let Ok(v) = env::var("RPC_POOL_QUORUM") {
            cfg.quorum.quorum = v.parse().context("RPC_POOL_QUORUM must be an integer")?;
        }
        if let Ok(v) = env::var("RPC_POOL_MAX_FANOUT") {
            cfg.quorum.max_fanout = v.parse().context("RPC_POOL_MAX_FANOUT must be an integer")?;
        }
        if let Ok(v) = env::var("RPC_POOL_STAGGER_MS") {
            cfg.quorum.stagger_ms = v.parse().context("RPC_POOL_STAGGER_MS must be an integer")?;
        }
        if let Ok(v) = env::var("RPC_POOL_TIMEOUT_MS") {
            cfg.quorum.timeout_ms = v.parse().context("RPC_POOL_TIMEOUT_MS must be an integer")?;
        }
        if let Ok(v) = env::var("SOL_PRICE_USD") {
            cfg.sol_price_usd = v.parse().context("SOL_PRICE_USD must be a number")?;
        }
        cfg.kill_switch = env::var("KILL_SWITCH").map(|v| v == "1").unwrap_or(false);

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = r#"{"enabled": true, "scaleFactor": 4, "abortOnImpactPct": 10.0, "delayMs": 100, "bogus": 1}"#;
        assert!(serde_json::from_str::<ProbeConfig>(raw).is_err());
    }

    #[test]
    fn retry_policy_defaults_match_contract() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.jitter_factor < 1.0);
    }

    #[test]
    fn watch_mode_round_trips_lowercase() {
        let m: WatchMode = serde_json::from_str("\"liquidity\"").unwrap();
        assert_eq!(m, WatchMode::Liquidity);
        assert_eq!(serde_json::to_string(&WatchMode::Time).unwrap(), "\"time\"");
    }
}
