use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::IdempotencyConfig;
use crate::session_cache::now_ms;
use crate::telemetry::Telemetry;

/// Deterministic duplicate-suppression key for one trade intent. The time
/// bucket folds rapid repeats of the same parameters onto one key; the salt
/// keeps keys unlinkable across deployments.
pub fn derive_id_key(
    user_id: &str,
    wallet_id: &str,
    mint: &str,
    amount: u64,
    at_ms: u64,
    cfg: &IdempotencyConfig,
) -> String {
    let slot_bucket = at_ms / cfg.bucket_ms.max(1);
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"|");
    hasher.update(wallet_id.as_bytes());
    hasher.update(b"|");
    hasher.update(mint.as_bytes());
    hasher.update(b"|");
    hasher.update(amount.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(slot_bucket.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(cfg.salt.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdStatus {
    Pending,
    Success,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub ts: u64,
    pub status: IdStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Outcome of asking the store whether a send may proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// No live record; a pending slot is now held for this key.
    Fresh,
    /// Another send with this key is in flight.
    Pending,
    /// A send with this key already completed; reuse its result.
    Done(String),
}

/// Two-tier idempotency store: an in-memory TTL gate for the hot path and a
/// crash-safe JSON resume file reloaded on boot.
pub struct IdempotencyStore {
    cfg: IdempotencyConfig,
    records: Mutex<HashMap<String, IdempotencyRecord>>,
    path: PathBuf,
}

impl IdempotencyStore {
    pub fn new(cfg: IdempotencyConfig) -> Self {
        let path = PathBuf::from(&cfg.resume_path);
        Self { cfg, records: Mutex::new(HashMap::new()), path }
    }

    fn ttl_ms(&self) -> u64 {
        self.cfg.ttl_sec * 1_000
    }

    fn is_live(&self, record: &IdempotencyRecord, now: u64) -> bool {
        now.saturating_sub(record.ts) < self.ttl_ms()
    }

    /// Load the resume file, dropping records past TTL. Call once at boot.
    pub async fn load(&self, telemetry: &Telemetry) -> Result<()> {
        telemetry.resume_attempts_total.inc();
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(_) => {
                debug!(path = %self.path.display(), "no idempotency resume file");
                return Ok(());
            }
        };

        let loaded: HashMap<String, IdempotencyRecord> =
            serde_json::from_str(&raw).context("parsing idempotency resume file")?;
        let now = now_ms();
        let mut restored = 0u64;
        {
            let mut records = self.records.lock();
            for (key, record) in loaded {
                if self.is_live(&record, now) {
                    records.insert(key, record);
                    restored += 1;
                }
            }
        }
        telemetry.resume_success_total.inc_by(restored);
        info!(restored, "idempotency resume window loaded");
        Ok(())
    }

    /// Check-and-set for one key. `Fresh` claims the pending slot; the
    /// caller must later `mark_success` or `release` it.
    pub fn begin(&self, key: &str) -> BeginOutcome {
        let now = now_ms();
        let mut records = self.records.lock();
        if let Some(record) = records.get(key) {
            if self.is_live(record, now) {
                return match record.status {
                    IdStatus::Pending => BeginOutcome::Pending,
                    IdStatus::Success => {
                        BeginOutcome::Done(record.result.clone().unwrap_or_default())
                    }
                };
            }
        }
        records.insert(
            key.to_string(),
            IdempotencyRecord { ts: now, status: IdStatus::Pending, result: None },
        );
        BeginOutcome::Fresh
    }

    /// Cached result for a live key, if any.
    pub fn lookup(&self, key: &str) -> Option<IdempotencyRecord> {
        let now = now_ms();
        let records = self.records.lock();
        records.get(key).filter(|r| self.is_live(r, now)).cloned()
    }

    pub fn mark_success(&self, key: &str, tx_hash: &str) {
        let mut records = self.records.lock();
        records.insert(
            key.to_string(),
            IdempotencyRecord {
                ts: now_ms(),
                status: IdStatus::Success,
                result: Some(tx_hash.to_string()),
            },
        );
    }

    /// Drop a pending claim after a terminal failure so a later attempt
    /// with the same parameters is not locked out for the full TTL.
    pub fn release(&self, key: &str) {
        let mut records = self.records.lock();
        if matches!(records.get(key).map(|r| r.status), Some(IdStatus::Pending)) {
            records.remove(key);
        }
    }

    /// Write the resume file atomically (temp + rename), GC-ing dead rows.
    pub async fn persist(&self) -> Result<()> {
        let snapshot = {
            let now = now_ms();
            let mut records = self.records.lock();
            records.retain(|_, r| self.is_live(r, now));
            records.clone()
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("renaming over {}", self.path.display()))?;
        Ok(())
    }

    pub fn resume_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IdempotencyStore {
    fn drop(&mut self) {
        // Final persist is the binary's job; dropping without one only
        // costs the in-memory gate, never correctness.
        let pending = self.records.lock().len();
        if pending > 0 {
            warn!(pending, "idempotency store dropped with live records");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(dir: &std::path::Path) -> IdempotencyConfig {
        IdempotencyConfig {
            ttl_sec: 60,
            bucket_ms: 30_000,
            salt: "pepper".to_string(),
            resume_path: dir.join("resume.json").to_string_lossy().into_owned(),
        }
    }

    #[test]
    fn key_is_deterministic_within_bucket() {
        let cfg = IdempotencyConfig::default();
        let a = derive_id_key("u", "w", "MINT", 1_000_000, 1_000, &cfg);
        let b = derive_id_key("u", "w", "MINT", 1_000_000, 2_000, &cfg);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = derive_id_key("u", "w", "MINT", 1_000_001, 1_000, &cfg);
        assert_ne!(a, c);

        // Next bucket, new key.
        let d = derive_id_key("u", "w", "MINT", 1_000_000, 1_000 + cfg.bucket_ms, &cfg);
        assert_ne!(a, d);
    }

    #[test]
    fn begin_gates_pending_and_replays_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdempotencyStore::new(cfg(dir.path()));

        assert_eq!(store.begin("k1"), BeginOutcome::Fresh);
        assert_eq!(store.begin("k1"), BeginOutcome::Pending);

        store.mark_success("k1", "txhash111");
        assert_eq!(store.begin("k1"), BeginOutcome::Done("txhash111".to_string()));
    }

    #[test]
    fn release_frees_only_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdempotencyStore::new(cfg(dir.path()));

        assert_eq!(store.begin("k1"), BeginOutcome::Fresh);
        store.release("k1");
        assert_eq!(store.begin("k1"), BeginOutcome::Fresh);

        store.mark_success("k1", "tx");
        store.release("k1");
        assert_eq!(store.begin("k1"), BeginOutcome::Done("tx".to_string()));
    }

    #[tokio::test]
    async fn resume_file_round_trips_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = Telemetry::new().unwrap();

        {
            let store = IdempotencyStore::new(cfg(dir.path()));
            store.begin("pending-key");
            store.mark_success("done-key", "tx42");
            store.persist().await.unwrap();
        }

        let store = IdempotencyStore::new(cfg(dir.path()));
        store.load(&telemetry).await.unwrap();
        assert_eq!(store.begin("pending-key"), BeginOutcome::Pending);
        assert_eq!(store.begin("done-key"), BeginOutcome::Done("tx42".to_string()));
        let text = telemetry.render().unwrap();
        assert!(text.contains("resume_attempts_total 1"));
        assert!(text.contains("resume_success_total 2"));
    }
}
