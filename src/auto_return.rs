use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AutoReturnConfig;
use crate::session_cache::{now_ms, SessionKey};
use crate::wallet_store::WalletStore;

/// Per-session tweak to the user's auto-return defaults. A field that is
/// present wins over the stored configuration.
#[derive(Debug, Clone, Default)]
pub struct AutoReturnOverride {
    pub enabled: Option<bool>,
    pub dest_pubkey: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub dest_pubkey: String,
    pub keep_lamports: u64,
    pub sweep_tokens: bool,
    pub exclude_mints: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub sol_lamports: u64,
    pub token_accounts: u32,
    pub tx_hashes: Vec<String>,
}

/// Moves funds out of an expiring wallet. Implemented against live RPC in
/// `funds_sweeper`; mocked in tests.
#[async_trait]
pub trait SweepExecutor: Send + Sync {
    async fn sweep(&self, user_id: &str, wallet_id: &str, plan: &SweepPlan) -> Result<SweepReport>;
}

struct PendingFire {
    handle: JoinHandle<()>,
    expires_at_ms: u64,
}

/// One-shot timers keyed by (user, wallet). When an arm session lapses and
/// the user opted in, the wallet is swept to their declared destination
/// after the grace period.
pub struct AutoReturnScheduler {
    wallet_store: WalletStore,
    sweeper: Arc<dyn SweepExecutor>,
    pending: Mutex<HashMap<SessionKey, PendingFire>>,
    overrides: Mutex<HashMap<SessionKey, AutoReturnOverride>>,
    triggered: Mutex<HashSet<SessionKey>>,
}

impl AutoReturnScheduler {
    pub fn new(wallet_store: WalletStore, sweeper: Arc<dyn SweepExecutor>) -> Arc<Self> {
        Arc::new(Self {
            wallet_store,
            sweeper,
            pending: Mutex::new(HashMap::new()),
            overrides: Mutex::new(HashMap::new()),
            triggered: Mutex::new(HashSet::new()),
        })
    }

    /// Schedule (or reschedule) the fire for a session ending at
    /// `expires_at_ms`. The grace period from the user's settings pushes
    /// the actual fire past the expiry.
    pub fn schedule(
        self: &Arc<Self>,
        key: SessionKey,
        expires_at_ms: u64,
        session_override: Option<AutoReturnOverride>,
    ) {
        self.cancel(&key);
        if let Some(over) = session_override {
            self.overrides.lock().insert(key.clone(), over);
        }

        let grace_ms = self
            .wallet_store
            .auto_return_config(&key.user_id)
            .ok()
            .flatten()
            .map(|c| c.grace_seconds * 1_000)
            .unwrap_or(0);
        let fire_at_ms = expires_at_ms + grace_ms;

        let scheduler = Arc::clone(self);
        let fire_key = key.clone();
        let handle = tokio::spawn(async move {
            let delay = fire_at_ms.saturating_sub(now_ms());
            tokio::time::sleep(Duration::from_millis(delay)).await;
            scheduler.fire(&fire_key).await;
            scheduler.pending.lock().remove(&fire_key);
        });

        debug!(user = %key.user_id, wallet = %key.wallet_id, fire_at_ms, "auto-return scheduled");
        self.pending.lock().insert(key, PendingFire { handle, expires_at_ms });
    }

    /// Remove the pending fire and any session override.
    pub fn cancel(&self, key: &SessionKey) {
        if let Some(pending) = self.pending.lock().remove(key) {
            pending.handle.abort();
            debug!(user = %key.user_id, wallet = %key.wallet_id, "auto-return cancelled");
        }
        self.overrides.lock().remove(key);
    }

    pub fn pending_fire(&self, key: &SessionKey) -> Option<u64> {
        self.pending.lock().get(key).map(|p| p.expires_at_ms)
    }

    /// One-shot flag surfaced by the status endpoint; reading clears it.
    pub fn consume_triggered(&self, key: &SessionKey) -> bool {
        self.triggered.lock().remove(key)
    }

    /// Feed from the session sweeper. A session that expired without a
    /// pending fire (process restart, for instance) is swept on the spot.
    pub fn listen(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<SessionKey>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(key) = rx.recv().await {
                if scheduler.pending_fire(&key).is_none() {
                    scheduler.schedule(key, now_ms(), None);
                }
            }
        })
    }

    async fn fire(&self, key: &SessionKey) {
        let config = match self.wallet_store.auto_return_config(&key.user_id) {
            Ok(config) => config.unwrap_or_default(),
            Err(e) => {
                warn!(user = %key.user_id, "auto-return config load failed: {e:#}");
                return;
            }
        };
        let session_override = self.overrides.lock().remove(key).unwrap_or_default();

        // Override wins field-wise whenever present.
        let enabled = session_override.enabled.unwrap_or(config.enabled_default);
        let dest = session_override.dest_pubkey.or_else(|| config.dest_pubkey.clone());

        if !enabled {
            debug!(user = %key.user_id, wallet = %key.wallet_id, "auto-return disabled, skipping");
            return;
        }
        let Some(dest_pubkey) = dest.filter(|d| d.parse::<solana_sdk::pubkey::Pubkey>().is_ok()) else {
            warn!(user = %key.user_id, "auto-return enabled but destination missing or invalid");
            return;
        };

        let plan = SweepPlan {
            dest_pubkey,
            keep_lamports: config.sol_min_keep_lamports + config.fee_buffer_lamports,
            sweep_tokens: config.sweep_tokens,
            exclude_mints: config.exclude_mints.clone(),
        };

        match self.sweeper.sweep(&key.user_id, &key.wallet_id, &plan).await {
            Ok(report) => {
                info!(
                    user = %key.user_id,
                    wallet = %key.wallet_id,
                    sol_lamports = report.sol_lamports,
                    token_accounts = report.token_accounts,
                    "💸 auto-return sweep complete"
                );
                self.triggered.lock().insert(key.clone());
            }
            Err(e) => warn!(user = %key.user_id, wallet = %key.wallet_id, "auto-return sweep failed: {e:#}"),
        }
    }

    /// Abort every timer. Called on shutdown.
    pub fn shutdown(&self) {
        let mut pending = self.pending.lock();
        for (_, fire) in pending.drain() {
            fire.handle.abort();
        }
    }
}
