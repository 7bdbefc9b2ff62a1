use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::config::SessionConfig;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: String,
    pub wallet_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, wallet_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), wallet_id: wallet_id.into() }
    }
}

struct ArmSession {
    dek: Zeroizing<[u8; 32]>,
    expires_at_ms: u64,
    #[allow(dead_code)]
    created_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub armed: bool,
    pub ms_left: u64,
}

/// Process-wide map of armed (user, wallet) sessions. DEKs live only in
/// here; callers borrow them for the duration of one closure and never
/// hold a copy. The map mutex guards inserts and deletes only; slow work
/// (KDFs, RPC, disk) happens outside it.
pub struct SessionCache {
    sessions: Mutex<HashMap<SessionKey, ArmSession>>,
    key_locks: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
    cfg: SessionConfig,
    expiry_tx: Mutex<Option<mpsc::UnboundedSender<SessionKey>>>,
}

impl SessionCache {
    pub fn new(cfg: SessionConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            cfg,
            expiry_tx: Mutex::new(None),
        }
    }

    /// Register the channel the sweeper notifies when a session expires.
    pub fn set_expiry_channel(&self, tx: mpsc::UnboundedSender<SessionKey>) {
        *self.expiry_tx.lock() = Some(tx);
    }

    /// Per-key async lock serializing arm/extend/disarm for one wallet.
    /// Concurrent arms queue here; the last one to finish defines the session.
    pub fn key_lock(&self, key: &SessionKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock();
        locks.entry(key.clone()).or_default().clone()
    }

    /// Insert or overwrite the session for (user, wallet).
    pub fn arm(&self, key: SessionKey, dek: Zeroizing<[u8; 32]>, ttl_ms: u64) {
        let now = now_ms();
        let session = ArmSession { dek, expires_at_ms: now + ttl_ms, created_at_ms: now };
        self.sessions.lock().insert(key.clone(), session);
        info!(user = %key.user_id, wallet = %key.wallet_id, ttl_ms, "🔓 session armed");
    }

    /// Push the expiry out for an existing, still-live session. Returns
    /// false for a missing or expired entry, never an implicit re-arm.
    pub fn extend(&self, key: &SessionKey, ttl_ms: u64) -> bool {
        let now = now_ms();
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(key) {
            Some(session) if session.expires_at_ms > now => {
                session.expires_at_ms = now + ttl_ms;
                debug!(user = %key.user_id, wallet = %key.wallet_id, ttl_ms, "session extended");
                true
            }
            _ => false,
        }
    }

    /// Best-effort removal; the DEK buffer is zeroed as it drops.
    pub fn disarm(&self, key: &SessionKey) {
        if self.sessions.lock().remove(key).is_some() {
            info!(user = %key.user_id, wallet = %key.wallet_id, "🔒 session disarmed");
        }
    }

    pub fn status(&self, key: &SessionKey) -> SessionStatus {
        let now = now_ms();
        let sessions = self.sessions.lock();
        match sessions.get(key) {
            Some(session) if session.expires_at_ms > now => SessionStatus {
                armed: true,
                ms_left: session.expires_at_ms.saturating_sub(now),
            },
            _ => SessionStatus { armed: false, ms_left: 0 },
        }
    }

    /// Run `f` against the session DEK, if armed. The DEK is copied into a
    /// zeroizing guard so the map lock is released before `f` runs, and the
    /// copy is wiped as soon as `f` returns.
    pub fn with_dek<R>(&self, key: &SessionKey, f: impl FnOnce(&[u8; 32]) -> R) -> Option<R> {
        let dek = {
            let sessions = self.sessions.lock();
            let session = sessions.get(key)?;
            if session.expires_at_ms <= now_ms() {
                return None;
            }
            Zeroizing::new(*session.dek)
        };
        Some(f(&dek))
    }

    /// Remove expired sessions, zeroing their DEKs, and notify the
    /// auto-return side for each one. Returns the expired keys.
    pub fn sweep_once(&self) -> Vec<SessionKey> {
        let now = now_ms();
        let expired: Vec<SessionKey> = {
            let mut sessions = self.sessions.lock();
            let dead: Vec<SessionKey> = sessions
                .iter()
                .filter(|(_, s)| s.expires_at_ms <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &dead {
                sessions.remove(key);
            }
            dead
        };

        if !expired.is_empty() {
            info!(count = expired.len(), "swept expired arm sessions");
            let tx = self.expiry_tx.lock().clone();
            if let Some(tx) = tx {
                for key in &expired {
                    let _ = tx.send(key.clone());
                }
            }
        }
        expired
    }

    /// Background sweeper; runs until the cache is dropped by everyone else.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = Duration::from_millis(cache.cfg.sweep_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                cache.sweep_once();
            }
        })
    }

    pub fn armed_count(&self) -> usize {
        let now = now_ms();
        self.sessions.lock().values().filter(|s| s.expires_at_ms > now).count()
    }

    /// Drop every session. Called on process shutdown so no DEK outlives
    /// the cache.
    pub fn shutdown(&self) {
        let mut sessions = self.sessions.lock();
        let n = sessions.len();
        sessions.clear();
        if n > 0 {
            info!(count = n, "cleared arm sessions on shutdown");
        }
    }

    pub fn default_ttl_ms(&self) -> u64 {
        self.cfg.default_ttl_minutes * 60_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> SessionCache {
        SessionCache::new(SessionConfig::default())
    }

    fn dek(byte: u8) -> Zeroizing<[u8; 32]> {
        Zeroizing::new([byte; 32])
    }

    #[test]
    fn arm_then_status_reports_ms_left() {
        let c = cache();
        let key = SessionKey::new("u", "w");
        c.arm(key.clone(), dek(1), 60_000);

        let status = c.status(&key);
        assert!(status.armed);
        assert!(status.ms_left > 59_000 && status.ms_left <= 60_000);
    }

    #[test]
    fn status_of_unknown_wallet_is_unarmed_zero() {
        let c = cache();
        let status = c.status(&SessionKey::new("u", "nope"));
        assert_eq!(status, SessionStatus { armed: false, ms_left: 0 });
    }

    #[test]
    fn extend_requires_live_session() {
        let c = cache();
        let key = SessionKey::new("u", "w");
        assert!(!c.extend(&key, 60_000));

        c.arm(key.clone(), dek(1), 60_000);
        assert!(c.extend(&key, 120_000));
        assert!(c.status(&key).ms_left > 60_000);
    }

    #[test]
    fn with_dek_sees_armed_value_and_expiry() {
        let c = cache();
        let key = SessionKey::new("u", "w");
        c.arm(key.clone(), dek(7), 60_000);

        let first = c.with_dek(&key, |d| d[0]);
        assert_eq!(first, Some(7));

        // Zero TTL entry is expired on the next read.
        c.arm(key.clone(), dek(9), 0);
        assert!(c.with_dek(&key, |d| d[0]).is_none());
    }

    #[test]
    fn sweep_removes_expired_and_notifies() {
        let c = cache();
        let (tx, mut rx) = mpsc::unbounded_channel();
        c.set_expiry_channel(tx);

        let live = SessionKey::new("u", "live");
        let dead = SessionKey::new("u", "dead");
        c.arm(live.clone(), dek(1), 60_000);
        c.arm(dead.clone(), dek(2), 0);

        let expired = c.sweep_once();
        assert_eq!(expired, vec![dead.clone()]);
        assert_eq!(rx.try_recv().unwrap(), dead);
        assert!(c.status(&live).armed);
    }

    #[test]
    fn disarm_and_shutdown_clear_entries() {
        let c = cache();
        let key = SessionKey::new("u", "w");
        c.arm(key.clone(), dek(1), 60_000);
        c.disarm(&key);
        assert!(!c.status(&key).armed);

        c.arm(key.clone(), dek(1), 60_000);
        c.shutdown();
        assert_eq!(c.armed_count(), 0);
    }
}
