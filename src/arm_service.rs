use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::auto_return::{AutoReturnOverride, AutoReturnScheduler};
use crate::config::{AutoReturnConfig, EnvelopeConfig};
use crate::envelope_crypto::{self, aad_for, CryptoError};
use crate::session_cache::{now_ms, SessionCache, SessionKey};
use crate::trade_store::TradeStore;
use crate::wallet_store::{WalletRow, WalletStore};

#[derive(Debug, Error)]
pub enum ArmError {
    #[error("{0}")]
    BadRequest(String),
    #[error("wallet not found")]
    WalletNotFound,
    #[error("invalid passphrase")]
    InvalidPassphrase,
    #[error("not armed")]
    NotArmed,
    #[error("crypto failure: {0}")]
    CryptoFailure(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for ArmError {
    fn from(e: anyhow::Error) -> Self {
        ArmError::Storage(format!("{e:#}"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArmRequest {
    pub wallet_id: String,
    pub passphrase: String,
    pub ttl_minutes: u64,
    pub apply_to_all: bool,
    pub passphrase_hint: Option<String>,
    pub force_overwrite: bool,
    pub auto_return: Option<AutoReturnOverride>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmOutcome {
    pub armed_for_minutes: u64,
    pub migrated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GuardianCounts {
    pub open_trades: u64,
    pub active_rules: u64,
    pub armed_sessions: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StatusOutcome {
    pub armed: bool,
    pub ms_left: u64,
    pub auto_return_triggered: bool,
    pub passphrase_hint: Option<String>,
    pub guardian: Option<GuardianCounts>,
}

/// Arm/extend/disarm/status plus protection management. Every mutation of
/// one wallet's session serializes on the cache's per-key lock.
pub struct ArmService {
    wallets: WalletStore,
    sessions: Arc<SessionCache>,
    auto_return: Arc<AutoReturnScheduler>,
    trades: TradeStore,
    envelope_cfg: EnvelopeConfig,
    server_secret: String,
}

impl ArmService {
    pub fn new(
        wallets: WalletStore,
        sessions: Arc<SessionCache>,
        auto_return: Arc<AutoReturnScheduler>,
        trades: TradeStore,
        envelope_cfg: EnvelopeConfig,
        server_secret: String,
    ) -> Arc<Self> {
        Arc::new(Self { wallets, sessions, auto_return, trades, envelope_cfg, server_secret })
    }

    fn load_wallet(&self, user_id: &str, wallet_id: &str) -> Result<WalletRow, ArmError> {
        self.wallets
            .get_wallet(user_id, wallet_id)
            .map_err(|e| ArmError::Storage(format!("{e:#}")))?
            .ok_or(ArmError::WalletNotFound)
    }

    /// Recover the raw secret from whatever pre-envelope storage the wallet
    /// still carries: the `iv:tag:ct` legacy blob or a bare base58 key.
    fn recover_legacy_secret(&self, blob: &str) -> Result<Zeroizing<Vec<u8>>, ArmError> {
        match envelope_crypto::decrypt_legacy(blob, &self.server_secret) {
            Ok(secret) => Ok(secret),
            Err(CryptoError::UnsupportedLegacyFormat) => {
                let decoded = bs58::decode(blob)
                    .into_vec()
                    .map_err(|_| ArmError::CryptoFailure("unrecognized legacy secret format".into()))?;
                if decoded.len() != 64 {
                    return Err(ArmError::CryptoFailure("legacy secret is not 64 bytes".into()));
                }
                Ok(Zeroizing::new(decoded))
            }
            Err(e) => Err(ArmError::CryptoFailure(e.to_string())),
        }
    }

    /// Unlock a wallet for `ttl_minutes`. Legacy and unprotected storage is
    /// migrated to a protected envelope in place on first arm; there is no
    /// persisted intermediate state.
    pub async fn arm(&self, user_id: &str, request: &ArmRequest) -> Result<ArmOutcome, ArmError> {
        let ttl_minutes = if request.ttl_minutes < 1 {
            self.sessions.default_ttl_ms() / 60_000
        } else {
            request.ttl_minutes
        };

        let key = SessionKey::new(user_id, &request.wallet_id);
        let lock = self.sessions.key_lock(&key);
        let _guard = lock.lock().await;

        let wallet = self.load_wallet(user_id, &request.wallet_id)?;
        let aad = aad_for(user_id, &request.wallet_id);

        let (dek, migrated) = match wallet.envelope.as_ref() {
            Some(envelope) if envelope.is_protected() => {
                // Cheap hash check first; per-wallet hash wins over the
                // user-global default.
                let stored_hash = match wallet.passphrase_hash.as_ref() {
                    Some(hash) => Some(hash.clone()),
                    None => self.wallets.default_passphrase_hash(user_id)?,
                };
                if let Some(hash) = stored_hash {
                    if !envelope_crypto::verify_passphrase(&request.passphrase, &hash) {
                        return Err(ArmError::InvalidPassphrase);
                    }
                }
                let dek = envelope_crypto::unwrap_dek(envelope, &request.passphrase, &aad)
                    .map_err(|e| match e {
                        CryptoError::BadPassphrase => ArmError::InvalidPassphrase,
                        other => ArmError::CryptoFailure(other.to_string()),
                    })?;
                (dek, false)
            }
            Some(envelope) => {
                // Unprotected HKDF envelope: open with the server key, then
                // migrate under the caller's passphrase.
                let secret = envelope_crypto::decrypt_unprotected(
                    envelope,
                    user_id,
                    &self.server_secret,
                    &aad,
                )
                .map_err(|e| ArmError::CryptoFailure(e.to_string()))?;
                let dek = self.migrate_to_protected(user_id, &request.wallet_id, &secret, request)?;
                (dek, true)
            }
            None => {
                let blob = wallet
                    .legacy_private_key
                    .as_ref()
                    .ok_or_else(|| ArmError::BadRequest("wallet has no key material".into()))?;
                let secret = self.recover_legacy_secret(blob)?;
                let dek = self.migrate_to_protected(user_id, &request.wallet_id, &secret, request)?;
                (dek, true)
            }
        };

        let ttl_ms = ttl_minutes * 60_000;
        self.sessions.arm(key.clone(), dek, ttl_ms);
        self.auto_return
            .schedule(key, now_ms() + ttl_ms, request.auto_return.clone());

        if migrated {
            info!(user = user_id, wallet = %request.wallet_id, "wallet migrated to protected envelope");
        }
        Ok(ArmOutcome { armed_for_minutes: ttl_minutes, migrated })
    }

    fn migrate_to_protected(
        &self,
        user_id: &str,
        wallet_id: &str,
        secret: &[u8],
        request: &ArmRequest,
    ) -> Result<Zeroizing<[u8; 32]>, ArmError> {
        if request.passphrase.is_empty() {
            return Err(ArmError::BadRequest("passphrase is required".into()));
        }
        let aad = aad_for(user_id, wallet_id);
        let (envelope, dek) =
            envelope_crypto::encrypt_secret(secret, &request.passphrase, &aad, &self.envelope_cfg)
                .map_err(|e| ArmError::CryptoFailure(e.to_string()))?;
        let hash = envelope_crypto::hash_passphrase(&request.passphrase)
            .map_err(|e| ArmError::CryptoFailure(e.to_string()))?;

        self.wallets
            .store_protected_envelope(
                user_id,
                wallet_id,
                &envelope,
                Some(&hash),
                request.passphrase_hint.as_deref(),
            )
            .map_err(|e| ArmError::Storage(format!("{e:#}")))?;

        if request.apply_to_all {
            self.wallets.set_default_passphrase_hash(user_id, &hash)?;
        }
        Ok(dek)
    }

    /// Push the session expiry out. Fails for a missing or lapsed session.
    pub async fn extend(
        &self,
        user_id: &str,
        wallet_id: &str,
        ttl_minutes: u64,
    ) -> Result<u64, ArmError> {
        let ttl_minutes = ttl_minutes.max(1);
        let key = SessionKey::new(user_id, wallet_id);
        let lock = self.sessions.key_lock(&key);
        let _guard = lock.lock().await;

        let ttl_ms = ttl_minutes * 60_000;
        if !self.sessions.extend(&key, ttl_ms) {
            return Err(ArmError::NotArmed);
        }
        self.auto_return.schedule(key, now_ms() + ttl_ms, None);
        Ok(ttl_minutes)
    }

    pub async fn disarm(&self, user_id: &str, wallet_id: &str) -> Result<(), ArmError> {
        let key = SessionKey::new(user_id, wallet_id);
        let lock = self.sessions.key_lock(&key);
        let _guard = lock.lock().await;

        self.sessions.disarm(&key);
        self.auto_return.cancel(&key);
        Ok(())
    }

    pub fn status(
        &self,
        user_id: &str,
        wallet_id: &str,
        include_guardian: bool,
    ) -> Result<StatusOutcome, ArmError> {
        let key = SessionKey::new(user_id, wallet_id);
        let session = self.sessions.status(&key);
        let wallet = self.load_wallet(user_id, wallet_id)?;

        let guardian = if include_guardian {
            Some(GuardianCounts {
                open_trades: self.trades.open_trade_count(user_id)?,
                active_rules: self.trades.active_rule_count(user_id)?,
                armed_sessions: self.sessions.armed_count() as u64,
            })
        } else {
            None
        };

        Ok(StatusOutcome {
            armed: session.armed,
            ms_left: session.ms_left,
            auto_return_triggered: self.auto_return.consume_triggered(&key),
            passphrase_hint: wallet.passphrase_hint,
            guardian,
        })
    }

    /// Set a pass-phrase (migrating to the protected envelope) without
    /// creating a session.
    pub fn setup_protection(&self, user_id: &str, request: &ArmRequest) -> Result<bool, ArmError> {
        if request.passphrase.is_empty() {
            return Err(ArmError::BadRequest("passphrase is required".into()));
        }
        let wallet = self.load_wallet(user_id, &request.wallet_id)?;
        let aad = aad_for(user_id, &request.wallet_id);

        let secret = match wallet.envelope.as_ref() {
            Some(envelope) if envelope.is_protected() => {
                return Err(ArmError::BadRequest("wallet is already protected".into()));
            }
            Some(envelope) => envelope_crypto::decrypt_unprotected(
                envelope,
                user_id,
                &self.server_secret,
                &aad,
            )
            .map_err(|e| ArmError::CryptoFailure(e.to_string()))?,
            None => {
                let blob = wallet
                    .legacy_private_key
                    .as_ref()
                    .ok_or_else(|| ArmError::BadRequest("wallet has no key material".into()))?;
                self.recover_legacy_secret(blob)?
            }
        };

        // DEK is dropped immediately: protection without unlocking.
        let _ = self.migrate_to_protected(user_id, &request.wallet_id, &secret, request)?;
        Ok(true)
    }

    /// Re-wrap under the server-derived key alone. Requires the passphrase;
    /// any live session is torn down.
    pub async fn remove_protection(
        &self,
        user_id: &str,
        wallet_id: &str,
        passphrase: &str,
    ) -> Result<(), ArmError> {
        let key = SessionKey::new(user_id, wallet_id);
        let lock = self.sessions.key_lock(&key);
        let _guard = lock.lock().await;

        let wallet = self.load_wallet(user_id, wallet_id)?;
        let envelope = wallet
            .envelope
            .as_ref()
            .filter(|e| e.is_protected())
            .ok_or_else(|| ArmError::BadRequest("wallet is not protected".into()))?;
        let aad = aad_for(user_id, wallet_id);

        let dek = envelope_crypto::unwrap_dek(envelope, passphrase, &aad).map_err(|e| match e {
            CryptoError::BadPassphrase => ArmError::InvalidPassphrase,
            other => ArmError::CryptoFailure(other.to_string()),
        })?;
        let secret = envelope_crypto::decrypt_secret_with_dek(envelope, &dek, &aad)
            .map_err(|e| ArmError::CryptoFailure(e.to_string()))?;

        let unprotected =
            envelope_crypto::encrypt_unprotected(&secret, user_id, &self.server_secret, &aad)
                .map_err(|e| ArmError::CryptoFailure(e.to_string()))?;
        self.wallets
            .store_unprotected_envelope(user_id, wallet_id, &unprotected)
            .map_err(|e| ArmError::Storage(format!("{e:#}")))?;

        self.sessions.disarm(&key);
        self.auto_return.cancel(&key);
        warn!(user = user_id, wallet = wallet_id, "wallet protection removed");
        Ok(())
    }

    pub fn set_require_arm(&self, user_id: &str, required: bool) -> Result<(), ArmError> {
        self.wallets.set_require_arm(user_id, required)?;
        Ok(())
    }

    pub fn auto_return_settings(&self, user_id: &str) -> Result<AutoReturnConfig, ArmError> {
        Ok(self.wallets.auto_return_config(user_id)?.unwrap_or_default())
    }

    pub fn set_auto_return_settings(
        &self,
        user_id: &str,
        config: &AutoReturnConfig,
    ) -> Result<(), ArmError> {
        if let Some(dest) = config.dest_pubkey.as_ref() {
            if dest.parse::<solana_sdk::pubkey::Pubkey>().is_err() {
                return Err(ArmError::BadRequest("destination pubkey is invalid".into()));
            }
        }
        self.wallets.set_auto_return_config(user_id, config)?;
        Ok(())
    }
}
