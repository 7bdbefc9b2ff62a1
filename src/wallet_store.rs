use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::AutoReturnConfig;
use crate::envelope_crypto::Envelope;
use crate::session_cache::now_ms;

#[derive(Debug, Clone)]
pub struct WalletRow {
    pub id: String,
    pub user_id: String,
    pub label: Option<String>,
    pub pubkey: String,
    pub is_protected: bool,
    pub envelope: Option<Envelope>,
    pub legacy_private_key: Option<String>,
    pub passphrase_hash: Option<String>,
    pub passphrase_hint: Option<String>,
}

/// Wallet rows plus the per-user flags the arm surface reads: the global
/// default pass-phrase hash, the require-arm toggle, and auto-return
/// settings.
#[derive(Clone)]
pub struct WalletStore {
    conn: Arc<Mutex<Connection>>,
}

impl WalletStore {
    pub fn new(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("creating data directory")?;
            }
        }
        let conn = Connection::open(db_path).context("opening wallet database")?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("../schema.sql"))
            .context("initializing wallet schema")?;
        info!("✅ wallet store ready");
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn row_to_wallet(row: &Row<'_>) -> rusqlite::Result<WalletRow> {
        let envelope_raw: Option<String> = row.get("envelope")?;
        Ok(WalletRow {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            label: row.get("label")?,
            pubkey: row.get("pubkey")?,
            is_protected: row.get::<_, i64>("is_protected")? != 0,
            envelope: envelope_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
            legacy_private_key: row.get("legacy_private_key")?,
            passphrase_hash: row.get("passphrase_hash")?,
            passphrase_hint: row.get("passphrase_hint")?,
        })
    }

    pub fn insert_wallet(&self, wallet: &WalletRow) -> Result<()> {
        let envelope = wallet
            .envelope
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serializing envelope")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO wallets (
                id, user_id, label, pubkey, is_protected, envelope,
                legacy_private_key, passphrase_hash, passphrase_hint, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                wallet.id,
                wallet.user_id,
                wallet.label,
                wallet.pubkey,
                wallet.is_protected as i64,
                envelope,
                wallet.legacy_private_key,
                wallet.passphrase_hash,
                wallet.passphrase_hint,
                now_ms() as i64,
            ],
        )
        .context("inserting wallet")?;
        Ok(())
    }

    pub fn get_wallet(&self, user_id: &str, wallet_id: &str) -> Result<Option<WalletRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM wallets WHERE user_id = ?1 AND id = ?2",
            params![user_id, wallet_id],
            Self::row_to_wallet,
        )
        .optional()
        .context("loading wallet")
    }

    pub fn wallets_for_user(&self, user_id: &str) -> Result<Vec<WalletRow>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM wallets WHERE user_id = ?1 ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map(params![user_id], Self::row_to_wallet)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Atomically install a protected envelope: sets the protection flag,
    /// writes the envelope and pass-phrase hash, and clears any legacy
    /// secret in the same statement. There is no intermediate state.
    pub fn store_protected_envelope(
        &self,
        user_id: &str,
        wallet_id: &str,
        envelope: &Envelope,
        passphrase_hash: Option<&str>,
        passphrase_hint: Option<&str>,
    ) -> Result<()> {
        let raw = serde_json::to_string(envelope)?;
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE wallets SET
                is_protected = 1,
                envelope = ?3,
                legacy_private_key = NULL,
                passphrase_hash = COALESCE(?4, passphrase_hash),
                passphrase_hint = COALESCE(?5, passphrase_hint)
             WHERE user_id = ?1 AND id = ?2",
            params![user_id, wallet_id, raw, passphrase_hash, passphrase_hint],
        )?;
        if updated == 0 {
            anyhow::bail!("wallet {wallet_id} not found for user {user_id}");
        }
        Ok(())
    }

    /// Drop to the unprotected envelope form, clearing the pass-phrase
    /// material.
    pub fn store_unprotected_envelope(
        &self,
        user_id: &str,
        wallet_id: &str,
        envelope: &Envelope,
    ) -> Result<()> {
        let raw = serde_json::to_string(envelope)?;
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE wallets SET
                is_protected = 0,
                envelope = ?3,
                legacy_private_key = NULL,
                passphrase_hash = NULL,
                passphrase_hint = NULL
             WHERE user_id = ?1 AND id = ?2",
            params![user_id, wallet_id, raw],
        )?;
        if updated == 0 {
            anyhow::bail!("wallet {wallet_id} not found for user {user_id}");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-user flags
    // ------------------------------------------------------------------

    pub fn ensure_user(&self, user_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("INSERT OR IGNORE INTO users (id) VALUES (?1)", params![user_id])?;
        Ok(())
    }

    pub fn default_passphrase_hash(&self, user_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT default_passphrase_hash FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()
        .map(|v: Option<Option<String>>| v.flatten())
        .context("loading default passphrase hash")
    }

    pub fn set_default_passphrase_hash(&self, user_id: &str, hash: &str) -> Result<()> {
        self.ensure_user(user_id)?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET default_passphrase_hash = ?2 WHERE id = ?1",
            params![user_id, hash],
        )?;
        Ok(())
    }

    pub fn require_arm(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let flag: Option<i64> = conn
            .query_row("SELECT require_arm FROM users WHERE id = ?1", params![user_id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(flag.unwrap_or(0) != 0)
    }

    pub fn set_require_arm(&self, user_id: &str, required: bool) -> Result<()> {
        self.ensure_user(user_id)?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET require_arm = ?2 WHERE id = ?1",
            params![user_id, required as i64],
        )?;
        Ok(())
    }

    pub fn auto_return_config(&self, user_id: &str) -> Result<Option<AutoReturnConfig>> {
        let conn = self.conn.lock();
        let raw: Option<Option<String>> = conn
            .query_row("SELECT auto_return FROM users WHERE id = ?1", params![user_id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(raw.flatten().and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    pub fn set_auto_return_config(&self, user_id: &str, cfg: &AutoReturnConfig) -> Result<()> {
        self.ensure_user(user_id)?;
        let raw = serde_json::to_string(cfg)?;
        let conn = self.conn.lock();
        conn.execute("UPDATE users SET auto_return = ?2 WHERE id = ?1", params![user_id, raw])?;
        Ok(())
    }
}
