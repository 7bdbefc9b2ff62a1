use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::WatcherConfig;
use crate::constants::TRADE_DEDUP_WINDOW_SEC;
use crate::session_cache::now_ms;

/// Watcher settings riding on a trade row; the Smart-Exit loop reloads
/// these every tick so UI edits apply mid-flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeExtras {
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub is_paper: bool,
}

#[derive(Debug, Clone)]
pub struct Trade {
    pub id: String,
    pub user_id: String,
    pub wallet_id: String,
    pub wallet_label: Option<String>,
    pub mint: String,
    pub strategy: String,
    pub side: String,
    pub in_amount: u64,
    pub out_amount: u64,
    pub closed_out_amount: u64,
    pub entry_price: Option<f64>,
    pub entry_price_usd: Option<f64>,
    pub tx_hash: String,
    pub input_mint: String,
    pub output_mint: String,
    pub decimals: u8,
    pub slippage_bps: u16,
    pub mev_mode: Option<String>,
    pub priority_fee_lamports: u64,
    pub tip_lamports: u64,
    pub extras: Option<TradeExtras>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct ExitFill {
    pub exit_price: Option<f64>,
    pub exit_price_usd: Option<f64>,
    pub exit_tx_hash: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct NewTpSlRule {
    pub user_id: String,
    pub wallet_id: String,
    pub mint: String,
    pub strategy: String,
    pub tp: Option<f64>,
    pub sl: Option<f64>,
    pub tp_percent: Option<f64>,
    pub sl_percent: Option<f64>,
    pub entry_price: Option<f64>,
}

/// Open/closed trade persistence with the pre-send dedup guard and the
/// FIFO position reducer.
#[derive(Clone)]
pub struct TradeStore {
    conn: Arc<Mutex<Connection>>,
}

impl TradeStore {
    pub fn new(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("creating data directory")?;
            }
        }
        let conn = Connection::open(db_path).context("opening trade database")?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("../schema.sql"))
            .context("initializing trade schema")?;
        info!("✅ trade store ready");
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn row_to_trade(row: &Row<'_>) -> rusqlite::Result<Trade> {
        let extras_raw: Option<String> = row.get("extras")?;
        Ok(Trade {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            wallet_id: row.get("wallet_id")?,
            wallet_label: row.get("wallet_label")?,
            mint: row.get("mint")?,
            strategy: row.get("strategy")?,
            side: row.get("side")?,
            in_amount: row.get::<_, i64>("in_amount")? as u64,
            out_amount: row.get::<_, i64>("out_amount")? as u64,
            closed_out_amount: row.get::<_, i64>("closed_out_amount")? as u64,
            entry_price: row.get("entry_price")?,
            entry_price_usd: row.get("entry_price_usd")?,
            tx_hash: row.get("tx_hash")?,
            input_mint: row.get("input_mint")?,
            output_mint: row.get("output_mint")?,
            decimals: row.get::<_, i64>("decimals")? as u8,
            slippage_bps: row.get::<_, i64>("slippage_bps")? as u16,
            mev_mode: row.get("mev_mode")?,
            priority_fee_lamports: row.get::<_, i64>("priority_fee_lamports")? as u64,
            tip_lamports: row.get::<_, i64>("tip_lamports")? as u64,
            extras: extras_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
            created_at: row.get("created_at")?,
        })
    }

    pub fn insert_trade(&self, trade: &Trade) -> Result<()> {
        let extras = trade
            .extras
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serializing trade extras")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trades (
                id, user_id, wallet_id, wallet_label, mint, strategy, side,
                in_amount, out_amount, closed_out_amount, entry_price, entry_price_usd,
                tx_hash, input_mint, output_mint, decimals, slippage_bps, mev_mode,
                priority_fee_lamports, tip_lamports, extras, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            params![
                trade.id,
                trade.user_id,
                trade.wallet_id,
                trade.wallet_label,
                trade.mint,
                trade.strategy,
                trade.side,
                trade.in_amount as i64,
                trade.out_amount as i64,
                trade.closed_out_amount as i64,
                trade.entry_price,
                trade.entry_price_usd,
                trade.tx_hash,
                trade.input_mint,
                trade.output_mint,
                trade.decimals as i64,
                trade.slippage_bps as i64,
                trade.mev_mode,
                trade.priority_fee_lamports as i64,
                trade.tip_lamports as i64,
                extras,
                trade.created_at,
            ],
        )
        .context("inserting trade")?;
        Ok(())
    }

    /// Pre-send guard: the tx hash of an identical buy inside the recent
    /// window, if one exists.
    pub fn recent_duplicate(
        &self,
        user_id: &str,
        wallet_id: &str,
        mint: &str,
        strategy: &str,
    ) -> Result<Option<String>> {
        let cutoff = now_ms() as i64 - TRADE_DEDUP_WINDOW_SEC * 1_000;
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT tx_hash FROM trades
             WHERE user_id = ?1 AND wallet_id = ?2 AND mint = ?3 AND strategy = ?4
               AND side = 'buy' AND created_at >= ?5
             ORDER BY created_at DESC LIMIT 1",
            params![user_id, wallet_id, mint, strategy, cutoff],
            |row| row.get(0),
        )
        .optional()
        .context("querying recent duplicates")
    }

    pub fn get_trade(&self, id: &str) -> Result<Option<Trade>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT * FROM trades WHERE id = ?1", params![id], Self::row_to_trade)
            .optional()
            .context("loading trade")
    }

    pub fn update_extras(&self, id: &str, extras: &TradeExtras) -> Result<()> {
        let raw = serde_json::to_string(extras)?;
        let conn = self.conn.lock();
        conn.execute("UPDATE trades SET extras = ?2 WHERE id = ?1", params![id, raw])?;
        Ok(())
    }

    /// Open positions (anything not fully closed) for a user, optionally
    /// narrowed to one wallet and mint.
    pub fn open_trades(
        &self,
        user_id: &str,
        wallet_id: Option<&str>,
        mint: Option<&str>,
    ) -> Result<Vec<Trade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM trades
             WHERE user_id = ?1
               AND (?2 IS NULL OR wallet_id = ?2)
               AND (?3 IS NULL OR mint = ?3)
               AND side = 'buy' AND closed_out_amount < out_amount
             ORDER BY created_at ASC",
        )?;
        let trades = stmt
            .query_map(params![user_id, wallet_id, mint], Self::row_to_trade)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(trades)
    }

    pub fn open_trade_count(&self, user_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trades
             WHERE user_id = ?1 AND side = 'buy' AND closed_out_amount < out_amount",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Apply an exit quantity against the earliest open lots first. Lots
    /// that fully close get a closed_trades row; partially reduced lots
    /// keep their updated closed_out_amount. Returns the ids of fully
    /// closed trades.
    pub fn fifo_close(
        &self,
        user_id: &str,
        wallet_id: &str,
        mint: &str,
        strategy: &str,
        mut exit_quantity: u64,
        fill: &ExitFill,
    ) -> Result<Vec<String>> {
        let lots = self.open_trades(user_id, Some(wallet_id), Some(mint))?;
        let lots: Vec<&Trade> = lots.iter().filter(|t| t.strategy == strategy).collect();

        let mut closed_ids = Vec::new();
        let now = now_ms() as i64;
        let conn = self.conn.lock();
        for lot in lots {
            if exit_quantity == 0 {
                break;
            }
            let remaining = lot.out_amount - lot.closed_out_amount;
            let take = remaining.min(exit_quantity);
            exit_quantity -= take;
            let new_closed = lot.closed_out_amount + take;

            conn.execute(
                "UPDATE trades SET closed_out_amount = ?2 WHERE id = ?1",
                params![lot.id, new_closed as i64],
            )?;

            if new_closed == lot.out_amount {
                conn.execute(
                    "INSERT INTO closed_trades (
                        id, trade_id, user_id, wallet_id, mint, strategy,
                        in_amount, out_amount, closed_out_amount,
                        entry_price, entry_price_usd, exit_price, exit_price_usd,
                        exit_tx_hash, reason, exited_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    params![
                        Uuid::new_v4().to_string(),
                        lot.id,
                        lot.user_id,
                        lot.wallet_id,
                        lot.mint,
                        lot.strategy,
                        lot.in_amount as i64,
                        lot.out_amount as i64,
                        lot.out_amount as i64,
                        lot.entry_price,
                        lot.entry_price_usd,
                        fill.exit_price,
                        fill.exit_price_usd,
                        fill.exit_tx_hash,
                        fill.reason,
                        now,
                    ],
                )?;
                closed_ids.push(lot.id.clone());
            }
        }

        if exit_quantity > 0 {
            warn!(exit_quantity, mint, "exit quantity exceeded open position");
        }
        Ok(closed_ids)
    }

    pub fn closed_trade_reason(&self, trade_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT reason FROM closed_trades WHERE trade_id = ?1",
            params![trade_id],
            |row| row.get(0),
        )
        .optional()
        .context("loading closed trade")
    }

    // ------------------------------------------------------------------
    // TP/SL rules
    // ------------------------------------------------------------------

    pub fn create_tp_sl_rule(&self, rule: &NewTpSlRule) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tp_sl_rules (
                id, user_id, wallet_id, mint, strategy, tp, sl, tp_percent, sl_percent,
                entry_price, enabled, status, fail_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, 'active', 0)",
            params![
                id,
                rule.user_id,
                rule.wallet_id,
                rule.mint,
                rule.strategy,
                rule.tp,
                rule.sl,
                rule.tp_percent,
                rule.sl_percent,
                rule.entry_price,
            ],
        )
        .context("inserting tp/sl rule")?;
        Ok(id)
    }

    pub fn active_rule_count(&self, user_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tp_sl_rules WHERE user_id = ?1 AND status = 'active' AND enabled = 1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn set_rule_status(&self, rule_id: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("UPDATE tp_sl_rules SET status = ?2 WHERE id = ?1", params![rule_id, status])?;
        Ok(())
    }
}
