use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{WatchMode, WatcherConfig};
use crate::constants::SLOT_TIME_MS;
use crate::executor::{PostTradeTask, TradeConfig, TradeParams, TurboExecutor, UserCtx};
use crate::quote_provider::{QuoteProvider, QuoteRequest, SwapMode};
use crate::session_cache::now_ms;
use crate::telemetry::Telemetry;
use crate::trade_store::{ExitFill, Trade, TradeStore};

/// Fires the exit sell for a position. The executor implements this; the
/// trait keeps the watcher → executor edge one-way.
#[async_trait]
pub trait ExitSender: Send + Sync {
    async fn execute_exit(&self, trade: &Trade, amount: u64) -> Result<String>;
}

/// Freeze-authority lookup for the watched mint.
#[async_trait]
pub trait AuthorityProbe: Send + Sync {
    async fn freeze_authority(&self, mint: &str) -> Result<Option<String>>;
}

#[async_trait]
impl ExitSender for TurboExecutor {
    async fn execute_exit(&self, trade: &Trade, amount: u64) -> Result<String> {
        let user = UserCtx { user_id: trade.user_id.clone(), wallet_id: trade.wallet_id.clone() };
        let params = TradeParams {
            input_mint: trade.output_mint.clone(),
            output_mint: trade.input_mint.clone(),
            amount,
            slippage_bps: trade.slippage_bps,
            strategy: trade.strategy.clone(),
            wallet_label: trade.wallet_label.clone(),
            mev_mode: trade.mev_mode.clone(),
            priority_fee_lamports: trade.priority_fee_lamports,
            tip_lamports: trade.tip_lamports,
            decimals: trade.decimals,
            pool_reserve: None,
            unit_price_usd: None,
        };
        self.execute_sell(&user, &params, &TradeConfig::default())
            .await
            .map_err(|e| anyhow!(e.to_string()))
    }
}

/// Post-buy watcher: one cooperative loop per open position, re-evaluating
/// authority, liquidity, and time rules each tick. At most one exit fires
/// per position.
pub struct SmartExitWatcher {
    trades: TradeStore,
    quotes: Arc<dyn QuoteProvider>,
    exits: Arc<dyn ExitSender>,
    authority: Arc<dyn AuthorityProbe>,
    telemetry: Telemetry,
}

impl SmartExitWatcher {
    pub fn new(
        trades: TradeStore,
        quotes: Arc<dyn QuoteProvider>,
        exits: Arc<dyn ExitSender>,
        authority: Arc<dyn AuthorityProbe>,
        telemetry: Telemetry,
    ) -> Arc<Self> {
        Arc::new(Self { trades, quotes, exits, authority, telemetry })
    }

    /// Drain the executor's post-trade channel: bootstrap watchers and
    /// write TP/SL rules. Runs until the channel closes.
    pub fn spawn_worker(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<PostTradeTask>,
    ) -> JoinHandle<()> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                match task {
                    PostTradeTask::StartWatcher { trade_id } => {
                        watcher.watch(trade_id.clone());
                    }
                    PostTradeTask::CreateRule(rule) => {
                        if let Err(e) = watcher.trades.create_tp_sl_rule(&rule) {
                            warn!("tp/sl rule write failed: {e:#}");
                        }
                    }
                }
            }
        })
    }

    /// Start the watch loop for one position.
    pub fn watch(self: &Arc<Self>, trade_id: String) -> JoinHandle<()> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = watcher.run_position(&trade_id).await {
                warn!(trade_id = %trade_id, "watcher stopped with error: {e:#}");
            }
        })
    }

    async fn run_position(&self, trade_id: &str) -> Result<()> {
        let Some(trade) = self.trades.get_trade(trade_id)? else {
            return Ok(());
        };
        let buy_ts = trade.created_at;
        let initial_in = trade.in_amount;
        let mut authority_baseline: Option<Option<String>> = None;

        info!(trade_id, mint = %trade.mint, "👁 smart-exit watcher started");
        loop {
            // Fresh extras every tick so UI edits apply mid-flight.
            let Some(trade) = self.trades.get_trade(trade_id)? else {
                return Ok(());
            };
            if trade.closed_out_amount >= trade.out_amount {
                debug!(trade_id, "position closed elsewhere, watcher exiting");
                return Ok(());
            }
            let extras = trade.extras.clone().unwrap_or_default();
            let cfg = extras.watcher.clone();
            if cfg.mode == WatchMode::Off && !cfg.authority_flip_exit {
                return Ok(());
            }

            tokio::time::sleep(Duration::from_secs(cfg.interval_sec.max(1))).await;

            // 1. Authority flip against the baseline captured on first tick.
            if cfg.authority_flip_exit {
                match self.authority.freeze_authority(&trade.mint).await {
                    Ok(current) => match &authority_baseline {
                        None => authority_baseline = Some(current),
                        Some(baseline) if *baseline != current => {
                            self.fire_exit(&trade, &cfg, "authority-flip", extras.is_paper, None)
                                .await;
                            return Ok(());
                        }
                        Some(_) => {}
                    },
                    Err(e) => debug!("authority probe failed: {e:#}"),
                }
            }

            // 2. Liquidity: value the whole position with a sell quote.
            let remaining = trade.out_amount - trade.closed_out_amount;
            let sell_value = match self.sell_value(&trade, remaining).await {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!("sell re-quote failed: {e:#}");
                    None
                }
            };
            if let Some(now_out) = sell_value {
                let drop_pct = 100.0 - (now_out as f64 * 100.0 / initial_in.max(1) as f64);
                if cfg.lp_drop_exit_pct > 0.0 && drop_pct >= cfg.lp_drop_exit_pct {
                    self.fire_exit(&trade, &cfg, "lp-pull", extras.is_paper, Some(now_out)).await;
                    return Ok(());
                }

                // 3. Time, gated by minimum PnL when configured.
                if cfg.mode == WatchMode::Time {
                    let elapsed_sec = (now_ms() as i64 - buy_ts).max(0) as u64 / 1_000;
                    if elapsed_sec >= cfg.max_hold_sec {
                        let pnl_pct =
                            (now_out as f64 - initial_in as f64) * 100.0 / initial_in.max(1) as f64;
                        if cfg.min_pnl_before_time_exit_pct > 0.0
                            && pnl_pct < cfg.min_pnl_before_time_exit_pct
                        {
                            debug!(pnl_pct, "time exit gated on PnL, holding");
                        } else {
                            self.fire_exit(&trade, &cfg, "smart-time", extras.is_paper, Some(now_out))
                                .await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn sell_value(&self, trade: &Trade, amount: u64) -> Result<u64> {
        let request = QuoteRequest {
            input_mint: trade.output_mint.clone(),
            output_mint: trade.input_mint.clone(),
            amount,
            slippage_bps: trade.slippage_bps,
            mode: SwapMode::ExactIn,
        };
        Ok(self.quotes.fetch_quote(&request).await?.out_amount)
    }

    async fn fire_exit(
        &self,
        trade: &Trade,
        cfg: &WatcherConfig,
        reason: &str,
        is_paper: bool,
        observed_out: Option<u64>,
    ) {
        if cfg.rug_delay_blocks > 0 {
            tokio::time::sleep(Duration::from_millis(cfg.rug_delay_blocks * SLOT_TIME_MS)).await;
        }

        let remaining = trade.out_amount - trade.closed_out_amount;
        let tx_hash = if is_paper {
            Ok(format!("paper-exit-{}", &trade.id[..8.min(trade.id.len())]))
        } else {
            self.exits.execute_exit(trade, remaining).await.map_err(|e| format!("{e:#}"))
        };

        match tx_hash {
            Ok(tx_hash) => {
                // Exit price from the last sell quote; entry price when the
                // exit fired without one (authority flip on a dead quote).
                let exit_price = observed_out
                    .filter(|_| remaining > 0)
                    .map(|out| out as f64 / remaining as f64)
                    .or(trade.entry_price);
                let exit_price_usd = match (exit_price, trade.entry_price, trade.entry_price_usd) {
                    (Some(exit), Some(entry), Some(entry_usd)) if entry > 0.0 => {
                        Some(entry_usd * exit / entry)
                    }
                    _ => trade.entry_price_usd,
                };
                let fill = ExitFill {
                    exit_price,
                    exit_price_usd,
                    exit_tx_hash: Some(tx_hash.clone()),
                    reason: reason.to_string(),
                };
                if let Err(e) = self.trades.fifo_close(
                    &trade.user_id,
                    &trade.wallet_id,
                    &trade.mint,
                    &trade.strategy,
                    remaining,
                    &fill,
                ) {
                    warn!(trade_id = %trade.id, "fifo close failed after exit: {e:#}");
                }
                self.telemetry.exit_reason_total.with_label_values(&[reason]).inc();
                info!(trade_id = %trade.id, reason, %tx_hash, "🚪 smart exit fired");
            }
            Err(e) => {
                warn!(trade_id = %trade.id, reason, "exit send failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quote_provider::Quote;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct ScriptedQuotes {
        /// out_amount values handed back in order; last value repeats.
        outs: Mutex<VecDeque<u64>>,
    }

    impl ScriptedQuotes {
        fn new(outs: Vec<u64>) -> Arc<Self> {
            Arc::new(Self { outs: Mutex::new(outs.into()) })
        }
    }

    #[async_trait]
    impl QuoteProvider for ScriptedQuotes {
        async fn fetch_quote(&self, request: &QuoteRequest) -> Result<Quote> {
            let mut outs = self.outs.lock();
            let out = if outs.len() > 1 { outs.pop_front().unwrap() } else { *outs.front().unwrap() };
            Ok(Quote {
                input_mint: request.input_mint.clone(),
                output_mint: request.output_mint.clone(),
                in_amount: request.amount,
                out_amount: out,
                price_impact_pct: 0.1,
                slippage_bps: request.slippage_bps,
                mode: request.mode,
                raw: serde_json::json!({}),
                fetched_at_ms: now_ms(),
                latency_ms: 1,
            })
        }

        async fn build_swap_transaction(
            &self,
            _quote: &Quote,
            _opts: &crate::quote_provider::SwapBuildOptions,
        ) -> Result<Vec<u8>> {
            unreachable!("watcher tests never build transactions")
        }
    }

    struct RecordingExits {
        calls: Mutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl ExitSender for RecordingExits {
        async fn execute_exit(&self, trade: &Trade, amount: u64) -> Result<String> {
            self.calls.lock().push((trade.id.clone(), amount));
            Ok("exit-tx".to_string())
        }
    }

    struct StaticAuthority {
        values: Mutex<VecDeque<Option<String>>>,
    }

    #[async_trait]
    impl AuthorityProbe for StaticAuthority {
        async fn freeze_authority(&self, _mint: &str) -> Result<Option<String>> {
            let mut values = self.values.lock();
            Ok(if values.len() > 1 {
                values.pop_front().unwrap()
            } else {
                values.front().cloned().flatten()
            })
        }
    }

    fn open_trade(store: &TradeStore, cfg: WatcherConfig, created_at: i64) -> String {
        let trade = Trade {
            id: "pos-1".to_string(),
            user_id: "u1".to_string(),
            wallet_id: "w1".to_string(),
            wallet_label: None,
            mint: "MINT".to_string(),
            strategy: "turbo".to_string(),
            side: "buy".to_string(),
            in_amount: 1_000_000,
            out_amount: 500_000,
            closed_out_amount: 0,
            entry_price: Some(2.0),
            entry_price_usd: Some(0.0002),
            tx_hash: "buy-tx".to_string(),
            input_mint: "So11111111111111111111111111111111111111112".to_string(),
            output_mint: "MINT".to_string(),
            decimals: 9,
            slippage_bps: 50,
            mev_mode: None,
            priority_fee_lamports: 5_000,
            tip_lamports: 0,
            extras: Some(crate::trade_store::TradeExtras { watcher: cfg, is_paper: false }),
            created_at,
        };
        store.insert_trade(&trade).unwrap();
        trade.id
    }

    fn watcher_parts(
        outs: Vec<u64>,
        authority: Vec<Option<String>>,
    ) -> (TradeStore, Arc<ScriptedQuotes>, Arc<RecordingExits>, Arc<SmartExitWatcher>, Telemetry) {
        let trades = TradeStore::in_memory().unwrap();
        let quotes = ScriptedQuotes::new(outs);
        let exits = Arc::new(RecordingExits { calls: Mutex::new(Vec::new()) });
        let probe = Arc::new(StaticAuthority { values: Mutex::new(authority.into()) });
        let telemetry = Telemetry::new().unwrap();
        let watcher = SmartExitWatcher::new(
            trades.clone(),
            quotes.clone(),
            exits.clone(),
            probe,
            telemetry.clone(),
        );
        (trades, quotes, exits, watcher, telemetry)
    }

    fn time_cfg(max_hold_sec: u64, min_pnl: f64) -> WatcherConfig {
        WatcherConfig {
            mode: WatchMode::Time,
            max_hold_sec,
            min_pnl_before_time_exit_pct: min_pnl,
            lp_drop_exit_pct: 90.0,
            authority_flip_exit: false,
            interval_sec: 1,
            rug_delay_blocks: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn time_exit_waits_for_pnl_gate() {
        // First tick values the position at +5% (held), second at +12%.
        let (trades, _quotes, exits, watcher, telemetry) =
            watcher_parts(vec![1_050_000, 1_120_000], vec![]);
        let id = open_trade(&trades, time_cfg(60, 10.0), now_ms() as i64 - 61_000);

        let handle = watcher.watch(id.clone());
        handle.await.unwrap();

        assert_eq!(exits.calls.lock().len(), 1);
        assert_eq!(trades.closed_trade_reason(&id).unwrap(), Some("smart-time".to_string()));
        let trade = trades.get_trade(&id).unwrap().unwrap();
        assert_eq!(trade.closed_out_amount, trade.out_amount);
        assert!(telemetry
            .render()
            .unwrap()
            .contains("exit_reason_total{reason=\"smart-time\"} 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn lp_drop_fires_lp_pull() {
        // Position value collapses to 4% of entry on the first tick.
        let (trades, _quotes, exits, watcher, _telemetry) = watcher_parts(vec![40_000], vec![]);
        let cfg = WatcherConfig {
            mode: WatchMode::Liquidity,
            lp_drop_exit_pct: 50.0,
            authority_flip_exit: false,
            interval_sec: 1,
            ..WatcherConfig::default()
        };
        let id = open_trade(&trades, cfg, now_ms() as i64);

        watcher.watch(id.clone()).await.unwrap();
        assert_eq!(exits.calls.lock().len(), 1);
        assert_eq!(trades.closed_trade_reason(&id).unwrap(), Some("lp-pull".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn authority_change_fires_flip_exit() {
        // Baseline None on first tick, authority appears on the second.
        let (trades, _quotes, exits, watcher, _telemetry) = watcher_parts(
            vec![1_000_000],
            vec![None, Some("NewAuthority".to_string()), Some("NewAuthority".to_string())],
        );
        let cfg = WatcherConfig {
            mode: WatchMode::Liquidity,
            lp_drop_exit_pct: 99.0,
            authority_flip_exit: true,
            interval_sec: 1,
            ..WatcherConfig::default()
        };
        let id = open_trade(&trades, cfg, now_ms() as i64);

        watcher.watch(id.clone()).await.unwrap();
        assert_eq!(exits.calls.lock().len(), 1);
        assert_eq!(trades.closed_trade_reason(&id).unwrap(), Some("authority-flip".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_idles_out_when_mode_off() {
        let (trades, _quotes, exits, watcher, _telemetry) = watcher_parts(vec![1_000_000], vec![]);
        let cfg = WatcherConfig { mode: WatchMode::Off, authority_flip_exit: false, ..WatcherConfig::default() };
        let id = open_trade(&trades, cfg, now_ms() as i64);

        watcher.watch(id).await.unwrap();
        assert!(exits.calls.lock().is_empty());
    }
}
