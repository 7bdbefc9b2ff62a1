use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::transaction::VersionedTransaction;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{
    EngineConfig, LeaderTimingConfig, ProbeConfig, RetryPolicy, SizingConfig, WatcherConfig,
};
use crate::constants::LAMPORTS_PER_SOL;
use crate::envelope_crypto::{self, aad_for};
use crate::idempotency::{derive_id_key, BeginOutcome, IdempotencyStore};
use crate::leader_scheduler::{compute_hold_ms, LeaderSource};
use crate::liquidity_sizer::{self, SizingError};
use crate::parallel_filler::FillExecutor;
use crate::quote_cache::QuoteCache;
use crate::quote_provider::{Quote, QuoteProvider, QuoteRequest, SwapBuildOptions, SwapMode};
use crate::relay_client::RelayClient;
use crate::retry_matrix::{self, BumpDimension, RetryDecision};
use crate::risk_filter::{self, DevWatchConfig, RiskProvider};
use crate::rpc_quorum::{QuorumOverrides, RpcPool};
use crate::session_cache::{now_ms, SessionCache, SessionKey};
use crate::telemetry::Telemetry;
use crate::trade_error::{classify_send_error, SendErrorKind, TradeError};
use crate::trade_store::{NewTpSlRule, Trade, TradeExtras, TradeStore};
use crate::wallet_store::{WalletRow, WalletStore};

/// Priority-fee increment applied by a compute-unit bump.
const CU_BUMP_LAMPORTS: u64 = 25_000;
/// Tip increment applied when the relay tip curve is unavailable.
const TIP_BUMP_LAMPORTS: u64 = 50_000;

#[derive(Debug, Clone)]
pub struct UserCtx {
    pub user_id: String,
    pub wallet_id: String,
}

#[derive(Debug, Clone)]
pub struct TradeParams {
    pub input_mint: String,
    pub output_mint: String,
    pub amount: u64,
    pub slippage_bps: u16,
    pub strategy: String,
    pub wallet_label: Option<String>,
    pub mev_mode: Option<String>,
    pub priority_fee_lamports: u64,
    pub tip_lamports: u64,
    pub decimals: u8,
    /// Known pool reserve of the input side, when the feed provides it.
    pub pool_reserve: Option<u64>,
    /// USD value of one base unit of the input; falls back to the engine's
    /// SOL price when absent.
    pub unit_price_usd: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TradeConfig {
    #[serde(default)]
    pub sizing: SizingConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub leader_timing: LeaderTimingConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub dev_watch: Option<DevWatchConfig>,
    #[serde(default)]
    pub use_jito_bundle: bool,
    #[serde(default)]
    pub direct_amm_fallback: bool,
    #[serde(default)]
    pub quote_latency_threshold_ms: u64,
    /// Per-trade overrides for the quorum fan-out.
    #[serde(default)]
    pub quorum: Option<QuorumOverrides>,
    #[serde(default)]
    pub watcher: Option<WatcherConfig>,
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub paper: bool,
}

/// Result of one trade attempt: either a signature or a structured block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Sent { tx_hash: String },
    Blocked { reason: String, detail: String },
}

/// Work queued for the background worker after a successful send. Nothing
/// here may delay returning the signature to the caller.
#[derive(Debug)]
pub enum PostTradeTask {
    StartWatcher { trade_id: String },
    CreateRule(NewTpSlRule),
}

/// Everything the executor composes. Assembled once at startup.
pub struct ExecutorParts {
    pub sessions: Arc<SessionCache>,
    pub idempotency: Arc<IdempotencyStore>,
    pub quote_cache: QuoteCache,
    pub quotes: Arc<dyn QuoteProvider>,
    pub pool: Arc<RpcPool>,
    pub relay: Option<Arc<RelayClient>>,
    pub trades: TradeStore,
    pub wallets: WalletStore,
    pub risk: Option<Arc<dyn RiskProvider>>,
    pub leader_source: Option<Arc<dyn LeaderSource>>,
    pub telemetry: Telemetry,
    pub cfg: EngineConfig,
    pub post_trade_tx: mpsc::UnboundedSender<PostTradeTask>,
}

pub struct TurboExecutor {
    sessions: Arc<SessionCache>,
    idempotency: Arc<IdempotencyStore>,
    quote_cache: QuoteCache,
    quotes: Arc<dyn QuoteProvider>,
    pool: Arc<RpcPool>,
    relay: Option<Arc<RelayClient>>,
    trades: TradeStore,
    wallets: WalletStore,
    risk: Option<Arc<dyn RiskProvider>>,
    leader_source: Option<Arc<dyn LeaderSource>>,
    telemetry: Telemetry,
    cfg: EngineConfig,
    kill_switch: AtomicBool,
    post_trade_tx: mpsc::UnboundedSender<PostTradeTask>,
}

struct AttemptState {
    cu_bumps: u32,
    tip_bumps: u32,
    use_bundle: bool,
    route_toggled: bool,
}

impl TurboExecutor {
    pub fn new(parts: ExecutorParts) -> Arc<Self> {
        let kill_switch = AtomicBool::new(parts.cfg.kill_switch);
        Arc::new(Self {
            sessions: parts.sessions,
            idempotency: parts.idempotency,
            quote_cache: parts.quote_cache,
            quotes: parts.quotes,
            pool: parts.pool,
            relay: parts.relay,
            trades: parts.trades,
            wallets: parts.wallets,
            risk: parts.risk,
            leader_source: parts.leader_source,
            telemetry: parts.telemetry,
            cfg: parts.cfg,
            kill_switch,
            post_trade_tx: parts.post_trade_tx,
        })
    }

    pub fn set_kill_switch(&self, engaged: bool) {
        self.kill_switch.store(engaged, Ordering::SeqCst);
        if engaged {
            warn!("🛑 kill switch engaged: rejecting all new sends");
        }
    }

    pub fn trade_store(&self) -> &TradeStore {
        &self.trades
    }

    /// Execute one trade end to end. Observable ordering: idempotency gate,
    /// risk gate, sizing, leader hold, send, persist; post-trade side
    /// effects drain on the background channel.
    pub async fn execute_trade(
        &self,
        user: &UserCtx,
        params: &TradeParams,
        cfg: &TradeConfig,
    ) -> Result<ExecOutcome, TradeError> {
        let id_key = derive_id_key(
            &user.user_id,
            &user.wallet_id,
            &params.output_mint,
            params.amount,
            now_ms(),
            &self.cfg.idempotency,
        );
        self.execute_trade_with_key(user, params, cfg, &id_key).await
    }

    /// Same as `execute_trade` with an externally supplied idempotency key
    /// (the parallel filler suffixes one key per wallet).
    pub async fn execute_trade_with_key(
        &self,
        user: &UserCtx,
        params: &TradeParams,
        cfg: &TradeConfig,
        id_key: &str,
    ) -> Result<ExecOutcome, TradeError> {
        if self.kill_switch.load(Ordering::SeqCst) {
            return Err(TradeError::KillSwitch);
        }
        if user.user_id.is_empty() || user.wallet_id.is_empty() {
            return Err(TradeError::Validation("userId and walletId are required".into()));
        }
        if params.amount == 0 {
            return Err(TradeError::Validation("amount must be positive".into()));
        }
        if params.input_mint.is_empty() || params.output_mint.is_empty() {
            return Err(TradeError::Validation("input and output mints are required".into()));
        }

        let wallet = self
            .wallets
            .get_wallet(&user.user_id, &user.wallet_id)
            .map_err(|e| TradeError::Persistence(format!("{e:#}")))?
            .ok_or_else(|| TradeError::Validation(format!("wallet {} not found", user.wallet_id)))?;

        // Arm check before any slow work: protected wallets (and users who
        // opted into require-arm) trade only with a live session.
        let key = SessionKey::new(&user.user_id, &user.wallet_id);
        let armed = self.sessions.status(&key).armed;
        let requires_arm = wallet.is_protected
            || wallet.envelope.as_ref().map(|e| e.is_protected()).unwrap_or(false)
            || self.wallets.require_arm(&user.user_id).unwrap_or(false);
        if requires_arm && !armed {
            return Err(TradeError::NotArmed(format!("wallet {} has no live session", user.wallet_id)));
        }

        // Pre-quote risk gate.
        if let (Some(provider), Some(watch_cfg)) = (&self.risk, &cfg.dev_watch) {
            match provider.inspect_mint(&params.output_mint).await {
                Ok(report) => {
                    if let Some((reason, detail)) = risk_filter::evaluate(&report, watch_cfg) {
                        self.telemetry.risk_blocked_total.with_label_values(&[reason.as_str()]).inc();
                        info!(mint = %params.output_mint, reason = %reason, "trade blocked pre-quote");
                        return Ok(ExecOutcome::Blocked { reason, detail });
                    }
                }
                Err(e) => warn!(mint = %params.output_mint, "risk provider unavailable: {e:#}"),
            }
        }

        match self.idempotency.begin(id_key) {
            BeginOutcome::Fresh => {}
            BeginOutcome::Pending => return Err(TradeError::Duplicate { tx_hash: None }),
            BeginOutcome::Done(tx_hash) => return Ok(ExecOutcome::Sent { tx_hash }),
        }

        let result = self.run_gated_trade(user, params, cfg, id_key, &wallet).await;
        match &result {
            Ok(ExecOutcome::Sent { tx_hash }) => self.idempotency.mark_success(id_key, tx_hash),
            _ => self.idempotency.release(id_key),
        }
        result
    }

    async fn run_gated_trade(
        &self,
        user: &UserCtx,
        params: &TradeParams,
        cfg: &TradeConfig,
        id_key: &str,
        wallet: &WalletRow,
    ) -> Result<ExecOutcome, TradeError> {
        // Recent identical buy: reuse its signature, send nothing.
        if let Ok(Some(tx_hash)) =
            self.trades.recent_duplicate(&user.user_id, &user.wallet_id, &params.output_mint, &params.strategy)
        {
            debug!(%tx_hash, "recent duplicate trade, reusing result");
            return Ok(ExecOutcome::Sent { tx_hash });
        }

        // Quote freshness gate: a cache miss forces a provider call.
        let request = QuoteRequest {
            input_mint: params.input_mint.clone(),
            output_mint: params.output_mint.clone(),
            amount: params.amount,
            slippage_bps: params.slippage_bps,
            mode: SwapMode::ExactIn,
        };
        let quote = match self.quote_cache.get(&request) {
            Some(quote) => quote,
            None => {
                let quote = self
                    .quotes
                    .fetch_quote(&request)
                    .await
                    .map_err(|e| self.send_error(format!("{e:#}")))?;
                self.quote_cache.insert(request.clone(), quote.clone());
                quote
            }
        };

        // Liquidity sizing against the quoted impact curve.
        let unit_price_usd = params
            .unit_price_usd
            .unwrap_or(self.cfg.sol_price_usd / LAMPORTS_PER_SOL as f64);
        let impact_at = |amount: u64| {
            if quote.in_amount == 0 {
                return 0.0;
            }
            quote.price_impact_pct * amount as f64 / quote.in_amount as f64
        };
        let sized = match liquidity_sizer::size_for_liquidity(
            params.amount,
            params.pool_reserve,
            unit_price_usd,
            &cfg.sizing,
            impact_at,
        ) {
            Ok(sized) => sized,
            Err(SizingError::BelowMinUsd { usd, min }) => {
                return Ok(ExecOutcome::Blocked {
                    reason: "below-min-usd".into(),
                    detail: format!("sized notional {usd:.4} USD under {min:.4} USD floor"),
                });
            }
        };
        self.telemetry.sizing_reduced_pct.observe(sized.reduced_pct);
        self.telemetry.price_impact_pct.observe(sized.est_impact_pct);

        // Re-quote when sizing moved the amount.
        let quote = if sized.amount != quote.in_amount {
            self.fresh_quote(params, sized.amount).await?
        } else {
            quote
        };
        if quote.price_impact_pct > cfg.sizing.max_impact_pct {
            return Ok(ExecOutcome::Blocked {
                reason: "impact-abort".into(),
                detail: format!(
                    "quoted impact {:.2}% over {:.2}% ceiling",
                    quote.price_impact_pct, cfg.sizing.max_impact_pct
                ),
            });
        }

        // Leader-time hold, cooperative.
        if cfg.leader_timing.enabled {
            if let Some(source) = &self.leader_source {
                if let Ok(schedule) = source.schedule().await {
                    let hold_ms = compute_hold_ms(&schedule, &cfg.leader_timing);
                    self.telemetry.leader_hold_ms.observe(hold_ms as f64);
                    if hold_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                    }
                }
            }
        }

        // Blockhash prewarm across the pool.
        if !cfg.paper {
            self.pool
                .refresh_if_expired()
                .await
                .map_err(|e| self.send_error(format!("{e:#}")))?;
        }

        if cfg.paper {
            let tx_hash = format!("paper-{}", &id_key[..16.min(id_key.len())]);
            self.persist_and_dispatch(user, params, cfg, &quote, sized.amount, &tx_hash, true);
            return Ok(ExecOutcome::Sent { tx_hash });
        }

        let keypair = self.load_keypair(user, wallet)?;

        // Probe-then-scale takes precedence over every other path.
        if let Some(plan) = liquidity_sizer::probe_plan(sized.amount, &cfg.probe) {
            let probe_quote = self.fresh_quote(params, plan.probe_amount).await?;
            let (probe_tx, probe_quote) =
                self.send_with_retries(&keypair, params, cfg, probe_quote).await?;

            // Live impact check on the remaining size before scaling in.
            let live = self.fresh_quote(params, plan.scale_amount).await?;
            if live.price_impact_pct > cfg.probe.abort_on_impact_pct {
                self.telemetry.probe_abort_total.inc();
                warn!(
                    impact = live.price_impact_pct,
                    "probe aborted: live impact above ceiling, keeping probe position"
                );
                self.persist_and_dispatch(
                    user,
                    params,
                    cfg,
                    &probe_quote,
                    plan.probe_amount,
                    &probe_tx,
                    false,
                );
                return Ok(ExecOutcome::Sent { tx_hash: probe_tx });
            }

            tokio::time::sleep(Duration::from_millis(cfg.probe.delay_ms)).await;
            let (scale_tx, scale_quote) = self.send_with_retries(&keypair, params, cfg, live).await?;
            self.telemetry.probe_scale_success_total.inc();

            let mut combined = scale_quote.clone();
            combined.in_amount += probe_quote.in_amount;
            combined.out_amount += probe_quote.out_amount;
            self.persist_and_dispatch(user, params, cfg, &combined, sized.amount, &scale_tx, false);
            return Ok(ExecOutcome::Sent { tx_hash: scale_tx });
        }

        let (tx_hash, used_quote) = self.send_with_retries(&keypair, params, cfg, quote).await?;
        self.persist_and_dispatch(user, params, cfg, &used_quote, sized.amount, &tx_hash, false);
        Ok(ExecOutcome::Sent { tx_hash })
    }

    /// Retry loop around one signed send, walking the bump matrix.
    async fn send_with_retries(
        &self,
        keypair: &Keypair,
        params: &TradeParams,
        cfg: &TradeConfig,
        mut quote: Quote,
    ) -> Result<(String, Quote), TradeError> {
        let mut state = AttemptState {
            cu_bumps: 0,
            tip_bumps: 0,
            use_bundle: cfg.use_jito_bundle,
            route_toggled: false,
        };
        let max_attempts = cfg.retry.max_attempts.max(1);
        let mut failures = 0u32;

        loop {
            match self.send_once(keypair, params, cfg, &quote, &state).await {
                Ok(tx_hash) => return Ok((tx_hash, quote)),
                Err(message) => {
                    failures += 1;
                    let kind = classify_send_error(&message);
                    match kind {
                        SendErrorKind::User => self.telemetry.send_user_error_total.inc(),
                        SendErrorKind::Net => self.telemetry.send_net_error_total.inc(),
                        SendErrorKind::Unknown => self.telemetry.send_unknown_error_total.inc(),
                    }

                    let decision = retry_matrix::decide(
                        kind,
                        failures,
                        self.relay.is_some() && !state.route_toggled,
                        self.pool.endpoint_count() > 1,
                    );
                    let bump = match decision {
                        RetryDecision::Surface => {
                            return Err(TradeError::Send { kind, message });
                        }
                        _ if failures >= max_attempts => {
                            return Err(TradeError::Send { kind, message });
                        }
                        RetryDecision::Retry(bump) => bump,
                    };

                    match bump {
                        BumpDimension::ComputeUnits => state.cu_bumps += 1,
                        BumpDimension::Tip => state.tip_bumps += 1,
                        BumpDimension::RouteToggle => {
                            state.use_bundle = !state.use_bundle;
                            state.route_toggled = true;
                        }
                        BumpDimension::RotateRpc => self.pool.rotate(),
                    }
                    self.telemetry.send_retry_total.inc();
                    debug!(attempt = failures, ?bump, "send retry after {message}");

                    tokio::time::sleep(retry_matrix::backoff_delay(&cfg.retry, failures)).await;

                    // Fresh quote and blockhashes before every retry.
                    quote = self.fresh_quote(params, quote.in_amount).await?;
                    if let Err(e) = self.pool.refresh_if_expired().await {
                        warn!("blockhash refresh before retry failed: {e:#}");
                    }
                }
            }
        }
    }

    /// One build-sign-submit round over the currently selected path.
    async fn send_once(
        &self,
        keypair: &Keypair,
        params: &TradeParams,
        cfg: &TradeConfig,
        quote: &Quote,
        state: &AttemptState,
    ) -> Result<String, String> {
        let use_direct = !state.use_bundle
            && cfg.direct_amm_fallback
            && quote.latency_ms > cfg.quote_latency_threshold_ms;

        let tip_lamports = if state.use_bundle {
            match &self.relay {
                Some(relay) => relay.tip_for_level(state.tip_bumps).await.max(params.tip_lamports),
                None => params.tip_lamports + state.tip_bumps as u64 * TIP_BUMP_LAMPORTS,
            }
        } else {
            params.tip_lamports + state.tip_bumps as u64 * TIP_BUMP_LAMPORTS
        };

        let opts = SwapBuildOptions {
            user_pubkey: keypair.pubkey().to_string(),
            priority_fee_lamports: params.priority_fee_lamports
                + state.cu_bumps as u64 * CU_BUMP_LAMPORTS,
            tip_lamports,
            compute_unit_limit: None,
            direct_route_only: use_direct,
        };

        let raw = self
            .quotes
            .build_swap_transaction(quote, &opts)
            .await
            .map_err(|e| format!("{e:#}"))?;
        let (signed, signature) = sign_transaction(&raw, keypair)?;

        if state.use_bundle {
            if let Some(relay) = &self.relay {
                let ack = relay.send_bundle(vec![signed]);
                let confirmed = Arc::new(AtomicBool::new(false));
                relay.consume_ack(ack, confirmed);
                return Ok(signature);
            }
        }
        self.pool
            .send_raw_transaction_quorum_with(&signed, cfg.quorum.as_ref())
            .await
            .map_err(|e| format!("{e:#}"))
    }

    /// Sell-side send used by the Smart-Exit watcher: the same key-material,
    /// quote, and retry machinery, without buy-side persistence (the caller
    /// owns the FIFO close).
    pub async fn execute_sell(
        &self,
        user: &UserCtx,
        params: &TradeParams,
        cfg: &TradeConfig,
    ) -> Result<String, TradeError> {
        if self.kill_switch.load(Ordering::SeqCst) {
            return Err(TradeError::KillSwitch);
        }
        let wallet = self
            .wallets
            .get_wallet(&user.user_id, &user.wallet_id)
            .map_err(|e| TradeError::Persistence(format!("{e:#}")))?
            .ok_or_else(|| TradeError::Validation(format!("wallet {} not found", user.wallet_id)))?;
        let keypair = self.load_keypair(user, &wallet)?;

        if let Err(e) = self.pool.refresh_if_expired().await {
            warn!("blockhash refresh before sell failed: {e:#}");
        }
        let quote = self.fresh_quote(params, params.amount).await?;
        let (tx_hash, _) = self.send_with_retries(&keypair, params, cfg, quote).await?;
        Ok(tx_hash)
    }

    async fn fresh_quote(&self, params: &TradeParams, amount: u64) -> Result<Quote, TradeError> {
        let request = QuoteRequest {
            input_mint: params.input_mint.clone(),
            output_mint: params.output_mint.clone(),
            amount,
            slippage_bps: params.slippage_bps,
            mode: SwapMode::ExactIn,
        };
        let quote = self
            .quotes
            .fetch_quote(&request)
            .await
            .map_err(|e| self.send_error(format!("{e:#}")))?;
        self.quote_cache.insert(request, quote.clone());
        Ok(quote)
    }

    fn send_error(&self, message: String) -> TradeError {
        TradeError::Send { kind: classify_send_error(&message), message }
    }

    fn load_keypair(&self, user: &UserCtx, wallet: &WalletRow) -> Result<Keypair, TradeError> {
        let aad = aad_for(&user.user_id, &user.wallet_id);
        let secret = if let Some(envelope) = wallet.envelope.as_ref() {
            if envelope.is_protected() {
                let key = SessionKey::new(&user.user_id, &user.wallet_id);
                let unwrapped = self.sessions.with_dek(&key, |dek| {
                    envelope_crypto::decrypt_secret_with_dek(envelope, dek, &aad)
                });
                match unwrapped {
                    Some(Ok(secret)) => secret,
                    Some(Err(e)) => return Err(TradeError::Crypto(e.to_string())),
                    None => {
                        return Err(TradeError::NotArmed(format!(
                            "wallet {} has no live session",
                            user.wallet_id
                        )))
                    }
                }
            } else {
                envelope_crypto::decrypt_unprotected(
                    envelope,
                    &user.user_id,
                    &self.cfg.encryption_secret,
                    &aad,
                )
                .map_err(|e| TradeError::Crypto(e.to_string()))?
            }
        } else if let Some(blob) = wallet.legacy_private_key.as_ref() {
            envelope_crypto::decrypt_legacy(blob, &self.cfg.encryption_secret)
                .map_err(|e| TradeError::Crypto(e.to_string()))?
        } else {
            return Err(TradeError::Validation(format!(
                "wallet {} has no key material",
                user.wallet_id
            )));
        };

        Keypair::from_bytes(&secret).map_err(|e| TradeError::Crypto(e.to_string()))
    }

    /// Write the trade row and queue post-trade work. A write failure is
    /// logged and swallowed: the send already happened on chain and the
    /// caller still gets the signature.
    fn persist_and_dispatch(
        &self,
        user: &UserCtx,
        params: &TradeParams,
        cfg: &TradeConfig,
        quote: &Quote,
        in_amount: u64,
        tx_hash: &str,
        is_paper: bool,
    ) {
        let entry_price = if quote.out_amount > 0 {
            Some(quote.in_amount as f64 / quote.out_amount as f64)
        } else {
            None
        };
        let unit_price_usd = params
            .unit_price_usd
            .unwrap_or(self.cfg.sol_price_usd / LAMPORTS_PER_SOL as f64);

        let trade = Trade {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user.user_id.clone(),
            wallet_id: user.wallet_id.clone(),
            wallet_label: params.wallet_label.clone(),
            mint: params.output_mint.clone(),
            strategy: params.strategy.clone(),
            side: "buy".to_string(),
            in_amount,
            out_amount: quote.out_amount,
            closed_out_amount: 0,
            entry_price,
            entry_price_usd: entry_price.map(|p| p * unit_price_usd),
            tx_hash: tx_hash.to_string(),
            input_mint: params.input_mint.clone(),
            output_mint: params.output_mint.clone(),
            decimals: params.decimals,
            slippage_bps: params.slippage_bps,
            mev_mode: params.mev_mode.clone(),
            priority_fee_lamports: params.priority_fee_lamports,
            tip_lamports: params.tip_lamports,
            extras: cfg
                .watcher
                .clone()
                .map(|watcher| TradeExtras { watcher, is_paper }),
            created_at: now_ms() as i64,
        };

        if let Err(e) = self.trades.insert_trade(&trade) {
            warn!(%tx_hash, "trade row write failed after send: {e:#}");
            return;
        }

        if cfg.watcher.is_some() {
            let _ = self
                .post_trade_tx
                .send(PostTradeTask::StartWatcher { trade_id: trade.id.clone() });
        }
        if cfg.take_profit_pct.is_some() || cfg.stop_loss_pct.is_some() {
            let _ = self.post_trade_tx.send(PostTradeTask::CreateRule(NewTpSlRule {
                user_id: user.user_id.clone(),
                wallet_id: user.wallet_id.clone(),
                mint: params.output_mint.clone(),
                strategy: params.strategy.clone(),
                tp: None,
                sl: None,
                tp_percent: cfg.take_profit_pct,
                sl_percent: cfg.stop_loss_pct,
                entry_price,
            }));
        }
    }
}

fn sign_transaction(raw: &[u8], keypair: &Keypair) -> Result<(Vec<u8>, String), String> {
    let tx: VersionedTransaction =
        bincode::deserialize(raw).map_err(|e| format!("transaction decode: {e}"))?;
    let signed = VersionedTransaction::try_new(tx.message, &[keypair])
        .map_err(|e| format!("transaction sign: {e}"))?;
    let signature = signed
        .signatures
        .first()
        .map(|s| s.to_string())
        .ok_or_else(|| "signed transaction has no signature".to_string())?;
    let raw_signed = bincode::serialize(&signed).map_err(|e| format!("transaction encode: {e}"))?;
    Ok((raw_signed, signature))
}

/// Binds the executor to one user and trade shape so the parallel filler
/// can race the same intent across wallets.
pub struct WalletFillAdapter {
    pub executor: Arc<TurboExecutor>,
    pub user_id: String,
    pub params: TradeParams,
    pub cfg: TradeConfig,
}

#[async_trait]
impl FillExecutor for WalletFillAdapter {
    async fn fill(&self, wallet_id: &str, amount: u64, id_key: &str) -> anyhow::Result<String> {
        let user = UserCtx { user_id: self.user_id.clone(), wallet_id: wallet_id.to_string() };
        let mut params = self.params.clone();
        params.amount = amount;
        match self
            .executor
            .execute_trade_with_key(&user, &params, &self.cfg, id_key)
            .await
        {
            Ok(ExecOutcome::Sent { tx_hash }) => Ok(tx_hash),
            Ok(ExecOutcome::Blocked { reason, detail }) => {
                anyhow::bail!("blocked: {reason} ({detail})")
            }
            Err(e) => Err(anyhow::anyhow!(e.to_string())),
        }
    }
}
