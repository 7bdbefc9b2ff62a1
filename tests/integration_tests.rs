//! End-to-end tests for the turbo engine.
//!
//! These run hermetically: the quote provider, RPC endpoints, and clock are
//! all local, so `cargo test --test integration_tests` needs no network.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use solana_sdk::message::{Message, VersionedMessage};
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::system_instruction;
use solana_sdk::transaction::VersionedTransaction;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use turbo_trade_engine::arm_service::ArmRequest;
use turbo_trade_engine::envelope_crypto::{self, aad_for};
use turbo_trade_engine::quote_provider::SwapBuildOptions;
use turbo_trade_engine::{
    fill_batch, ArmService, AutoReturnScheduler, EngineConfig, EnvelopeConfig, ExecOutcome,
    ExecutorParts, FillRequest, IdempotencyStore, PostTradeTask, Quote, QuoteCache, QuoteProvider,
    QuoteRequest, QuorumConfig, RpcPool, SessionCache, SessionConfig, SmartExitWatcher, SweepExecutor,
    SweepPlan, SweepReport, Telemetry, TradeConfig, TradeParams, TradeStore, TurboExecutor, TxEndpoint,
    UserCtx, WalletFillAdapter, WalletStore, WatchMode, WatcherConfig,
};

const SOL_MINT: &str = "So11111111111111111111111111111111111111112";
const MEME_MINT: &str = "MintMeme1111111111111111111111111111111111";
const SERVER_SECRET: &str = "integration-server-secret";

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Mock externals
// ---------------------------------------------------------------------------

struct MockQuotes {
    calls: AtomicU64,
}

impl MockQuotes {
    fn new() -> Arc<Self> {
        Arc::new(Self { calls: AtomicU64::new(0) })
    }
}

#[async_trait]
impl QuoteProvider for MockQuotes {
    async fn fetch_quote(&self, request: &QuoteRequest) -> Result<Quote> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Quote {
            input_mint: request.input_mint.clone(),
            output_mint: request.output_mint.clone(),
            in_amount: request.amount,
            out_amount: request.amount * 2,
            price_impact_pct: 0.5,
            slippage_bps: request.slippage_bps,
            mode: request.mode,
            raw: serde_json::json!({"mock": true}),
            fetched_at_ms: now_ms(),
            latency_ms: 1,
        })
    }

    async fn build_swap_transaction(&self, _quote: &Quote, opts: &SwapBuildOptions) -> Result<Vec<u8>> {
        // Unsigned one-signer transfer the executor signs with the real key.
        let user: solana_sdk::pubkey::Pubkey = opts.user_pubkey.parse()?;
        let message = Message::new(&[system_instruction::transfer(&user, &user, 1)], Some(&user));
        let tx = VersionedTransaction {
            signatures: vec![solana_sdk::signature::Signature::default()],
            message: VersionedMessage::Legacy(message),
        };
        Ok(bincode::serialize(&tx)?)
    }
}

/// RPC endpoint that replays a scripted failure sequence, then succeeds by
/// echoing the transaction's own signature.
struct ScriptedEndpoint {
    url: String,
    failures: Mutex<VecDeque<String>>,
    sends: AtomicU64,
}

impl ScriptedEndpoint {
    fn new(url: &str, failures: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            failures: Mutex::new(failures.into_iter().map(String::from).collect()),
            sends: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl TxEndpoint for ScriptedEndpoint {
    fn url(&self) -> &str {
        &self.url
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(anyhow!(error));
        }
        let tx: VersionedTransaction = bincode::deserialize(raw)?;
        Ok(tx.signatures[0].to_string())
    }

    async fn fetch_latest_blockhash(&self) -> Result<String> {
        Ok("GfVcyD4kkTrj4bKc7WA9sZCin9JDbdT4Zkd3EittNR1W".to_string())
    }
}

struct NoopSweeper;

#[async_trait]
impl SweepExecutor for NoopSweeper {
    async fn sweep(&self, _u: &str, _w: &str, _p: &SweepPlan) -> Result<SweepReport> {
        Ok(SweepReport::default())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    executor: Arc<TurboExecutor>,
    arm: Arc<ArmService>,
    sessions: Arc<SessionCache>,
    wallets: WalletStore,
    trades: TradeStore,
    quotes: Arc<MockQuotes>,
    endpoint: Arc<ScriptedEndpoint>,
    telemetry: Telemetry,
    post_trade_rx: Option<mpsc::UnboundedReceiver<PostTradeTask>>,
    _tmp: tempfile::TempDir,
}

fn engine_config(tmp: &tempfile::TempDir) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.encryption_secret = SERVER_SECRET.to_string();
    cfg.sol_price_usd = 160.0;
    cfg.envelope = EnvelopeConfig { argon2_memory_kib: 8, argon2_iterations: 1, argon2_parallelism: 1 };
    cfg.idempotency.salt = "it-salt".to_string();
    cfg.idempotency.resume_path =
        tmp.path().join("resume.json").to_string_lossy().into_owned();
    cfg
}

fn harness_with_failures(failures: Vec<&str>) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = engine_config(&tmp);
    let telemetry = Telemetry::new().unwrap();

    let sessions = Arc::new(SessionCache::new(SessionConfig::default()));
    let idempotency = Arc::new(IdempotencyStore::new(cfg.idempotency.clone()));
    let trades = TradeStore::in_memory().unwrap();
    let wallets = WalletStore::in_memory().unwrap();
    let quotes = MockQuotes::new();
    let endpoint = ScriptedEndpoint::new("mock-rpc", failures);

    let pool = Arc::new(RpcPool::new(
        vec![endpoint.clone()],
        QuorumConfig {
            endpoints: vec![],
            quorum: 1,
            max_fanout: 1,
            stagger_ms: 0,
            timeout_ms: 2_000,
            blockhash_ttl_ms: 20_000,
        },
        telemetry.clone(),
    ));

    let (post_trade_tx, post_trade_rx) = mpsc::unbounded_channel();
    let executor = TurboExecutor::new(ExecutorParts {
        sessions: Arc::clone(&sessions),
        idempotency,
        quote_cache: QuoteCache::new(cfg.quote_cache.clone()),
        quotes: quotes.clone(),
        pool,
        relay: None,
        trades: trades.clone(),
        wallets: wallets.clone(),
        risk: None,
        leader_source: None,
        telemetry: telemetry.clone(),
        cfg: cfg.clone(),
        post_trade_tx,
    });

    let auto_return = AutoReturnScheduler::new(wallets.clone(), Arc::new(NoopSweeper));
    let arm = ArmService::new(
        wallets.clone(),
        Arc::clone(&sessions),
        auto_return,
        trades.clone(),
        cfg.envelope.clone(),
        SERVER_SECRET.to_string(),
    );

    Harness {
        executor,
        arm,
        sessions,
        wallets,
        trades,
        quotes,
        endpoint,
        telemetry,
        post_trade_rx: Some(post_trade_rx),
        _tmp: tmp,
    }
}

fn harness() -> Harness {
    harness_with_failures(vec![])
}

/// Seed a wallet already carrying a modern protected envelope.
fn seed_protected_wallet(h: &Harness, user: &str, wallet: &str, passphrase: &str) -> Keypair {
    let keypair = Keypair::new();
    let aad = aad_for(user, wallet);
    let envelope_cfg =
        EnvelopeConfig { argon2_memory_kib: 8, argon2_iterations: 1, argon2_parallelism: 1 };
    let (envelope, _dek) =
        envelope_crypto::encrypt_secret(&keypair.to_bytes(), passphrase, &aad, &envelope_cfg).unwrap();
    let hash = envelope_crypto::hash_passphrase(passphrase).unwrap();

    h.wallets
        .insert_wallet(&turbo_trade_engine::WalletRow {
            id: wallet.to_string(),
            user_id: user.to_string(),
            label: Some("main".to_string()),
            pubkey: keypair.pubkey().to_string(),
            is_protected: true,
            envelope: Some(envelope),
            legacy_private_key: None,
            passphrase_hash: Some(hash),
            passphrase_hint: None,
        })
        .unwrap();
    keypair
}

/// Seed an unprotected wallet the engine can sign for without a session.
fn seed_unprotected_wallet(h: &Harness, user: &str, wallet: &str) -> Keypair {
    let keypair = Keypair::new();
    let aad = aad_for(user, wallet);
    let envelope =
        envelope_crypto::encrypt_unprotected(&keypair.to_bytes(), user, SERVER_SECRET, &aad).unwrap();
    h.wallets
        .insert_wallet(&turbo_trade_engine::WalletRow {
            id: wallet.to_string(),
            user_id: user.to_string(),
            label: None,
            pubkey: keypair.pubkey().to_string(),
            is_protected: false,
            envelope: Some(envelope),
            legacy_private_key: None,
            passphrase_hash: None,
            passphrase_hint: None,
        })
        .unwrap();
    keypair
}

fn buy_params(amount: u64) -> TradeParams {
    TradeParams {
        input_mint: SOL_MINT.to_string(),
        output_mint: MEME_MINT.to_string(),
        amount,
        slippage_bps: 50,
        strategy: "turbo".to_string(),
        wallet_label: Some("main".to_string()),
        mev_mode: None,
        priority_fee_lamports: 5_000,
        tip_lamports: 0,
        decimals: 9,
        pool_reserve: None,
        unit_price_usd: None,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn arm_then_trade_happy_path() {
    let h = harness();
    seed_protected_wallet(&h, "U", "W1", "secret");

    let outcome = h
        .arm
        .arm(
            "U",
            &ArmRequest {
                wallet_id: "W1".to_string(),
                passphrase: "secret".to_string(),
                ttl_minutes: 240,
                ..ArmRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.armed_for_minutes, 240);
    assert!(!outcome.migrated);

    let user = UserCtx { user_id: "U".to_string(), wallet_id: "W1".to_string() };
    let result = h
        .executor
        .execute_trade(&user, &buy_params(1_000_000_000), &TradeConfig::default())
        .await
        .unwrap();

    let ExecOutcome::Sent { tx_hash } = result else { panic!("expected a sent trade") };
    assert!(!tx_hash.is_empty());
    assert!(bs58::decode(&tx_hash).into_vec().is_ok());

    let open = h.trades.open_trades("U", Some("W1"), None).unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].side, "buy");
    assert_eq!(open[0].tx_hash, tx_hash);

    let status = h.arm.status("U", "W1", false).unwrap();
    assert!(status.armed);
    assert!(status.ms_left > 239 * 60_000 && status.ms_left <= 240 * 60_000);
}

#[tokio::test]
async fn protected_wallet_without_session_is_not_armed() {
    let h = harness();
    seed_protected_wallet(&h, "U", "W1", "secret");

    let user = UserCtx { user_id: "U".to_string(), wallet_id: "W1".to_string() };
    let err = h
        .executor
        .execute_trade(&user, &buy_params(1_000_000_000), &TradeConfig::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("AUTOMATION_NOT_ARMED"));
    assert_eq!(h.endpoint.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn legacy_wallet_migrates_on_first_arm() {
    let h = harness();
    let keypair = Keypair::new();
    h.wallets
        .insert_wallet(&turbo_trade_engine::WalletRow {
            id: "W1".to_string(),
            user_id: "U".to_string(),
            label: None,
            pubkey: keypair.pubkey().to_string(),
            is_protected: false,
            envelope: None,
            legacy_private_key: Some(bs58::encode(keypair.to_bytes()).into_string()),
            passphrase_hash: None,
            passphrase_hint: None,
        })
        .unwrap();

    let outcome = h
        .arm
        .arm(
            "U",
            &ArmRequest {
                wallet_id: "W1".to_string(),
                passphrase: "p".to_string(),
                ttl_minutes: 10,
                ..ArmRequest::default()
            },
        )
        .await
        .unwrap();
    assert!(outcome.migrated);

    let row = h.wallets.get_wallet("U", "W1").unwrap().unwrap();
    assert!(row.is_protected);
    assert!(row.legacy_private_key.is_none());
    assert_eq!(row.envelope.as_ref().unwrap().v, 1);

    // Without the passphrase the wallet no longer arms.
    h.arm.disarm("U", "W1").await.unwrap();
    let err = h
        .arm
        .arm(
            "U",
            &ArmRequest {
                wallet_id: "W1".to_string(),
                passphrase: "nope".to_string(),
                ttl_minutes: 10,
                ..ArmRequest::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, turbo_trade_engine::ArmError::InvalidPassphrase));
}

#[tokio::test]
async fn duplicate_send_returns_cached_result_without_network_io() {
    let h = harness();
    seed_unprotected_wallet(&h, "U", "W1");
    let user = UserCtx { user_id: "U".to_string(), wallet_id: "W1".to_string() };
    let params = buy_params(1_000_000_000);

    let first = h.executor.execute_trade(&user, &params, &TradeConfig::default()).await.unwrap();
    let ExecOutcome::Sent { tx_hash: first_tx } = first else { panic!() };
    let sends_after_first = h.endpoint.sends.load(Ordering::SeqCst);

    let second = h.executor.execute_trade(&user, &params, &TradeConfig::default()).await.unwrap();
    let ExecOutcome::Sent { tx_hash: second_tx } = second else { panic!() };

    assert_eq!(first_tx, second_tx);
    assert_eq!(h.endpoint.sends.load(Ordering::SeqCst), sends_after_first);
    assert_eq!(h.trades.open_trades("U", None, None).unwrap().len(), 1);
}

#[tokio::test]
async fn idempotency_resume_window_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = engine_config(&tmp).idempotency;
    cfg.ttl_sec = 60;

    {
        let store = IdempotencyStore::new(cfg.clone());
        store.begin("key-in-flight");
        store.mark_success("key-done", "tx-done");
        store.persist().await.unwrap();
    }

    // Simulated restart: a fresh store loads the same file.
    let telemetry = Telemetry::new().unwrap();
    let store = IdempotencyStore::new(cfg);
    store.load(&telemetry).await.unwrap();

    assert_eq!(store.begin("key-in-flight"), turbo_trade_engine::BeginOutcome::Pending);
    assert_eq!(
        store.begin("key-done"),
        turbo_trade_engine::BeginOutcome::Done("tx-done".to_string())
    );
    let text = telemetry.render().unwrap();
    assert!(text.contains("resume_attempts_total 1"));
    assert!(text.contains("resume_success_total 2"));
}

#[tokio::test]
async fn retry_matrix_walks_dimensions_then_surfaces_user_error() {
    let h = harness_with_failures(vec!["connection reset", "node is behind", "slippage exceeded"]);
    seed_unprotected_wallet(&h, "U", "W1");
    let user = UserCtx { user_id: "U".to_string(), wallet_id: "W1".to_string() };

    let err = h
        .executor
        .execute_trade(&user, &buy_params(1_000_000_000), &TradeConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        turbo_trade_engine::TradeError::Send { kind: turbo_trade_engine::SendErrorKind::User, .. }
    ));

    // Three attempts hit the endpoint; two were retries.
    assert_eq!(h.endpoint.sends.load(Ordering::SeqCst), 3);
    let text = h.telemetry.render().unwrap();
    assert!(text.contains("send_retry_total 2"));
    assert!(text.contains("send_user_error_total 1"));

    // A user error leaves no trade row behind.
    assert!(h.trades.open_trades("U", None, None).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn smart_exit_time_gate_closes_paper_position() {
    let mut h = harness();
    seed_unprotected_wallet(&h, "U", "W1");
    let user = UserCtx { user_id: "U".to_string(), wallet_id: "W1".to_string() };

    let cfg = TradeConfig {
        watcher: Some(WatcherConfig {
            mode: WatchMode::Time,
            max_hold_sec: 0,
            min_pnl_before_time_exit_pct: 0.0,
            lp_drop_exit_pct: 0.0,
            authority_flip_exit: false,
            interval_sec: 1,
            rug_delay_blocks: 0,
        }),
        paper: true,
        ..TradeConfig::default()
    };

    let result = h.executor.execute_trade(&user, &buy_params(1_000_000_000), &cfg).await.unwrap();
    let ExecOutcome::Sent { tx_hash } = result else { panic!() };
    assert!(tx_hash.starts_with("paper-"));

    // The post-trade channel carries exactly one watcher bootstrap.
    let mut rx = h.post_trade_rx.take().unwrap();
    let task = rx.recv().await.unwrap();
    let PostTradeTask::StartWatcher { trade_id } = task else { panic!("expected watcher task") };

    struct NoAuthority;
    #[async_trait]
    impl turbo_trade_engine::AuthorityProbe for NoAuthority {
        async fn freeze_authority(&self, _mint: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    let watcher = SmartExitWatcher::new(
        h.trades.clone(),
        h.quotes.clone(),
        Arc::clone(&h.executor) as Arc<dyn turbo_trade_engine::ExitSender>,
        Arc::new(NoAuthority),
        h.telemetry.clone(),
    );
    watcher.watch(trade_id.clone()).await.unwrap();

    let trade = h.trades.get_trade(&trade_id).unwrap().unwrap();
    assert_eq!(trade.closed_out_amount, trade.out_amount);
    assert_eq!(h.trades.closed_trade_reason(&trade_id).unwrap(), Some("smart-time".to_string()));
    assert!(h
        .telemetry
        .render()
        .unwrap()
        .contains("exit_reason_total{reason=\"smart-time\"} 1"));
}

#[tokio::test]
async fn parallel_batch_reports_per_wallet_outcomes() {
    let h = harness();
    seed_unprotected_wallet(&h, "U", "A");
    // Wallet B intentionally missing.
    seed_unprotected_wallet(&h, "U", "C");

    let adapter = Arc::new(WalletFillAdapter {
        executor: Arc::clone(&h.executor),
        user_id: "U".to_string(),
        params: buy_params(0),
        cfg: TradeConfig::default(),
    });

    let report = fill_batch(
        adapter,
        &FillRequest {
            total_amount: 3_000_000_000,
            wallet_ids: vec!["A".into(), "B".into(), "C".into()],
            split_pct: vec![50.0, 25.0, 25.0],
            max_parallel: 2,
            id_key_base: "K".to_string(),
        },
    )
    .await
    .unwrap();

    assert_eq!(report.summary.ok_count, 2);
    assert_eq!(report.summary.fail_count, 1);
    assert_eq!(report.summary.allocated_total, 3_000_000_000);
    assert_eq!(report.per_wallet[0].id_key, "K-w0");
    assert_eq!(report.per_wallet[1].id_key, "K-w1");
    assert_eq!(report.per_wallet[2].id_key, "K-w2");
    assert!(report.per_wallet[1].error.is_some());
    assert_eq!(report.per_wallet[0].amount, 1_500_000_000);
}

#[tokio::test]
async fn kill_switch_rejects_everything_first() {
    let h = harness();
    seed_unprotected_wallet(&h, "U", "W1");
    h.executor.set_kill_switch(true);

    let user = UserCtx { user_id: "U".to_string(), wallet_id: "W1".to_string() };
    let err = h
        .executor
        .execute_trade(&user, &buy_params(1_000_000_000), &TradeConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, turbo_trade_engine::TradeError::KillSwitch));
    assert_eq!(h.endpoint.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sizing_blocks_below_min_usd() {
    let h = harness();
    seed_unprotected_wallet(&h, "U", "W1");
    let user = UserCtx { user_id: "U".to_string(), wallet_id: "W1".to_string() };

    // 1000 lamports at $160/SOL is far below the $1 floor.
    let result = h
        .executor
        .execute_trade(&user, &buy_params(1_000), &TradeConfig::default())
        .await
        .unwrap();
    assert!(matches!(result, ExecOutcome::Blocked { ref reason, .. } if reason == "below-min-usd"));
    assert_eq!(h.endpoint.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sessions_clear_on_shutdown() {
    let h = harness();
    seed_protected_wallet(&h, "U", "W1", "secret");
    h.arm
        .arm(
            "U",
            &ArmRequest {
                wallet_id: "W1".to_string(),
                passphrase: "secret".to_string(),
                ttl_minutes: 240,
                ..ArmRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(h.sessions.armed_count(), 1);

    h.sessions.shutdown();
    assert_eq!(h.sessions.armed_count(), 0);
    let status = h.arm.status("U", "W1", false).unwrap();
    assert!(!status.armed);
    assert_eq!(status.ms_left, 0);
}
