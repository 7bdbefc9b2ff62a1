use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turbo_trade_engine::arm_api::{self, AppState};
use turbo_trade_engine::funds_sweeper::RpcSweeper;
use turbo_trade_engine::{
    ArmService, AutoReturnScheduler, EngineConfig, ExecutorParts, HttpQuoteProvider,
    IdempotencyStore, QuoteCache, RelayClient, RelayConfig, RpcPool, SessionCache,
    SmartExitWatcher, Telemetry, TradeStore, TurboExecutor, WalletStore,
};

#[derive(Parser, Debug)]
#[command(name = "turbo_engine", about = "Armed automation and turbo execution engine")]
struct Args {
    /// Bind address for the HTTP surface
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8787)]
    port: u16,

    /// SQLite database path shared by the trade and wallet stores
    #[arg(long, default_value = "data/turbo-engine.db")]
    db_path: String,

    /// Quote aggregator base URL
    #[arg(long, default_value = "https://quote-api.jup.ag/v6")]
    quote_url: String,

    /// Disable the bundle relay client
    #[arg(long, default_value_t = false)]
    no_relay: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let cfg = EngineConfig::from_env()?;
    let telemetry = Telemetry::new()?;

    info!("🚀 starting turbo engine on {}:{}", args.host, args.port);

    let sessions = Arc::new(SessionCache::new(cfg.session.clone()));
    let idempotency = Arc::new(IdempotencyStore::new(cfg.idempotency.clone()));
    idempotency.load(&telemetry).await?;

    let trades = TradeStore::new(&args.db_path)?;
    let wallets = WalletStore::new(&args.db_path)?;

    let pool = Arc::new(RpcPool::from_config(cfg.quorum.clone(), telemetry.clone()));
    let relay = if args.no_relay {
        None
    } else {
        Some(Arc::new(RelayClient::new(RelayConfig::default(), telemetry.clone())?))
    };

    let reader_url = cfg
        .quorum
        .endpoints
        .first()
        .cloned()
        .context("RPC_POOL_ENDPOINTS must name at least one endpoint")?;
    let sweeper = Arc::new(RpcSweeper::new(
        wallets.clone(),
        Arc::clone(&pool),
        reader_url,
        cfg.encryption_secret.clone(),
    ));
    let auto_return = AutoReturnScheduler::new(wallets.clone(), sweeper);

    // Session expiry feeds the auto-return side.
    let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
    sessions.set_expiry_channel(expiry_tx);
    sessions.spawn_sweeper();
    auto_return.listen(expiry_rx);

    let quotes = Arc::new(HttpQuoteProvider::new(args.quote_url, Duration::from_secs(5))?);
    let (post_trade_tx, post_trade_rx) = mpsc::unbounded_channel();

    let executor = TurboExecutor::new(ExecutorParts {
        sessions: Arc::clone(&sessions),
        idempotency: Arc::clone(&idempotency),
        quote_cache: QuoteCache::new(cfg.quote_cache.clone()),
        quotes: quotes.clone(),
        pool,
        relay,
        trades: trades.clone(),
        wallets: wallets.clone(),
        risk: None,
        leader_source: None,
        telemetry: telemetry.clone(),
        cfg: cfg.clone(),
        post_trade_tx,
    });

    let authority = Arc::new(RpcAuthorityProbe::new(
        cfg.quorum.endpoints.first().cloned().unwrap_or_default(),
    ));
    let watcher = SmartExitWatcher::new(
        trades,
        quotes,
        Arc::clone(&executor) as Arc<dyn turbo_trade_engine::ExitSender>,
        authority,
        telemetry.clone(),
    );
    watcher.spawn_worker(post_trade_rx);

    let arm = ArmService::new(
        wallets,
        Arc::clone(&sessions),
        Arc::clone(&auto_return),
        executor.trade_store().clone(),
        cfg.envelope.clone(),
        cfg.encryption_secret.clone(),
    );

    let app = arm_api::router(AppState { arm, telemetry });
    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("binding {}:{}", args.host, args.port))?;
    info!("📡 arm surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Drain state: zero every DEK, stop timers, persist the resume window.
    sessions.shutdown();
    auto_return.shutdown();
    if let Err(e) = idempotency.persist().await {
        warn!("idempotency persist on shutdown failed: {e:#}");
    }
    info!("👋 turbo engine stopped");
    Ok(())
}

/// Freeze-authority lookup over RPC for the watcher.
struct RpcAuthorityProbe {
    client: solana_client::nonblocking::rpc_client::RpcClient,
}

impl RpcAuthorityProbe {
    fn new(url: String) -> Self {
        Self {
            client: solana_client::nonblocking::rpc_client::RpcClient::new_with_timeout(
                url,
                Duration::from_secs(5),
            ),
        }
    }
}

#[async_trait::async_trait]
impl turbo_trade_engine::AuthorityProbe for RpcAuthorityProbe {
    async fn freeze_authority(&self, mint: &str) -> Result<Option<String>> {
        use solana_sdk::program_pack::Pack;

        let pubkey: solana_sdk::pubkey::Pubkey = mint.parse()?;
        let account = self.client.get_account(&pubkey).await?;
        let mint_state = spl_token::state::Mint::unpack_from_slice(&account.data)?;
        Ok(Option::<solana_sdk::pubkey::Pubkey>::from(mint_state.freeze_authority)
            .map(|p| p.to_string()))
    }
}
