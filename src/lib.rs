//! Armed automation and turbo execution engine for Solana trading
//!
//! This library provides:
//! - Envelope cryptography and short-lived arm sessions for bot signing
//! - A turbo trade executor with liquidity sizing, leader-time scheduling,
//!   quorum fan-out sends, and a deterministic retry matrix
//! - Post-buy Smart-Exit watching with FIFO position accounting
//! - Auto-return sweeps when an arm session lapses

pub mod arm_api;
pub mod arm_service;
pub mod auto_return;
pub mod config;
pub mod constants;
pub mod envelope_crypto;
pub mod executor;
pub mod funds_sweeper;
pub mod idempotency;
pub mod leader_scheduler;
pub mod liquidity_sizer;
pub mod parallel_filler;
pub mod quote_cache;
pub mod quote_provider;
pub mod relay_client;
pub mod retry_matrix;
pub mod risk_filter;
pub mod rpc_quorum;
pub mod session_cache;
pub mod smart_exit;
pub mod telemetry;
pub mod trade_error;
pub mod trade_store;
pub mod wallet_store;

// Re-export main types for convenience
pub use arm_service::{ArmError, ArmOutcome, ArmRequest, ArmService, StatusOutcome};
pub use auto_return::{AutoReturnOverride, AutoReturnScheduler, SweepExecutor, SweepPlan, SweepReport};
pub use config::{
    AutoReturnConfig, EngineConfig, EnvelopeConfig, IdempotencyConfig, LeaderTimingConfig,
    ProbeConfig, QuorumConfig, QuoteCacheConfig, RetryPolicy, SessionConfig, SizingConfig,
    WatchMode, WatcherConfig,
};
pub use envelope_crypto::{CryptoError, Envelope};
pub use executor::{
    ExecOutcome, ExecutorParts, PostTradeTask, TradeConfig, TradeParams, TurboExecutor, UserCtx,
    WalletFillAdapter,
};
pub use idempotency::{derive_id_key, BeginOutcome, IdempotencyStore};
pub use leader_scheduler::{compute_hold_ms, LeaderSchedule, LeaderSource};
pub use liquidity_sizer::{probe_plan, size_for_liquidity, ProbePlan, SizingOutcome};
pub use parallel_filler::{
    fill_batch, fill_first_win, BatchReport, BatchSummary, FillExecutor, FillRequest, PerWalletFill,
};
pub use quote_cache::QuoteCache;
pub use quote_provider::{HttpQuoteProvider, Quote, QuoteProvider, QuoteRequest, SwapMode};
pub use relay_client::{RelayClient, RelayConfig, TipPercentile};
pub use retry_matrix::{backoff_delay, decide, BumpDimension, RetryDecision};
pub use risk_filter::{DevWatchConfig, DevWatchReport, RiskProvider};
pub use rpc_quorum::{HttpTxEndpoint, QuorumOverrides, RpcPool, TxEndpoint};
pub use session_cache::{SessionCache, SessionKey, SessionStatus};
pub use smart_exit::{AuthorityProbe, ExitSender, SmartExitWatcher};
pub use telemetry::Telemetry;
pub use trade_error::{classify_send_error, SendErrorKind, TradeError, AUTOMATION_NOT_ARMED};
pub use trade_store::{ExitFill, NewTpSlRule, Trade, TradeExtras, TradeStore};
pub use wallet_store::{WalletRow, WalletStore};
