/// Global constants for the turbo trade engine
///
/// This module centralizes magic numbers shared across the execution path
/// to keep the sizing, scheduling, and retry components consistent.

// ============================================================================
// SOLANA BLOCKCHAIN CONSTANTS
// ============================================================================

/// 1 SOL = 1 billion lamports
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Convert lamports to SOL (floating point)
pub const fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Convert SOL to lamports
pub const fn sol_to_lamports(sol: f64) -> u64 {
    (sol * LAMPORTS_PER_SOL as f64) as u64
}

/// Solana slot time (approximately 400ms per slot)
pub const SLOT_TIME_MS: u64 = 400;

/// Maximum transaction compute units
pub const MAX_COMPUTE_UNITS: u32 = 1_400_000;

/// Default compute units for a swap transaction
pub const DEFAULT_COMPUTE_UNITS: u32 = 200_000;

// ============================================================================
// ARM SESSION DEFAULTS
// ============================================================================

/// Default session TTL when a caller passes ttlMinutes < 1
pub const DEFAULT_ARM_TTL_MINUTES: u64 = 240;

/// Minimum accepted session lifetime
pub const MIN_ARM_TTL_MINUTES: u64 = 1;

/// Session sweeper cadence; expiry is detected within this window
pub const SESSION_SWEEP_INTERVAL_MS: u64 = 5_000;

// ============================================================================
// IDEMPOTENCY DEFAULTS
// ============================================================================

/// In-memory gate TTL when IDEMPOTENCY_TTL_SEC is unset
pub const DEFAULT_IDEMPOTENCY_TTL_SEC: u64 = 90;

/// Width of the time bucket folded into the idempotency key
pub const DEFAULT_ID_KEY_BUCKET_MS: u64 = 30_000;

// ============================================================================
// QUOTE / SEND DEFAULTS
// ============================================================================

/// Warm quote cache TTL; quotes older than this are stale before send
pub const DEFAULT_QUOTE_TTL_MS: u64 = 600;

/// Blockhash cache TTL per RPC endpoint
pub const DEFAULT_BLOCKHASH_TTL_MS: u64 = 20_000;

/// Stagger between fanned-out RPC sends
pub const DEFAULT_SEND_STAGGER_MS: u64 = 25;

/// Per-send timeout across the RPC pool
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 8_000;

/// Recent-duplicate window for the pre-send trade dedup guard
pub const TRADE_DEDUP_WINDOW_SEC: i64 = 60;

/// Upper bound on a leader-schedule hold before we send anyway
pub const MAX_LEADER_HOLD_MS: u64 = 4_000;
