use thiserror::Error;

/// Canonical marker surfaced when a protected wallet has no live session.
pub const AUTOMATION_NOT_ARMED: &str = "AUTOMATION_NOT_ARMED";

/// Error taxonomy for one trade attempt. The executor maps every provider
/// failure into one of these before it reaches a caller.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("AUTOMATION_NOT_ARMED: {0}")]
    NotArmed(String),

    #[error("blocked: {reason}")]
    RiskBlocked { reason: String, detail: String },

    #[error("duplicate trade within idempotency window")]
    Duplicate { tx_hash: Option<String> },

    #[error("send failed ({kind:?}): {message}")]
    Send { kind: SendErrorKind, message: String },

    #[error("persistence: {0}")]
    Persistence(String),

    #[error("crypto: {0}")]
    Crypto(String),

    #[error("kill switch engaged")]
    KillSwitch,
}

/// Coarse send-failure classes driving the retry matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// Caused by the trade parameters themselves. Never retried.
    User,
    /// Transient network or consensus trouble. Retried per the matrix.
    Net,
    Unknown,
}

/// Classify a raw send error by substring, mirroring what the RPC and
/// aggregator layers actually return.
pub fn classify_send_error(message: &str) -> SendErrorKind {
    let lower = message.to_lowercase();

    if lower.contains("slippage")
        || lower.contains("insufficient")
        || lower.contains("mint not found")
        || lower.contains("account in use")
    {
        SendErrorKind::User
    } else if lower.contains("blockhash")
        || lower.contains("node is behind")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection")
    {
        SendErrorKind::Net
    } else {
        SendErrorKind::Unknown
    }
}
