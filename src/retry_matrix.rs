use std::time::Duration;

use crate::config::RetryPolicy;
use crate::trade_error::SendErrorKind;

/// The single tuning dimension adjusted before a retry. One bump per
/// attempt keeps failures attributable: if attempt k+1 lands, the k-th
/// bump is what fixed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpDimension {
    ComputeUnits,
    Tip,
    /// Flip between aggregator and bundle relay. Applied at most once.
    RouteToggle,
    RotateRpc,
}

/// What the send loop should do after a classified failure on 1-based
/// retry index `k` (k=1 is the first failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Surface,
    Retry(BumpDimension),
}

pub fn decide(
    kind: SendErrorKind,
    k: u32,
    route_toggle_allowed: bool,
    alternate_endpoints: bool,
) -> RetryDecision {
    match kind {
        SendErrorKind::User => RetryDecision::Surface,
        SendErrorKind::Unknown => {
            // One conservative compute bump, then give up.
            if k == 1 {
                RetryDecision::Retry(BumpDimension::ComputeUnits)
            } else {
                RetryDecision::Surface
            }
        }
        SendErrorKind::Net => match k {
            0 => RetryDecision::Surface,
            1 => RetryDecision::Retry(BumpDimension::ComputeUnits),
            2 => RetryDecision::Retry(BumpDimension::Tip),
            3 if route_toggle_allowed => RetryDecision::Retry(BumpDimension::RouteToggle),
            _ if alternate_endpoints => RetryDecision::Retry(BumpDimension::RotateRpc),
            _ => RetryDecision::Retry(BumpDimension::ComputeUnits),
        },
    }
}

/// Exponential backoff with bounded jitter before retry `attempt` (1-based).
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_delay_ms as f64;
    let exponential = base * policy.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

    // Jitter spreads concurrent retriers apart instead of synchronizing them.
    let jitter = exponential * policy.jitter_factor * (fastrand::f64() - 0.5);
    let capped = (exponential + jitter).clamp(0.0, policy.max_delay_ms as f64);
    Duration::from_millis(capped as u64)
}
