use thiserror::Error;
use tracing::debug;

use crate::config::{ProbeConfig, SizingConfig};

#[derive(Debug, Error, PartialEq)]
pub enum SizingError {
    /// The amount surviving the impact and pool ceilings is worth less
    /// than the configured floor; the trade is not worth its fees.
    #[error("below-min-usd: {usd:.4} < {min:.4}")]
    BelowMinUsd { usd: f64, min: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingOutcome {
    pub amount: u64,
    /// Percent shaved off the requested notional.
    pub reduced_pct: f64,
    pub est_impact_pct: f64,
}

const MAX_SEARCH_ITERATIONS: u32 = 32;

/// Reduce `base_amount` until it clears the impact and pool-share ceilings.
/// `estimate_impact` maps an amount to an estimated price impact percent and
/// is assumed monotonic in the amount; `unit_price_usd` values one base unit.
pub fn size_for_liquidity(
    base_amount: u64,
    pool_reserve: Option<u64>,
    unit_price_usd: f64,
    cfg: &SizingConfig,
    estimate_impact: impl Fn(u64) -> f64,
) -> Result<SizingOutcome, SizingError> {
    let mut ceiling = base_amount;

    if let Some(reserve) = pool_reserve {
        let pool_cap = ((reserve as f64) * cfg.max_pool_pct / 100.0).floor() as u64;
        ceiling = ceiling.min(pool_cap);
    }

    let amount = if estimate_impact(ceiling) <= cfg.max_impact_pct {
        ceiling
    } else {
        // Largest amount under the impact ceiling, by bounded bisection.
        let mut lo = 0u64;
        let mut hi = ceiling;
        for _ in 0..MAX_SEARCH_ITERATIONS {
            if lo >= hi {
                break;
            }
            let mid = lo + (hi - lo + 1) / 2;
            if estimate_impact(mid) <= cfg.max_impact_pct {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        lo
    };

    let usd = amount as f64 * unit_price_usd;
    if usd < cfg.min_usd {
        return Err(SizingError::BelowMinUsd { usd, min: cfg.min_usd });
    }

    let reduced_pct = if base_amount == 0 {
        0.0
    } else {
        (base_amount - amount) as f64 * 100.0 / base_amount as f64
    };
    let est_impact_pct = estimate_impact(amount);
    if reduced_pct > 0.0 {
        debug!(base_amount, amount, reduced_pct, "notional reduced against liquidity ceilings");
    }

    Ok(SizingOutcome { amount, reduced_pct, est_impact_pct })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePlan {
    pub probe_amount: u64,
    pub scale_amount: u64,
}

/// Split a sized amount into a micro-buy probe and the follow-up scale leg.
/// Returns None when probing is disabled or the amount cannot be split.
pub fn probe_plan(amount: u64, cfg: &ProbeConfig) -> Option<ProbePlan> {
    if !cfg.enabled || amount < 2 {
        return None;
    }
    let divisor = cfg.scale_factor.max(2);
    let probe_amount = (amount / divisor).max(1);
    Some(ProbePlan { probe_amount, scale_amount: amount - probe_amount })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SizingConfig {
        SizingConfig { max_impact_pct: 5.0, max_pool_pct: 2.0, min_usd: 1.0 }
    }

    /// Impact model linear in the amount: impact(a) = a / scale.
    fn linear_impact(scale: f64) -> impl Fn(u64) -> f64 {
        move |a| a as f64 / scale
    }

    #[test]
    fn full_amount_passes_when_under_ceilings() {
        let out = size_for_liquidity(1_000, None, 1.0, &cfg(), linear_impact(1_000.0)).unwrap();
        assert_eq!(out.amount, 1_000);
        assert_eq!(out.reduced_pct, 0.0);
    }

    #[test]
    fn impact_ceiling_shrinks_the_amount() {
        // impact(a) = a / 100, so 5% allows exactly 500.
        let out = size_for_liquidity(10_000, None, 1.0, &cfg(), linear_impact(100.0)).unwrap();
        assert_eq!(out.amount, 500);
        assert!(out.reduced_pct > 90.0);
        assert!(out.est_impact_pct <= 5.0);
    }

    #[test]
    fn pool_share_ceiling_applies_when_reserves_known() {
        // 2% of a 10_000 reserve caps at 200 even with zero impact.
        let out = size_for_liquidity(5_000, Some(10_000), 1.0, &cfg(), |_| 0.0).unwrap();
        assert_eq!(out.amount, 200);
    }

    #[test]
    fn never_exceeds_base() {
        let out = size_for_liquidity(100, Some(1_000_000_000), 1.0, &cfg(), |_| 0.0).unwrap();
        assert_eq!(out.amount, 100);
    }

    #[test]
    fn below_min_usd_aborts() {
        let err = size_for_liquidity(10, None, 0.01, &cfg(), |_| 0.0).unwrap_err();
        assert!(matches!(err, SizingError::BelowMinUsd { .. }));
    }

    #[test]
    fn probe_plan_splits_by_scale_factor() {
        let cfg = ProbeConfig { enabled: true, scale_factor: 4, ..ProbeConfig::default() };
        let plan = probe_plan(1_000_000, &cfg).unwrap();
        assert_eq!(plan.probe_amount, 250_000);
        assert_eq!(plan.probe_amount + plan.scale_amount, 1_000_000);

        // Factor below 2 clamps to a half split.
        let cfg = ProbeConfig { enabled: true, scale_factor: 1, ..ProbeConfig::default() };
        let plan = probe_plan(1_000, &cfg).unwrap();
        assert_eq!(plan.probe_amount, 500);

        let disabled = ProbeConfig::default();
        assert!(probe_plan(1_000, &disabled).is_none());
    }
}
