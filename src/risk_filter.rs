use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Snapshot of the dev/creator heuristics for a mint, as reported by the
/// external token-safety service.
#[derive(Debug, Clone, Default)]
pub struct DevWatchReport {
    pub blacklisted: bool,
    pub holder_concentration_pct: f64,
    pub lp_burn_pct: f64,
    pub insider_flagged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DevWatchConfig {
    pub max_holder_concentration_pct: f64,
    pub min_lp_burn_pct: f64,
    pub block_insider: bool,
}

impl Default for DevWatchConfig {
    fn default() -> Self {
        Self {
            max_holder_concentration_pct: 30.0,
            min_lp_burn_pct: 80.0,
            block_insider: true,
        }
    }
}

/// Narrow interface to the token-safety service.
#[async_trait]
pub trait RiskProvider: Send + Sync {
    async fn inspect_mint(&self, mint: &str) -> Result<DevWatchReport>;
}

/// First failing heuristic, in blocking precedence order. The reason slug
/// is stable: it feeds both the blocked response and the metrics label.
pub fn evaluate(report: &DevWatchReport, cfg: &DevWatchConfig) -> Option<(String, String)> {
    if report.blacklisted {
        return Some(("blacklist".to_string(), "creator wallet is blacklisted".to_string()));
    }
    if report.holder_concentration_pct > cfg.max_holder_concentration_pct {
        return Some((
            "holder-concentration".to_string(),
            format!(
                "top holders control {:.1}% (limit {:.1}%)",
                report.holder_concentration_pct, cfg.max_holder_concentration_pct
            ),
        ));
    }
    if report.lp_burn_pct < cfg.min_lp_burn_pct {
        return Some((
            "lp-burn-low".to_string(),
            format!("only {:.1}% of LP burned (minimum {:.1}%)", report.lp_burn_pct, cfg.min_lp_burn_pct),
        ));
    }
    if cfg.block_insider && report.insider_flagged {
        return Some(("insider".to_string(), "insider funding pattern detected".to_string()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean() -> DevWatchReport {
        DevWatchReport {
            blacklisted: false,
            holder_concentration_pct: 10.0,
            lp_burn_pct: 100.0,
            insider_flagged: false,
        }
    }

    #[test]
    fn clean_report_passes() {
        assert!(evaluate(&clean(), &DevWatchConfig::default()).is_none());
    }

    #[test]
    fn blacklist_takes_precedence() {
        let report = DevWatchReport { blacklisted: true, insider_flagged: true, ..clean() };
        let (reason, _) = evaluate(&report, &DevWatchConfig::default()).unwrap();
        assert_eq!(reason, "blacklist");
    }

    #[test]
    fn each_heuristic_blocks() {
        let cfg = DevWatchConfig::default();

        let concentrated = DevWatchReport { holder_concentration_pct: 55.0, ..clean() };
        assert_eq!(evaluate(&concentrated, &cfg).unwrap().0, "holder-concentration");

        let unburned = DevWatchReport { lp_burn_pct: 20.0, ..clean() };
        assert_eq!(evaluate(&unburned, &cfg).unwrap().0, "lp-burn-low");

        let insider = DevWatchReport { insider_flagged: true, ..clean() };
        assert_eq!(evaluate(&insider, &cfg).unwrap().0, "insider");
    }

    #[test]
    fn insider_block_can_be_disabled() {
        let cfg = DevWatchConfig { block_insider: false, ..DevWatchConfig::default() };
        let insider = DevWatchReport { insider_flagged: true, ..clean() };
        assert!(evaluate(&insider, &cfg).is_none());
    }
}
