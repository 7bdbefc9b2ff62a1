use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Engine-wide counters and histograms, registered on one prometheus
/// registry and exported through the HTTP surface.
#[derive(Clone)]
pub struct Telemetry {
    registry: Arc<Registry>,

    pub probe_abort_total: IntCounter,
    pub probe_scale_success_total: IntCounter,
    pub rpc_quorum_sent_total: IntCounter,
    pub rpc_quorum_win_total: IntCounter,
    pub blockhash_refresh_total: IntCounter,
    pub relay_win_total: IntCounter,
    pub send_retry_total: IntCounter,
    pub send_user_error_total: IntCounter,
    pub send_net_error_total: IntCounter,
    pub send_unknown_error_total: IntCounter,
    pub resume_attempts_total: IntCounter,
    pub resume_success_total: IntCounter,
    pub parallel_abort_total: IntCounter,
    pub exit_reason_total: IntCounterVec,
    pub risk_blocked_total: IntCounterVec,

    pub sizing_reduced_pct: Histogram,
    pub price_impact_pct: Histogram,
    pub leader_hold_ms: Histogram,
    pub parallel_first_win_ms: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let c = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Result<Histogram> {
    let h = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))?;
    registry.register(Box::new(h.clone()))?;
    Ok(h)
}

impl Telemetry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        Ok(Self {
            probe_abort_total: counter(&registry, "probe_abort_total", "probe buys aborted on live impact")?,
            probe_scale_success_total: counter(
                &registry,
                "probe_scale_success_total",
                "probe buys scaled to full size",
            )?,
            rpc_quorum_sent_total: counter(&registry, "rpc_quorum_sent_total", "raw sends fanned out")?,
            rpc_quorum_win_total: counter(&registry, "rpc_quorum_win_total", "sends accepted by quorum")?,
            blockhash_refresh_total: counter(&registry, "blockhash_refresh_total", "blockhash refreshes")?,
            relay_win_total: counter(&registry, "relay_win_total", "relay acks beating confirmation")?,
            send_retry_total: counter(&registry, "send_retry_total", "send attempts retried")?,
            send_user_error_total: counter(&registry, "send_user_error_total", "sends failed on user error")?,
            send_net_error_total: counter(&registry, "send_net_error_total", "sends failed on network error")?,
            send_unknown_error_total: counter(
                &registry,
                "send_unknown_error_total",
                "sends failed unclassified",
            )?,
            resume_attempts_total: counter(
                &registry,
                "resume_attempts_total",
                "idempotency resume files loaded on boot",
            )?,
            resume_success_total: counter(
                &registry,
                "resume_success_total",
                "idempotency records restored on boot",
            )?,
            parallel_abort_total: counter(&registry, "parallel_abort_total", "parallel fill attempts discarded")?,
            exit_reason_total: counter_vec(
                &registry,
                "exit_reason_total",
                "smart exits fired, by reason",
                &["reason"],
            )?,
            risk_blocked_total: counter_vec(
                &registry,
                "risk_blocked_total",
                "trades blocked pre-quote, by reason",
                &["reason"],
            )?,

            sizing_reduced_pct: histogram(
                &registry,
                "sizing_reduced_pct",
                "percent shaved off the requested notional",
                vec![0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 90.0, 100.0],
            )?,
            price_impact_pct: histogram(
                &registry,
                "price_impact_pct",
                "estimated price impact at the sized amount",
                vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0],
            )?,
            leader_hold_ms: histogram(
                &registry,
                "leader_hold_ms",
                "pre-send hold waiting for a leader window",
                vec![0.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0],
            )?,
            parallel_first_win_ms: histogram(
                &registry,
                "parallel_first_win_ms",
                "time to first winning parallel fill",
                vec![50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0],
            )?,
            registry: Arc::new(registry),
        })
    }

    /// Render the registry in prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_and_render() {
        let t = Telemetry::new().unwrap();
        t.send_retry_total.inc();
        t.exit_reason_total.with_label_values(&["smart-time"]).inc();
        let text = t.render().unwrap();
        assert!(text.contains("send_retry_total 1"));
        assert!(text.contains("exit_reason_total{reason=\"smart-time\"} 1"));
    }
}
