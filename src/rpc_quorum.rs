use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::transaction::VersionedTransaction;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::QuorumConfig;
use crate::telemetry::Telemetry;

/// One RPC endpoint as the pool sees it. Narrow on purpose so tests can
/// stand in for the network.
#[async_trait]
pub trait TxEndpoint: Send + Sync {
    fn url(&self) -> &str;
    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String>;
    async fn fetch_latest_blockhash(&self) -> Result<String>;
}

/// Live endpoint backed by the nonblocking Solana RPC client.
pub struct HttpTxEndpoint {
    url: String,
    client: RpcClient,
}

impl HttpTxEndpoint {
    pub fn new(url: String, timeout: Duration) -> Self {
        let client = RpcClient::new_with_timeout(url.clone(), timeout);
        Self { url, client }
    }
}

#[async_trait]
impl TxEndpoint for HttpTxEndpoint {
    fn url(&self) -> &str {
        &self.url
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String> {
        let tx: VersionedTransaction =
            bincode::deserialize(raw).context("raw transaction bytes did not deserialize")?;
        let signature = self
            .client
            .send_transaction(&tx)
            .await
            .with_context(|| format!("send via {}", self.url))?;
        Ok(signature.to_string())
    }

    async fn fetch_latest_blockhash(&self) -> Result<String> {
        let hash = self
            .client
            .get_latest_blockhash()
            .await
            .with_context(|| format!("blockhash via {}", self.url))?;
        Ok(hash.to_string())
    }
}

struct CachedBlockhash {
    hash: String,
    fetched_at: Instant,
}

/// Per-trade tuning for one fan-out; unset fields fall back to the pool
/// configuration.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct QuorumOverrides {
    pub quorum: Option<usize>,
    pub max_fanout: Option<usize>,
    pub stagger_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

/// Fan-out send pool: staggered dispatch across endpoints, accepted on
/// quorum-of-M distinct acks, with per-endpoint blockhash prewarming and
/// an endpoint rotation cursor the retry matrix advances.
pub struct RpcPool {
    endpoints: Vec<Arc<dyn TxEndpoint>>,
    cfg: QuorumConfig,
    blockhashes: Mutex<HashMap<usize, CachedBlockhash>>,
    rotation: AtomicUsize,
    telemetry: Telemetry,
}

impl RpcPool {
    pub fn new(endpoints: Vec<Arc<dyn TxEndpoint>>, cfg: QuorumConfig, telemetry: Telemetry) -> Self {
        Self {
            endpoints,
            cfg,
            blockhashes: Mutex::new(HashMap::new()),
            rotation: AtomicUsize::new(0),
            telemetry,
        }
    }

    /// Build a pool of live HTTP endpoints from configuration.
    pub fn from_config(cfg: QuorumConfig, telemetry: Telemetry) -> Self {
        let timeout = Duration::from_millis(cfg.timeout_ms);
        let endpoints: Vec<Arc<dyn TxEndpoint>> = cfg
            .endpoints
            .iter()
            .map(|url| Arc::new(HttpTxEndpoint::new(url.clone(), timeout)) as Arc<dyn TxEndpoint>)
            .collect();
        Self::new(endpoints, cfg, telemetry)
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Advance the rotation cursor so the next fan-out starts on a
    /// different endpoint.
    pub fn rotate(&self) {
        self.rotation.fetch_add(1, Ordering::Relaxed);
    }

    /// Prewarm the per-endpoint blockhash cache, refreshing anything older
    /// than the TTL. Failures are tolerated as long as one endpoint answers.
    pub async fn refresh_if_expired(&self) -> Result<()> {
        let ttl = Duration::from_millis(self.cfg.blockhash_ttl_ms);
        let stale: Vec<usize> = {
            let cache = self.blockhashes.lock();
            (0..self.endpoints.len())
                .filter(|i| {
                    cache
                        .get(i)
                        .map(|c| c.fetched_at.elapsed() >= ttl)
                        .unwrap_or(true)
                })
                .collect()
        };
        if stale.is_empty() {
            return Ok(());
        }

        let fetches = stale.iter().map(|&i| {
            let endpoint = Arc::clone(&self.endpoints[i]);
            async move { (i, endpoint.fetch_latest_blockhash().await) }
        });
        let results = futures::future::join_all(fetches).await;

        let mut refreshed = 0u64;
        let mut cache = self.blockhashes.lock();
        for (i, result) in results {
            match result {
                Ok(hash) => {
                    cache.insert(i, CachedBlockhash { hash, fetched_at: Instant::now() });
                    refreshed += 1;
                }
                Err(e) => warn!(endpoint = self.endpoints[i].url(), "blockhash refresh failed: {e:#}"),
            }
        }
        self.telemetry.blockhash_refresh_total.inc_by(refreshed);

        if cache.is_empty() {
            return Err(anyhow!("no endpoint produced a blockhash"));
        }
        Ok(())
    }

    /// Most recently cached blockhash from any endpoint.
    pub fn cached_blockhash(&self) -> Option<String> {
        let cache = self.blockhashes.lock();
        cache
            .values()
            .max_by_key(|c| c.fetched_at)
            .map(|c| c.hash.clone())
    }

    /// Race the raw transaction across up to `max_fanout` endpoints.
    /// Returns the first signature acknowledged by `quorum` distinct
    /// endpoints, or the first successful ack if quorum never forms within
    /// the timeout.
    pub async fn send_raw_transaction_quorum(&self, raw: &[u8]) -> Result<String> {
        self.send_raw_transaction_quorum_with(raw, None).await
    }

    pub async fn send_raw_transaction_quorum_with(
        &self,
        raw: &[u8],
        overrides: Option<&QuorumOverrides>,
    ) -> Result<String> {
        if self.endpoints.is_empty() {
            return Err(anyhow!("rpc pool has no endpoints"));
        }
        let over = overrides.copied().unwrap_or_default();
        let max_fanout = over.max_fanout.unwrap_or(self.cfg.max_fanout);
        let stagger_ms = over.stagger_ms.unwrap_or(self.cfg.stagger_ms);
        let timeout_ms = over.timeout_ms.unwrap_or(self.cfg.timeout_ms);
        let fanout = max_fanout.min(self.endpoints.len()).max(1);
        let quorum = over.quorum.unwrap_or(self.cfg.quorum).clamp(1, fanout);
        let offset = self.rotation.load(Ordering::Relaxed);

        let (tx, mut rx) = mpsc::channel::<Result<String>>(fanout);
        for i in 0..fanout {
            let endpoint = Arc::clone(&self.endpoints[(offset + i) % self.endpoints.len()]);
            let stagger = Duration::from_millis(stagger_ms * i as u64);
            let raw = raw.to_vec();
            let tx = tx.clone();
            self.telemetry.rpc_quorum_sent_total.inc();
            tokio::spawn(async move {
                if !stagger.is_zero() {
                    sleep(stagger).await;
                }
                let result = endpoint.send_raw_transaction(&raw).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut acks: HashMap<String, usize> = HashMap::new();
        let mut first_success: Option<String> = None;
        let mut last_error: Option<anyhow::Error> = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let next = tokio::time::timeout(remaining, rx.recv()).await;
            match next {
                Ok(Some(Ok(signature))) => {
                    let count = acks.entry(signature.clone()).or_insert(0);
                    *count += 1;
                    if first_success.is_none() {
                        first_success = Some(signature.clone());
                    }
                    if *count >= quorum {
                        debug!(%signature, acks = *count, "quorum reached");
                        self.telemetry.rpc_quorum_win_total.inc();
                        return Ok(signature);
                    }
                }
                Ok(Some(Err(e))) => {
                    last_error = Some(e);
                }
                // Channel closed: every dispatch settled short of quorum.
                Ok(None) => break,
                // Timeout.
                Err(_) => break,
            }
        }

        if let Some(signature) = first_success {
            self.telemetry.rpc_quorum_win_total.inc();
            return Ok(signature);
        }
        Err(last_error.unwrap_or_else(|| anyhow!("quorum send timed out")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct MockEndpoint {
        url: String,
        delay_ms: u64,
        response: Result<String, String>,
        sends: AtomicU64,
    }

    impl MockEndpoint {
        fn ok(url: &str, delay_ms: u64, signature: &str) -> Arc<Self> {
            Arc::new(Self {
                url: url.to_string(),
                delay_ms,
                response: Ok(signature.to_string()),
                sends: AtomicU64::new(0),
            })
        }

        fn failing(url: &str, delay_ms: u64, message: &str) -> Arc<Self> {
            Arc::new(Self {
                url: url.to_string(),
                delay_ms,
                response: Err(message.to_string()),
                sends: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl TxEndpoint for MockEndpoint {
        fn url(&self) -> &str {
            &self.url
        }

        async fn send_raw_transaction(&self, _raw: &[u8]) -> Result<String> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(self.delay_ms)).await;
            self.response.clone().map_err(|e| anyhow!(e))
        }

        async fn fetch_latest_blockhash(&self) -> Result<String> {
            Ok(format!("hash-{}", self.url))
        }
    }

    fn cfg(quorum: usize, fanout: usize) -> QuorumConfig {
        QuorumConfig {
            endpoints: vec![],
            quorum,
            max_fanout: fanout,
            stagger_ms: 5,
            timeout_ms: 2_000,
            blockhash_ttl_ms: 20_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quorum_of_two_wins() {
        let endpoints: Vec<Arc<dyn TxEndpoint>> = vec![
            MockEndpoint::ok("a", 10, "sig1"),
            MockEndpoint::ok("b", 20, "sig1"),
            MockEndpoint::ok("c", 500, "sig1"),
        ];
        let pool = RpcPool::new(endpoints, cfg(2, 3), Telemetry::new().unwrap());
        let signature = pool.send_raw_transaction_quorum(b"tx").await.unwrap();
        assert_eq!(signature, "sig1");
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_wins_when_quorum_unreachable() {
        let endpoints: Vec<Arc<dyn TxEndpoint>> = vec![
            MockEndpoint::ok("a", 10, "sig1"),
            MockEndpoint::failing("b", 10, "connection refused"),
            MockEndpoint::failing("c", 10, "connection refused"),
        ];
        let pool = RpcPool::new(endpoints, cfg(2, 3), Telemetry::new().unwrap());
        let signature = pool.send_raw_transaction_quorum(b"tx").await.unwrap();
        assert_eq!(signature, "sig1");
    }

    #[tokio::test(start_paused = true)]
    async fn all_failures_surface_an_error() {
        let endpoints: Vec<Arc<dyn TxEndpoint>> = vec![
            MockEndpoint::failing("a", 5, "node is behind"),
            MockEndpoint::failing("b", 5, "node is behind"),
        ];
        let pool = RpcPool::new(endpoints, cfg(1, 2), Telemetry::new().unwrap());
        let err = pool.send_raw_transaction_quorum(b"tx").await.unwrap_err();
        assert!(err.to_string().contains("node is behind"));
    }

    #[tokio::test]
    async fn prewarm_caches_blockhashes_per_endpoint() {
        let endpoints: Vec<Arc<dyn TxEndpoint>> =
            vec![MockEndpoint::ok("a", 0, "s"), MockEndpoint::ok("b", 0, "s")];
        let telemetry = Telemetry::new().unwrap();
        let pool = RpcPool::new(endpoints, cfg(1, 2), telemetry.clone());

        pool.refresh_if_expired().await.unwrap();
        assert!(pool.cached_blockhash().is_some());

        // Within TTL the second call is a no-op.
        pool.refresh_if_expired().await.unwrap();
        let text = telemetry.render().unwrap();
        assert!(text.contains("blockhash_refresh_total 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn fanout_respects_limit_and_rotation() {
        let a = MockEndpoint::ok("a", 5, "sig");
        let b = MockEndpoint::ok("b", 5, "sig");
        let c = MockEndpoint::ok("c", 5, "sig");
        let endpoints: Vec<Arc<dyn TxEndpoint>> = vec![a.clone(), b.clone(), c.clone()];
        let pool = RpcPool::new(endpoints, cfg(1, 1), Telemetry::new().unwrap());

        pool.send_raw_transaction_quorum(b"tx").await.unwrap();
        assert_eq!(a.sends.load(Ordering::SeqCst), 1);
        assert_eq!(b.sends.load(Ordering::SeqCst), 0);

        pool.rotate();
        pool.send_raw_transaction_quorum(b"tx").await.unwrap();
        assert_eq!(b.sends.load(Ordering::SeqCst), 1);
        assert_eq!(c.sends.load(Ordering::SeqCst), 0);
    }
}
