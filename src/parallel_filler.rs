use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::telemetry::Telemetry;

/// Executes one wallet's share of a split trade. Implemented by the turbo
/// executor; mocked in tests.
#[async_trait]
pub trait FillExecutor: Send + Sync {
    async fn fill(&self, wallet_id: &str, amount: u64, id_key: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct FillRequest {
    pub total_amount: u64,
    pub wallet_ids: Vec<String>,
    /// Fractions summing to ~1 or percentages summing to ~100.
    pub split_pct: Vec<f64>,
    pub max_parallel: usize,
    pub id_key_base: String,
}

#[derive(Debug, Clone)]
pub struct PerWalletFill {
    pub wallet_id: String,
    pub id_key: String,
    pub amount: u64,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub ok_count: usize,
    pub fail_count: usize,
    pub allocated_total: u64,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub per_wallet: Vec<PerWalletFill>,
    pub summary: BatchSummary,
}

/// Normalize the split list to fractions. Accepts fraction-scale (~1) or
/// percent-scale (~100) inputs; anything else is rejected.
pub fn normalize_splits(split_pct: &[f64], wallet_count: usize) -> Result<Vec<f64>> {
    if split_pct.is_empty() {
        return Err(anyhow!("split list is empty"));
    }
    if split_pct.len() != wallet_count {
        return Err(anyhow!(
            "split list has {} entries for {} wallets",
            split_pct.len(),
            wallet_count
        ));
    }
    if split_pct.iter().any(|&s| s <= 0.0 || !s.is_finite()) {
        return Err(anyhow!("splits must be positive"));
    }

    let sum: f64 = split_pct.iter().sum();
    let scale = if (0.99..=1.01).contains(&sum) {
        1.0
    } else if (99.0..=101.0).contains(&sum) {
        100.0
    } else {
        return Err(anyhow!("splits sum to {sum}, expected ~1 or ~100"));
    };
    Ok(split_pct.iter().map(|s| s / scale).collect())
}

/// Floor each wallet's share to whole base units.
pub fn allocate_amounts(total_amount: u64, fractions: &[f64]) -> Vec<u64> {
    fractions
        .iter()
        .map(|f| (total_amount as f64 * f).floor() as u64)
        .collect()
}

fn wallet_id_key(base: &str, index: usize) -> String {
    format!("{base}-w{index}")
}

struct PlannedFill {
    index: usize,
    wallet_id: String,
    amount: u64,
    id_key: String,
}

fn plan(request: &FillRequest) -> Result<Vec<PlannedFill>> {
    let fractions = normalize_splits(&request.split_pct, request.wallet_ids.len())?;
    let amounts = allocate_amounts(request.total_amount, &fractions);
    Ok(request
        .wallet_ids
        .iter()
        .zip(amounts)
        .enumerate()
        .map(|(index, (wallet_id, amount))| PlannedFill {
            index,
            wallet_id: wallet_id.clone(),
            amount,
            id_key: wallet_id_key(&request.id_key_base, index),
        })
        .collect())
}

/// Execute every wallet's share under the concurrency cap and report all
/// results, in input order.
pub async fn fill_batch(executor: Arc<dyn FillExecutor>, request: &FillRequest) -> Result<BatchReport> {
    let planned = plan(request)?;
    let semaphore = Arc::new(Semaphore::new(request.max_parallel.max(1)));
    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, PerWalletFill)>();

    for fill in planned.iter() {
        let executor = Arc::clone(&executor);
        let semaphore = Arc::clone(&semaphore);
        let tx = tx.clone();
        let (index, wallet_id, amount, id_key) =
            (fill.index, fill.wallet_id.clone(), fill.amount, fill.id_key.clone());
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = executor.fill(&wallet_id, amount, &id_key).await;
            let outcome = match result {
                Ok(tx_hash) => {
                    PerWalletFill { wallet_id, id_key, amount, tx_hash: Some(tx_hash), error: None }
                }
                Err(e) => PerWalletFill {
                    wallet_id,
                    id_key,
                    amount,
                    tx_hash: None,
                    error: Some(format!("{e:#}")),
                },
            };
            let _ = tx.send((index, outcome));
        });
    }
    drop(tx);

    let mut per_wallet: Vec<Option<PerWalletFill>> = (0..planned.len()).map(|_| None).collect();
    while let Some((index, outcome)) = rx.recv().await {
        per_wallet[index] = Some(outcome);
    }
    let per_wallet: Vec<PerWalletFill> = per_wallet.into_iter().flatten().collect();

    let ok_count = per_wallet.iter().filter(|f| f.tx_hash.is_some()).count();
    let allocated_total = per_wallet.iter().map(|f| f.amount).sum();
    Ok(BatchReport {
        summary: BatchSummary {
            ok_count,
            fail_count: per_wallet.len() - ok_count,
            allocated_total,
        },
        per_wallet,
    })
}

/// Race every wallet's share; the first success wins. Losers keep settling
/// in the background but their results are discarded.
pub async fn fill_first_win(
    executor: Arc<dyn FillExecutor>,
    request: &FillRequest,
    telemetry: &Telemetry,
) -> Result<PerWalletFill> {
    let planned = plan(request)?;
    let started = Instant::now();
    let semaphore = Arc::new(Semaphore::new(request.max_parallel.max(1)));
    let (tx, mut rx) = mpsc::unbounded_channel::<PerWalletFill>();

    let attempts = planned.len();
    for fill in planned.iter() {
        let executor = Arc::clone(&executor);
        let semaphore = Arc::clone(&semaphore);
        let tx = tx.clone();
        let (wallet_id, amount, id_key) = (fill.wallet_id.clone(), fill.amount, fill.id_key.clone());
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let outcome = match executor.fill(&wallet_id, amount, &id_key).await {
                Ok(tx_hash) => {
                    PerWalletFill { wallet_id, id_key, amount, tx_hash: Some(tx_hash), error: None }
                }
                Err(e) => PerWalletFill {
                    wallet_id,
                    id_key,
                    amount,
                    tx_hash: None,
                    error: Some(format!("{e:#}")),
                },
            };
            let _ = tx.send(outcome);
        });
    }
    drop(tx);

    let mut settled = 0usize;
    let mut last_error: Option<String> = None;
    while let Some(outcome) = rx.recv().await {
        settled += 1;
        if outcome.tx_hash.is_some() {
            telemetry
                .parallel_first_win_ms
                .observe(started.elapsed().as_millis() as f64);
            let remaining = attempts - settled;
            if remaining > 0 {
                telemetry.parallel_abort_total.inc_by(remaining as u64);
                // Drain the rest off-path so their tasks settle quietly.
                tokio::spawn(async move {
                    let mut rx = rx;
                    while rx.recv().await.is_some() {}
                });
            }
            debug!(wallet = %outcome.wallet_id, "first-win fill settled");
            return Ok(outcome);
        }
        last_error = outcome.error;
    }

    warn!("all parallel fill attempts failed");
    Err(anyhow!(last_error.unwrap_or_else(|| "all fill attempts failed".to_string())))
}
