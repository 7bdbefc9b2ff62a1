use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::QuoteCacheConfig;
use crate::quote_provider::{Quote, QuoteRequest};

/// Warm cache of recent quotes, bucketed by TTL. The executor treats a miss
/// here as a hard gate: it must call the quote provider before sending, so a
/// stale route never reaches the wire.
#[derive(Clone)]
pub struct QuoteCache {
    buckets: Arc<RwLock<HashMap<u64, Bucket>>>,
    cfg: QuoteCacheConfig,
    stats: Arc<RwLock<QuoteCacheStats>>,
}

struct Bucket {
    ttl: Duration,
    entries: HashMap<QuoteRequest, CacheEntry>,
}

struct CacheEntry {
    quote: Quote,
    expires_at: Instant,
    last_accessed: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct QuoteCacheStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
}

impl QuoteCache {
    pub fn new(cfg: QuoteCacheConfig) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            cfg,
            stats: Arc::new(RwLock::new(QuoteCacheStats::default())),
        }
    }

    /// Fetch a live quote for these trade parameters. Expired entries are
    /// evicted on the way out and count as misses.
    pub fn get(&self, request: &QuoteRequest) -> Option<Quote> {
        self.get_with_ttl(request, self.cfg.default_ttl_ms)
    }

    pub fn get_with_ttl(&self, request: &QuoteRequest, ttl_ms: u64) -> Option<Quote> {
        let now = Instant::now();
        {
            let mut stats = self.stats.write();
            stats.total_requests += 1;
        }

        let mut buckets = self.buckets.write();
        let hit = match buckets.get_mut(&ttl_ms) {
            Some(bucket) => match bucket.entries.get_mut(request) {
                Some(entry) if entry.expires_at > now => {
                    entry.last_accessed = now;
                    Some(entry.quote.clone())
                }
                Some(_) => {
                    bucket.entries.remove(request);
                    None
                }
                None => None,
            },
            None => None,
        };
        drop(buckets);

        let mut stats = self.stats.write();
        if hit.is_some() {
            stats.cache_hits += 1;
        } else {
            stats.cache_misses += 1;
            debug!(input = %request.input_mint, output = %request.output_mint, "quote cache miss");
        }
        hit
    }

    /// Store a quote, refreshing expiry for an existing key.
    pub fn insert(&self, request: QuoteRequest, quote: Quote) {
        self.insert_with_ttl(request, quote, self.cfg.default_ttl_ms)
    }

    pub fn insert_with_ttl(&self, request: QuoteRequest, quote: Quote, ttl_ms: u64) {
        let now = Instant::now();
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(ttl_ms).or_insert_with(|| Bucket {
            ttl: Duration::from_millis(ttl_ms),
            entries: HashMap::new(),
        });

        if bucket.entries.len() >= self.cfg.max_entries && !bucket.entries.contains_key(&request) {
            if let Some(lru_key) = bucket
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone())
            {
                bucket.entries.remove(&lru_key);
                self.stats.write().evictions += 1;
            }
        }

        bucket.entries.insert(
            request,
            CacheEntry { quote, expires_at: now + bucket.ttl, last_accessed: now },
        );
    }

    /// Drop every expired entry across all buckets.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.write();
        for bucket in buckets.values_mut() {
            bucket.entries.retain(|_, e| e.expires_at > now);
        }
    }

    pub fn stats(&self) -> QuoteCacheStats {
        self.stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quote_provider::SwapMode;
    use crate::session_cache::now_ms;

    fn request(amount: u64) -> QuoteRequest {
        QuoteRequest {
            input_mint: "So11111111111111111111111111111111111111112".to_string(),
            output_mint: "MINT".to_string(),
            amount,
            slippage_bps: 50,
            mode: SwapMode::ExactIn,
        }
    }

    fn quote(amount: u64) -> Quote {
        Quote {
            input_mint: "So11111111111111111111111111111111111111112".to_string(),
            output_mint: "MINT".to_string(),
            in_amount: amount,
            out_amount: amount * 2,
            price_impact_pct: 0.5,
            slippage_bps: 50,
            mode: SwapMode::ExactIn,
            raw: serde_json::json!({}),
            fetched_at_ms: now_ms(),
            latency_ms: 5,
        }
    }

    #[test]
    fn miss_then_insert_then_hit() {
        let cache = QuoteCache::new(QuoteCacheConfig::default());
        assert!(cache.get(&request(100)).is_none());

        cache.insert(request(100), quote(100));
        assert!(cache.get(&request(100)).is_some());

        let stats = cache.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let cache = QuoteCache::new(QuoteCacheConfig::default());
        cache.insert_with_ttl(request(100), quote(100), 0);
        assert!(cache.get_with_ttl(&request(100), 0).is_none());
        assert_eq!(cache.stats().cache_misses, 1);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = QuoteCache::new(QuoteCacheConfig { default_ttl_ms: 60_000, max_entries: 2 });
        cache.insert(request(1), quote(1));
        cache.insert(request(2), quote(2));

        // Touch request(1) so request(2) is the LRU.
        assert!(cache.get(&request(1)).is_some());
        cache.insert(request(3), quote(3));

        assert!(cache.get(&request(2)).is_none());
        assert!(cache.get(&request(1)).is_some());
        assert!(cache.get(&request(3)).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn ttl_buckets_are_independent() {
        let cache = QuoteCache::new(QuoteCacheConfig::default());
        cache.insert_with_ttl(request(1), quote(1), 400);
        cache.insert_with_ttl(request(1), quote(1), 800);
        assert!(cache.get_with_ttl(&request(1), 400).is_some());
        assert!(cache.get_with_ttl(&request(1), 800).is_some());
        assert!(cache.get_with_ttl(&request(1), 600).is_none());
    }
}
