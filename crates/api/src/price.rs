//! Token price lookups with a TTL cache.
//!
//! Prices are best-effort. `PriceOracle` never fails: on a feed error or
//! timeout it serves the last known price regardless of age, and falls back
//! to a neutral 1.0 when it has never seen the token.

use alloy::primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Price used when nothing better is known.
pub const NEUTRAL_PRICE: f64 = 1.0;

/// External USD price source.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// USD prices for `tokens`. Tokens the feed doesn't know are omitted.
    async fn fetch_usd(&self, tokens: &[Address]) -> Result<HashMap<Address, f64>>;
}

/// CoinGecko-compatible `simple/token_price` client.
#[derive(Debug, Clone)]
pub struct CoinGeckoClient {
    client: reqwest::Client,
    base_url: String,
    platform: String,
}

impl CoinGeckoClient {
    pub fn new(base_url: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            platform: platform.into(),
        }
    }
}

/// `{ "0xabc…": { "usd": 1.23 } }`
type TokenPriceResponse = HashMap<String, HashMap<String, f64>>;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

fn parse_token_prices(body: TokenPriceResponse) -> HashMap<Address, f64> {
    body.into_iter()
        .filter_map(|(token, quotes)| {
            let address = token.parse::<Address>().ok()?;
            let usd = quotes.get("usd").copied()?;
            usd.is_finite().then_some((address, usd))
        })
        .collect()
}

#[async_trait]
impl PriceFeed for CoinGeckoClient {
    #[instrument(skip(self), fields(count = tokens.len()))]
    async fn fetch_usd(&self, tokens: &[Address]) -> Result<HashMap<Address, f64>> {
        if tokens.is_empty() {
            return Ok(HashMap::new());
        }

        let url = format!("{}/simple/token_price/{}", self.base_url, self.platform);
        let addresses = tokens
            .iter()
            .map(|t| format!("{:#x}", t))
            .collect::<Vec<_>>()
            .join(",");

        let response = self
            .client
            .get(&url)
            .query(&[("contract_addresses", addresses.as_str()), ("vs_currencies", "usd")])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            anyhow::bail!("Price API error: {} - {}", status, message);
        }

        let body: TokenPriceResponse = response.json().await?;
        let prices = parse_token_prices(body);
        debug!(requested = tokens.len(), returned = prices.len(), "Fetched token prices");
        Ok(prices)
    }
}

/// Where a quote came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    /// Within TTL, no request made
    Cache,
    /// Fetched during this call
    Fresh,
    /// Feed failed; last known price past its TTL
    Stale,
    /// Feed failed and no price was ever seen
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub usd: f64,
    pub source: PriceSource,
}

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    usd: f64,
    fetched_at: Instant,
}

/// Cached price adapter.
pub struct PriceOracle {
    feed: Arc<dyn PriceFeed>,
    cache: DashMap<Address, CachedPrice>,
    ttl: Duration,
    timeout: Duration,
}

impl PriceOracle {
    pub fn new(feed: Arc<dyn PriceFeed>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            feed,
            cache: DashMap::new(),
            ttl,
            timeout,
        }
    }

    /// Quote for a single token.
    pub async fn price(&self, token: Address) -> Quote {
        self.prices(&[token])
            .await
            .remove(&token)
            .unwrap_or(Quote {
                usd: NEUTRAL_PRICE,
                source: PriceSource::Neutral,
            })
    }

    /// Quotes for every token in `tokens`.
    pub async fn prices(&self, tokens: &[Address]) -> HashMap<Address, Quote> {
        let mut quotes = HashMap::with_capacity(tokens.len());
        let mut missing = Vec::new();

        for token in tokens {
            match self.cache.get(token) {
                Some(cached) if cached.fetched_at.elapsed() < self.ttl => {
                    quotes.insert(
                        *token,
                        Quote {
                            usd: cached.usd,
                            source: PriceSource::Cache,
                        },
                    );
                }
                _ => {
                    if !missing.contains(token) {
                        missing.push(*token);
                    }
                }
            }
        }

        if missing.is_empty() {
            return quotes;
        }

        let fetched = match tokio::time::timeout(self.timeout, self.feed.fetch_usd(&missing)).await {
            Ok(Ok(prices)) => prices,
            Ok(Err(e)) => {
                warn!(tokens = missing.len(), error = %e, "Price feed failed, using fallback");
                HashMap::new()
            }
            Err(_) => {
                warn!(
                    tokens = missing.len(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Price feed timed out, using fallback"
                );
                HashMap::new()
            }
        };

        let now = Instant::now();
        for token in missing {
            let quote = if let Some(usd) = fetched.get(&token).copied() {
                self.cache.insert(token, CachedPrice { usd, fetched_at: now });
                Quote {
                    usd,
                    source: PriceSource::Fresh,
                }
            } else if let Some(stale) = self.cache.get(&token) {
                Quote {
                    usd: stale.usd,
                    source: PriceSource::Stale,
                }
            } else {
                debug!(token = %token, "No price known, using neutral default");
                Quote {
                    usd: NEUTRAL_PRICE,
                    source: PriceSource::Neutral,
                }
            };
            quotes.insert(token, quote);
        }

        quotes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeFeed {
        prices: HashMap<Address, f64>,
        fail: AtomicBool,
        delay: Mutex<Option<Duration>>,
        calls: AtomicUsize,
    }

    impl FakeFeed {
        fn new(prices: &[(Address, f64)]) -> Self {
            Self {
                prices: prices.iter().copied().collect(),
                fail: AtomicBool::new(false),
                delay: Mutex::new(None),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl PriceFeed for FakeFeed {
        async fn fetch_usd(&self, tokens: &[Address]) -> Result<HashMap<Address, f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("HTTP 500");
            }
            Ok(tokens
                .iter()
                .filter_map(|t| self.prices.get(t).map(|p| (*t, *p)))
                .collect())
        }
    }

    const WBTC: Address = Address::repeat_byte(0x11);
    const WETH: Address = Address::repeat_byte(0x22);

    #[tokio::test]
    async fn test_fresh_then_cached() {
        let feed = Arc::new(FakeFeed::new(&[(WBTC, 60_000.0)]));
        let oracle = PriceOracle::new(feed.clone(), Duration::from_secs(60), Duration::from_secs(1));

        let first = oracle.price(WBTC).await;
        assert_eq!(first.source, PriceSource::Fresh);
        assert_eq!(first.usd, 60_000.0);

        let second = oracle.price(WBTC).await;
        assert_eq!(second.source, PriceSource::Cache);
        assert_eq!(feed.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_serves_stale_then_neutral() {
        let feed = Arc::new(FakeFeed::new(&[(WBTC, 60_000.0)]));
        let oracle = PriceOracle::new(feed.clone(), Duration::ZERO, Duration::from_secs(1));

        assert_eq!(oracle.price(WBTC).await.source, PriceSource::Fresh);

        feed.set_fail(true);
        let quotes = oracle.prices(&[WBTC, WETH]).await;
        assert_eq!(quotes[&WBTC].source, PriceSource::Stale);
        assert_eq!(quotes[&WBTC].usd, 60_000.0);
        assert_eq!(quotes[&WETH].source, PriceSource::Neutral);
        assert_eq!(quotes[&WETH].usd, NEUTRAL_PRICE);
    }

    #[tokio::test]
    async fn test_timeout_is_not_fatal() {
        let feed = Arc::new(FakeFeed::new(&[(WETH, 3_000.0)]));
        *feed.delay.lock().unwrap() = Some(Duration::from_millis(200));
        let oracle = PriceOracle::new(feed, Duration::from_secs(60), Duration::from_millis(10));

        let quote = oracle.price(WETH).await;
        assert_eq!(quote.source, PriceSource::Neutral);
    }

    #[test]
    fn test_parse_token_prices() {
        let body: TokenPriceResponse = serde_json::from_str(
            r#"{
                "0x1111111111111111111111111111111111111111": {"usd": 60000.5},
                "not-an-address": {"usd": 1.0},
                "0x2222222222222222222222222222222222222222": {"eur": 2.0}
            }"#,
        )
        .unwrap();
        let prices = parse_token_prices(body);
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[&WBTC], 60000.5);
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_coingecko_live() {
        let client = CoinGeckoClient::new("https://api.coingecko.com/api/v3", "ethereum");
        let weth: Address = "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2".parse().unwrap();
        let prices = client.fetch_usd(&[weth]).await.unwrap();
        assert!(prices.get(&weth).copied().unwrap_or_default() > 0.0);
    }
}
