use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{AmlError, Result};

/// USD price of one native unit.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn usd_price(&self) -> Result<f64>;
}

/// A price that never changes.
pub struct FixedPrice(pub f64);

#[async_trait]
impl PriceFeed for FixedPrice {
    async fn usd_price(&self) -> Result<f64> {
        Ok(self.0)
    }
}

/// CoinGecko `simple/price` endpoint, e.g.
/// `https://api.coingecko.com/api/v3/simple/price?ids=ethereum&vs_currencies=usd`.
pub struct CoinGeckoPrice {
    client: reqwest::Client,
    url: String,
}

impl CoinGeckoPrice {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AmlError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

/// Pull `usd` out of the first coin object of a `simple/price` body.
pub fn parse_simple_price(body: &JsonValue) -> Option<f64> {
    body.as_object()?
        .values()
        .next()?
        .get("usd")?
        .as_f64()
        .filter(|p| p.is_finite() && *p > 0.0)
}

#[async_trait]
impl PriceFeed for CoinGeckoPrice {
    async fn usd_price(&self) -> Result<f64> {
        let failed = |reason: String| AmlError::IngestionFailed {
            address: "price".into(),
            reason,
        };
        let body: JsonValue = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| failed(e.to_string()))?
            .json()
            .await
            .map_err(|e| failed(e.to_string()))?;
        parse_simple_price(&body).ok_or_else(|| failed(format!("no usd price in {}", body)))
    }
}

/// Refreshes the inner feed at most once per `ttl`. Never fails: on error it
/// keeps serving the last good price, or `fallback` if there never was one.
pub struct CachedPrice {
    inner: Box<dyn PriceFeed>,
    ttl: Duration,
    fallback: f64,
    cached: Mutex<Option<(Instant, f64)>>,
}

impl CachedPrice {
    pub fn new(inner: Box<dyn PriceFeed>, ttl: Duration, fallback: f64) -> Self {
        Self {
            inner,
            ttl,
            fallback,
            cached: Mutex::new(None),
        }
    }

    pub async fn price(&self) -> f64 {
        let mut cached = self.cached.lock().await;
        if let Some((at, price)) = *cached {
            if at.elapsed() < self.ttl {
                return price;
            }
        }

        match self.inner.usd_price().await {
            Ok(price) => {
                tracing::debug!(price, "Unit price refreshed");
                *cached = Some((Instant::now(), price));
                price
            }
            Err(e) => {
                let stale = cached.map(|(_, p)| p).unwrap_or(self.fallback);
                tracing::warn!(error = %e, price = stale, "Price refresh failed, using last known price");
                stale
            }
        }
    }
}
