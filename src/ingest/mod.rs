pub mod etherscan;
pub mod head;
pub mod price;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use crate::error::Result;
use crate::graph::store::GraphStore;
use crate::graph::types::{Address, Direction};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Transactions available for the address after the merge.
    pub ingested: usize,
}

/// Populates the graph store from an external ledger source.
#[async_trait]
pub trait Ingestor: Send + Sync {
    /// Fetch up to `limit` transactions touching `address` and merge them into the store.
    async fn fetch_and_merge(&self, address: &Address, limit: usize) -> Result<IngestReport>;
}

/// Recomputes structural features (pagerank, degree, communities, triangles)
/// for the whole graph and writes them through
/// [`GraphStore::write_structural_features`].
#[async_trait]
pub trait GraphAnalytics: Send + Sync {
    async fn refresh_features(&self) -> Result<()>;
}

/// Ingestor that fetches nothing and reports what the store already holds.
pub struct StoreOnlyIngestor {
    store: Arc<dyn GraphStore>,
}

impl StoreOnlyIngestor {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Ingestor for StoreOnlyIngestor {
    async fn fetch_and_merge(&self, address: &Address, limit: usize) -> Result<IngestReport> {
        let now = Utc::now();
        let incoming = self.store.transactions(address, Direction::Incoming, now).await?;
        let outgoing = self.store.transactions(address, Direction::Outgoing, now).await?;
        Ok(IngestReport {
            ingested: (incoming.len() + outgoing.len()).min(limit),
        })
    }
}

/// Retry an async operation with exponential backoff.
/// Handles transient provider errors (rate limits, network issues).
pub async fn retry_rpc<F, Fut, T, E>(what: &str, mut f: F) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = Duration::from_millis(500);
    let max_retries = 5;

    for attempt in 0..max_retries {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                tracing::warn!(
                    call = what,
                    attempt = attempt + 1,
                    max_retries,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Provider call failed, retrying..."
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }
        }
    }

    // Final attempt, error propagates to the caller
    f().await
}
