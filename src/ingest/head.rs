use std::sync::Arc;

use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use async_trait::async_trait;

use crate::error::{AmlError, Result};
use crate::graph::store::GraphStore;

use super::retry_rpc;

/// Source of the current chain head height.
#[async_trait]
pub trait BlockHead: Send + Sync {
    /// `None` when no block is known yet.
    async fn current_block(&self) -> Result<Option<u64>>;
}

/// Head taken from the highest block already in the graph store.
pub struct StoreHead {
    store: Arc<dyn GraphStore>,
}

impl StoreHead {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BlockHead for StoreHead {
    async fn current_block(&self) -> Result<Option<u64>> {
        self.store.latest_block().await
    }
}

/// Head read from a JSON-RPC node.
pub struct RpcHead {
    provider: DynProvider,
}

impl RpcHead {
    pub fn connect(rpc_http: &str) -> Result<Self> {
        let url = rpc_http
            .parse()
            .map_err(|e| AmlError::Config(format!("Invalid RPC URL '{}': {}", rpc_http, e)))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self { provider })
    }
}

#[async_trait]
impl BlockHead for RpcHead {
    async fn current_block(&self) -> Result<Option<u64>> {
        let block = retry_rpc("get_block_number", || self.provider.get_block_number())
            .await
            .map_err(|e| AmlError::IngestionFailed {
                address: "chain head".into(),
                reason: e.to_string(),
            })?;
        Ok(Some(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::memory::MemoryGraph;
    use crate::graph::types::{Address, Transaction};
    use chrono::Utc;

    #[tokio::test]
    async fn store_head_tracks_highest_block() {
        let store = Arc::new(MemoryGraph::new());
        let head = StoreHead::new(store.clone());
        assert_eq!(head.current_block().await.unwrap(), None);

        for (hash, block) in [("h1", 90u64), ("h2", 120), ("h3", 100)] {
            store
                .record_transaction(&Transaction {
                    hash: hash.into(),
                    from: Address::parse("a").unwrap(),
                    to: Address::parse("b").unwrap(),
                    value: 1.0,
                    timestamp: Utc::now(),
                    block,
                    nonce: 0,
                })
                .await
                .unwrap();
        }
        assert_eq!(head.current_block().await.unwrap(), Some(120));
    }

    #[test]
    fn bad_rpc_url_is_a_config_error() {
        assert!(matches!(RpcHead::connect("not a url"), Err(AmlError::Config(_))));
    }
}
