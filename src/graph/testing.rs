use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::error::{AmlError, Result};

use super::memory::MemoryGraph;
use super::snapshot::Snapshot;
use super::store::GraphStore;
use super::types::{
    Address, AddressRecord, Alert, AlertType, Counterparty, Direction, StructuralFeatures,
    Transaction, Transfer,
};

/// `MemoryGraph` whose snapshot of one address always fails with a
/// non-fatal error. Every other call passes through.
pub struct BrokenAddressGraph {
    pub inner: Arc<MemoryGraph>,
    pub broken: Address,
}

impl BrokenAddressGraph {
    pub fn new(inner: Arc<MemoryGraph>, broken: &str) -> Arc<Self> {
        Arc::new(Self {
            inner,
            broken: Address::parse(broken).unwrap(),
        })
    }
}

#[async_trait]
impl GraphStore for BrokenAddressGraph {
    async fn get_address(&self, address: &Address) -> Result<Option<AddressRecord>> {
        self.inner.get_address(address).await
    }

    async fn upsert_address(&self, address: &Address, seen: DateTime<Utc>) -> Result<()> {
        self.inner.upsert_address(address, seen).await
    }

    async fn record_transaction(&self, tx: &Transaction) -> Result<bool> {
        self.inner.record_transaction(tx).await
    }

    async fn transactions(
        &self,
        address: &Address,
        direction: Direction,
        until: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        self.inner.transactions(address, direction, until).await
    }

    async fn transfers(&self, address: &Address, direction: Direction) -> Result<Vec<Transfer>> {
        self.inner.transfers(address, direction).await
    }

    async fn get_counterparties(
        &self,
        address: &Address,
        min_value: f64,
        limit: usize,
    ) -> Result<Vec<Counterparty>> {
        self.inner.get_counterparties(address, min_value, limit).await
    }

    async fn shortest_path(
        &self,
        from: &Address,
        to: &Address,
        max_hops: u32,
    ) -> Result<Option<Vec<Address>>> {
        self.inner.shortest_path(from, to, max_hops).await
    }

    async fn find_alerts(
        &self,
        address: Option<&Address>,
        types: &[AlertType],
        min_score: f64,
    ) -> Result<Vec<Alert>> {
        self.inner.find_alerts(address, types, min_score).await
    }

    async fn write_alert(
        &self,
        address: &Address,
        alert_type: AlertType,
        score: f64,
        details: JsonValue,
    ) -> Result<Option<Alert>> {
        self.inner.write_alert(address, alert_type, score, details).await
    }

    async fn write_risk_score(&self, address: &Address, score: f64) -> Result<()> {
        self.inner.write_risk_score(address, score).await
    }

    async fn read_structural_features(&self, address: &Address) -> Result<StructuralFeatures> {
        self.inner.read_structural_features(address).await
    }

    async fn write_structural_features(
        &self,
        address: &Address,
        features: &StructuralFeatures,
    ) -> Result<()> {
        self.inner.write_structural_features(address, features).await
    }

    async fn latest_block(&self) -> Result<Option<u64>> {
        self.inner.latest_block().await
    }

    async fn large_transactions(
        &self,
        from_block: u64,
        to_block: u64,
        min_value: f64,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        self.inner
            .large_transactions(from_block, to_block, min_value, limit)
            .await
    }

    async fn snapshot(
        &self,
        address: &Address,
        as_of: DateTime<Utc>,
        hops: u32,
        edge_limit: usize,
    ) -> Result<Snapshot> {
        if address == &self.broken {
            return Err(AmlError::Validation(format!("unreadable address {}", address)));
        }
        self.inner.snapshot(address, as_of, hops, edge_limit).await
    }
}
