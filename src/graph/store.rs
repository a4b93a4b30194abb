use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::error::Result;

use super::snapshot::Snapshot;
use super::types::{
    Address, AddressRecord, Alert, AlertType, Counterparty, Direction, StructuralFeatures,
    Transaction, Transfer,
};

/// Read/write port onto the transaction graph.
///
/// Implemented by [`PgGraphStore`](super::postgres::PgGraphStore) and
/// [`MemoryGraph`](super::memory::MemoryGraph). Every method maps an
/// unreachable backend to `AmlError::StoreUnavailable`.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn get_address(&self, address: &Address) -> Result<Option<AddressRecord>>;

    /// Create the address if it is not known yet. Existing records are left untouched.
    async fn upsert_address(&self, address: &Address, seen: DateTime<Utc>) -> Result<()>;

    /// Merge one raw transaction: write-once by hash, then update both
    /// endpoint addresses and the aggregated edge. Returns false when the
    /// hash was already recorded.
    async fn record_transaction(&self, tx: &Transaction) -> Result<bool>;

    /// Raw transactions touching `address` in one direction with `timestamp <= until`.
    async fn transactions(
        &self,
        address: &Address,
        direction: Direction,
        until: DateTime<Utc>,
    ) -> Result<Vec<Transaction>>;

    async fn transfers(&self, address: &Address, direction: Direction) -> Result<Vec<Transfer>>;

    /// Counterparties in either direction whose aggregated value is at least
    /// `min_value`, ordered by total value descending.
    async fn get_counterparties(
        &self,
        address: &Address,
        min_value: f64,
        limit: usize,
    ) -> Result<Vec<Counterparty>>;

    /// Shortest undirected path from `from` to `to` of at most `max_hops` edges.
    async fn shortest_path(
        &self,
        from: &Address,
        to: &Address,
        max_hops: u32,
    ) -> Result<Option<Vec<Address>>>;

    /// Alerts matching every given filter. An empty `types` slice matches all types.
    async fn find_alerts(
        &self,
        address: Option<&Address>,
        types: &[AlertType],
        min_score: f64,
    ) -> Result<Vec<Alert>>;

    /// Append an alert unless an identical one (address, type, details) exists.
    /// Returns the alert when it was newly appended.
    async fn write_alert(
        &self,
        address: &Address,
        alert_type: AlertType,
        score: f64,
        details: JsonValue,
    ) -> Result<Option<Alert>>;

    async fn write_risk_score(&self, address: &Address, score: f64) -> Result<()>;

    async fn read_structural_features(&self, address: &Address) -> Result<StructuralFeatures>;

    async fn write_structural_features(
        &self,
        address: &Address,
        features: &StructuralFeatures,
    ) -> Result<()>;

    /// Highest block height recorded, if any transaction is stored.
    async fn latest_block(&self) -> Result<Option<u64>>;

    /// Transactions in `[from_block, to_block]` with `value >= min_value`, largest first.
    async fn large_transactions(
        &self,
        from_block: u64,
        to_block: u64,
        min_value: f64,
        limit: usize,
    ) -> Result<Vec<Transaction>>;

    /// Everything the detectors need for one address, read at one point in time.
    ///
    /// The default implementation composes the individual reads; backends
    /// override it to read inside a single transaction or lock.
    async fn snapshot(
        &self,
        address: &Address,
        as_of: DateTime<Utc>,
        hops: u32,
        edge_limit: usize,
    ) -> Result<Snapshot> {
        let record = self.get_address(address).await?;
        let incoming = self.transactions(address, Direction::Incoming, as_of).await?;
        let outgoing = self.transactions(address, Direction::Outgoing, as_of).await?;
        let edges_in = self.transfers(address, Direction::Incoming).await?;
        let edges_out = self.transfers(address, Direction::Outgoing).await?;

        // Breadth-first walk of outgoing edges
        let mut reachable = Vec::new();
        let mut seen: HashSet<Address> = HashSet::from([address.clone()]);
        let mut frontier: VecDeque<(Address, u32)> = VecDeque::from([(address.clone(), 0)]);
        while let Some((node, depth)) = frontier.pop_front() {
            if depth >= hops || reachable.len() >= edge_limit {
                continue;
            }
            let edges = if &node == address {
                edges_out.clone()
            } else {
                self.transfers(&node, Direction::Outgoing).await?
            };
            for edge in edges {
                if reachable.len() >= edge_limit {
                    break;
                }
                if seen.insert(edge.destination.clone()) {
                    frontier.push_back((edge.destination.clone(), depth + 1));
                }
                reachable.push(edge);
            }
        }

        Ok(Snapshot {
            address: address.clone(),
            as_of,
            record,
            incoming,
            outgoing,
            edges_in,
            edges_out,
            reachable,
        })
    }
}
