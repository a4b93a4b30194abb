use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::error::{AmlError, Result};

use super::snapshot::Snapshot;
use super::store::GraphStore;
use super::types::{
    Address, AddressRecord, Alert, AlertType, Counterparty, Direction, StructuralFeatures,
    Transaction, Transfer,
};

#[derive(Default)]
struct GraphState {
    addresses: HashMap<Address, AddressRecord>,
    transactions: HashMap<String, Transaction>,
    /// address -> hashes of transactions touching it
    tx_index: HashMap<Address, Vec<String>>,
    transfers: HashMap<(Address, Address), Transfer>,
    alerts: Vec<Alert>,
}

impl GraphState {
    fn transfers_of(&self, address: &Address, direction: Direction) -> Vec<Transfer> {
        let mut edges: Vec<Transfer> = self
            .transfers
            .values()
            .filter(|t| match direction {
                Direction::Outgoing => &t.source == address,
                Direction::Incoming => &t.destination == address,
            })
            .cloned()
            .collect();
        edges.sort_by(|a, b| b.value_sum.total_cmp(&a.value_sum));
        edges
    }

    fn transactions_of(
        &self,
        address: &Address,
        direction: Direction,
        until: DateTime<Utc>,
    ) -> Vec<Transaction> {
        let mut txs: Vec<Transaction> = self
            .tx_index
            .get(address)
            .into_iter()
            .flatten()
            .filter_map(|hash| self.transactions.get(hash))
            .filter(|tx| match direction {
                Direction::Outgoing => &tx.from == address,
                Direction::Incoming => &tx.to == address,
            })
            .filter(|tx| tx.timestamp <= until)
            .cloned()
            .collect();
        txs.sort_by_key(|tx| (tx.timestamp, tx.block, tx.nonce));
        txs
    }

    fn touch(&mut self, address: &Address, ts: DateTime<Utc>) -> &mut AddressRecord {
        let record = self
            .addresses
            .entry(address.clone())
            .or_insert_with(|| AddressRecord::new(address.clone(), ts));
        if ts < record.first_seen {
            record.first_seen = ts;
        }
        if ts > record.last_seen {
            record.last_seen = ts;
        }
        record
    }

    /// Record for `address`, created on first use without moving its seen range.
    fn ensure(&mut self, address: &Address) -> &mut AddressRecord {
        self.addresses
            .entry(address.clone())
            .or_insert_with(|| AddressRecord::new(address.clone(), Utc::now()))
    }
}

/// In-process [`GraphStore`]. Used when no database is configured and by tests.
#[derive(Default)]
pub struct MemoryGraph {
    state: RwLock<GraphState>,
    unavailable: AtomicBool,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `StoreUnavailable` while set.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, GraphState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AmlError::StoreUnavailable("memory graph offline".into()));
        }
        self.state
            .read()
            .map_err(|_| AmlError::StoreUnavailable("memory graph lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, GraphState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AmlError::StoreUnavailable("memory graph offline".into()));
        }
        self.state
            .write()
            .map_err(|_| AmlError::StoreUnavailable("memory graph lock poisoned".into()))
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn get_address(&self, address: &Address) -> Result<Option<AddressRecord>> {
        Ok(self.read()?.addresses.get(address).cloned())
    }

    async fn upsert_address(&self, address: &Address, seen: DateTime<Utc>) -> Result<()> {
        self.write()?
            .addresses
            .entry(address.clone())
            .or_insert_with(|| AddressRecord::new(address.clone(), seen));
        Ok(())
    }

    async fn record_transaction(&self, tx: &Transaction) -> Result<bool> {
        let mut state = self.write()?;
        if state.transactions.contains_key(&tx.hash) {
            return Ok(false);
        }
        state.transactions.insert(tx.hash.clone(), tx.clone());
        state
            .tx_index
            .entry(tx.from.clone())
            .or_default()
            .push(tx.hash.clone());
        if tx.to != tx.from {
            state
                .tx_index
                .entry(tx.to.clone())
                .or_default()
                .push(tx.hash.clone());
        }

        state.touch(&tx.from, tx.timestamp).total_out += tx.value;
        state.touch(&tx.to, tx.timestamp).total_in += tx.value;

        let edge = state
            .transfers
            .entry((tx.from.clone(), tx.to.clone()))
            .or_insert_with(|| Transfer {
                source: tx.from.clone(),
                destination: tx.to.clone(),
                count: 0,
                value_sum: 0.0,
                last_timestamp: tx.timestamp,
            });
        edge.count += 1;
        edge.value_sum += tx.value;
        if tx.timestamp > edge.last_timestamp {
            edge.last_timestamp = tx.timestamp;
        }
        Ok(true)
    }

    async fn transactions(
        &self,
        address: &Address,
        direction: Direction,
        until: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        Ok(self.read()?.transactions_of(address, direction, until))
    }

    async fn transfers(&self, address: &Address, direction: Direction) -> Result<Vec<Transfer>> {
        Ok(self.read()?.transfers_of(address, direction))
    }

    async fn get_counterparties(
        &self,
        address: &Address,
        min_value: f64,
        limit: usize,
    ) -> Result<Vec<Counterparty>> {
        let state = self.read()?;
        let mut totals: HashMap<Address, f64> = HashMap::new();
        for edge in state.transfers.values() {
            if edge.value_sum < min_value {
                continue;
            }
            let other = if &edge.source == address {
                &edge.destination
            } else if &edge.destination == address {
                &edge.source
            } else {
                continue;
            };
            if other == address {
                continue;
            }
            *totals.entry(other.clone()).or_default() += edge.value_sum;
        }
        let mut out: Vec<Counterparty> = totals
            .into_iter()
            .map(|(address, total_value)| Counterparty {
                address,
                total_value,
            })
            .collect();
        out.sort_by(|a, b| {
            b.total_value
                .total_cmp(&a.total_value)
                .then_with(|| a.address.cmp(&b.address))
        });
        out.truncate(limit);
        Ok(out)
    }

    async fn shortest_path(
        &self,
        from: &Address,
        to: &Address,
        max_hops: u32,
    ) -> Result<Option<Vec<Address>>> {
        let state = self.read()?;
        let mut neighbours: HashMap<&Address, Vec<&Address>> = HashMap::new();
        for edge in state.transfers.values() {
            neighbours.entry(&edge.source).or_default().push(&edge.destination);
            neighbours.entry(&edge.destination).or_default().push(&edge.source);
        }

        let mut parent: HashMap<&Address, &Address> = HashMap::new();
        let mut seen: HashSet<&Address> = HashSet::from([from]);
        let mut queue: VecDeque<(&Address, u32)> = VecDeque::from([(from, 0)]);
        while let Some((node, hops)) = queue.pop_front() {
            if node == to {
                let mut path = vec![node.clone()];
                let mut cursor = node;
                while let Some(prev) = parent.get(cursor) {
                    path.push((*prev).clone());
                    cursor = prev;
                }
                path.reverse();
                return Ok(Some(path));
            }
            if hops >= max_hops {
                continue;
            }
            for &next in neighbours.get(node).into_iter().flatten() {
                if seen.insert(next) {
                    parent.insert(next, node);
                    queue.push_back((next, hops + 1));
                }
            }
        }
        Ok(None)
    }

    async fn find_alerts(
        &self,
        address: Option<&Address>,
        types: &[AlertType],
        min_score: f64,
    ) -> Result<Vec<Alert>> {
        Ok(self
            .read()?
            .alerts
            .iter()
            .filter(|a| address.is_none_or(|addr| &a.address == addr))
            .filter(|a| types.is_empty() || types.contains(&a.alert_type))
            .filter(|a| a.score >= min_score)
            .cloned()
            .collect())
    }

    async fn write_alert(
        &self,
        address: &Address,
        alert_type: AlertType,
        score: f64,
        details: JsonValue,
    ) -> Result<Option<Alert>> {
        let mut state = self.write()?;
        let duplicate = state.alerts.iter().any(|a| {
            &a.address == address && a.alert_type == alert_type && a.details == details
        });
        if duplicate {
            return Ok(None);
        }
        let now = Utc::now();
        state.ensure(address);
        let alert = Alert {
            address: address.clone(),
            alert_type,
            score,
            details,
            created_at: now,
        };
        state.alerts.push(alert.clone());
        Ok(Some(alert))
    }

    async fn write_risk_score(&self, address: &Address, score: f64) -> Result<()> {
        self.write()?.ensure(address).risk_score = Some(score);
        Ok(())
    }

    async fn read_structural_features(&self, address: &Address) -> Result<StructuralFeatures> {
        Ok(self
            .read()?
            .addresses
            .get(address)
            .and_then(|r| r.features.clone())
            .unwrap_or_default())
    }

    async fn write_structural_features(
        &self,
        address: &Address,
        features: &StructuralFeatures,
    ) -> Result<()> {
        self.write()?.ensure(address).features = Some(features.clone());
        Ok(())
    }

    async fn latest_block(&self) -> Result<Option<u64>> {
        Ok(self.read()?.transactions.values().map(|tx| tx.block).max())
    }

    async fn large_transactions(
        &self,
        from_block: u64,
        to_block: u64,
        min_value: f64,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        let state = self.read()?;
        let mut txs: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| tx.block >= from_block && tx.block <= to_block && tx.value >= min_value)
            .cloned()
            .collect();
        txs.sort_by(|a, b| b.value.total_cmp(&a.value).then_with(|| a.hash.cmp(&b.hash)));
        txs.truncate(limit);
        Ok(txs)
    }

    /// One read lock for the whole snapshot so concurrent ingestion cannot skew it.
    async fn snapshot(
        &self,
        address: &Address,
        as_of: DateTime<Utc>,
        hops: u32,
        edge_limit: usize,
    ) -> Result<Snapshot> {
        let state = self.read()?;
        let edges_out = state.transfers_of(address, Direction::Outgoing);

        let mut reachable = Vec::new();
        let mut seen: HashSet<Address> = HashSet::from([address.clone()]);
        let mut frontier: VecDeque<(Address, u32)> = VecDeque::from([(address.clone(), 0)]);
        while let Some((node, depth)) = frontier.pop_front() {
            if depth >= hops || reachable.len() >= edge_limit {
                continue;
            }
            for edge in state.transfers_of(&node, Direction::Outgoing) {
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
            record: state.addresses.get(address).cloned(),
            incoming: state.transactions_of(address, Direction::Incoming, as_of),
            outgoing: state.transactions_of(address, Direction::Outgoing, as_of),
            edges_in: state.transfers_of(address, Direction::Incoming),
            edges_out,
            reachable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn tx(hash: &str, from: &str, to: &str, value: f64, secs: i64) -> Transaction {
        Transaction {
            hash: hash.to_string(),
            from: addr(from),
            to: addr(to),
            value,
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            block: 100 + secs as u64,
            nonce: 0,
        }
    }

    #[tokio::test]
    async fn transfer_aggregate_equals_sum_of_transactions() {
        let g = MemoryGraph::new();
        g.record_transaction(&tx("h1", "a", "b", 1.5, 0)).await.unwrap();
        g.record_transaction(&tx("h2", "a", "b", 2.25, 10)).await.unwrap();
        g.record_transaction(&tx("h3", "b", "a", 9.0, 20)).await.unwrap();
        // duplicate hash is ignored
        assert!(!g.record_transaction(&tx("h2", "a", "b", 2.25, 10)).await.unwrap());

        let out = g.transfers(&addr("a"), Direction::Outgoing).await.unwrap();
        assert_eq!(out.len(), 1);
        let raw: f64 = g
            .transactions(&addr("a"), Direction::Outgoing, Utc::now())
            .await
            .unwrap()
            .iter()
            .filter(|t| t.to == addr("b"))
            .map(|t| t.value)
            .sum();
        assert_eq!(out[0].count, 2);
        assert_eq!(out[0].value_sum, raw);
        assert_eq!(out[0].last_timestamp, Utc.timestamp_opt(1_700_000_010, 0).unwrap());

        let a = g.get_address(&addr("a")).await.unwrap().unwrap();
        assert_eq!(a.total_out, 3.75);
        assert_eq!(a.total_in, 9.0);
        assert_eq!(a.last_seen - a.first_seen, Duration::seconds(20));
    }

    #[tokio::test]
    async fn duplicate_alerts_are_not_appended() {
        let g = MemoryGraph::new();
        let a = addr("a");
        let first = g
            .write_alert(&a, AlertType::Structuring, 24.0, json!({"count": 6}))
            .await
            .unwrap();
        assert!(first.is_some());
        let again = g
            .write_alert(&a, AlertType::Structuring, 24.0, json!({"count": 6}))
            .await
            .unwrap();
        assert!(again.is_none());
        let newer = g
            .write_alert(&a, AlertType::Structuring, 28.0, json!({"count": 7}))
            .await
            .unwrap();
        assert!(newer.is_some());
        assert_eq!(g.find_alerts(Some(&a), &[], 0.0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn shortest_path_respects_hop_bound() {
        let g = MemoryGraph::new();
        g.record_transaction(&tx("1", "a", "b", 1.0, 0)).await.unwrap();
        g.record_transaction(&tx("2", "c", "b", 1.0, 1)).await.unwrap();
        g.record_transaction(&tx("3", "c", "d", 1.0, 2)).await.unwrap();

        let path = g.shortest_path(&addr("a"), &addr("d"), 3).await.unwrap().unwrap();
        assert_eq!(path, vec![addr("a"), addr("b"), addr("c"), addr("d")]);
        assert!(g.shortest_path(&addr("a"), &addr("d"), 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn counterparties_are_ranked_by_value() {
        let g = MemoryGraph::new();
        g.record_transaction(&tx("1", "a", "b", 1.0, 0)).await.unwrap();
        g.record_transaction(&tx("2", "c", "a", 5.0, 1)).await.unwrap();
        g.record_transaction(&tx("3", "a", "d", 0.1, 2)).await.unwrap();

        let cps = g.get_counterparties(&addr("a"), 0.5, 10).await.unwrap();
        let names: Vec<&str> = cps.iter().map(|c| c.address.as_str()).collect();
        assert_eq!(names, vec!["c", "b"]);
        assert_eq!(g.get_counterparties(&addr("a"), 0.5, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let g = MemoryGraph::new();
        g.set_available(false);
        let err = g.get_address(&addr("a")).await.unwrap_err();
        assert!(matches!(err, AmlError::StoreUnavailable(_)));
        g.set_available(true);
        assert!(g.get_address(&addr("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_hides_transactions_after_as_of() {
        let g = MemoryGraph::new();
        g.record_transaction(&tx("1", "a", "b", 1.0, 0)).await.unwrap();
        g.record_transaction(&tx("2", "a", "b", 1.0, 100)).await.unwrap();
        let as_of = Utc.timestamp_opt(1_700_000_050, 0).unwrap();
        let snap = g.snapshot(&addr("a"), as_of, 3, 100).await.unwrap();
        assert_eq!(snap.outgoing.len(), 1);
        assert_eq!(snap.edges_out.len(), 1);
    }
}
