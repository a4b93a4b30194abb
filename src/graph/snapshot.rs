use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::types::{Address, AddressRecord, Transaction, Transfer};

/// Read-only, point-in-time view of one address and its outgoing neighbourhood.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub address: Address,
    pub as_of: DateTime<Utc>,
    pub record: Option<AddressRecord>,
    /// Raw transactions received by the address, `timestamp <= as_of`.
    pub incoming: Vec<Transaction>,
    /// Raw transactions emitted by the address, `timestamp <= as_of`.
    pub outgoing: Vec<Transaction>,
    pub edges_in: Vec<Transfer>,
    pub edges_out: Vec<Transfer>,
    /// Outgoing edges reachable from the address within the snapshot's hop bound.
    pub reachable: Vec<Transfer>,
}

impl Snapshot {
    pub fn empty(address: Address, as_of: DateTime<Utc>) -> Self {
        Self {
            address,
            as_of,
            record: None,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            edges_in: Vec::new(),
            edges_out: Vec::new(),
            reachable: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty()
            && self.outgoing.is_empty()
            && self.edges_in.is_empty()
            && self.edges_out.is_empty()
    }

    /// Reachable edges grouped by source.
    pub fn adjacency(&self) -> HashMap<&Address, Vec<&Transfer>> {
        let mut adj: HashMap<&Address, Vec<&Transfer>> = HashMap::new();
        for edge in &self.reachable {
            adj.entry(&edge.source).or_default().push(edge);
        }
        adj
    }

    /// Every simple directed path (no repeated node) starting at the address,
    /// of `1..=max_len` edges. Stops collecting after `cap` paths.
    pub fn simple_paths(&self, max_len: usize, cap: usize) -> Vec<Vec<&Transfer>> {
        let adj = self.adjacency();
        let mut out = Vec::new();
        let mut path: Vec<&Transfer> = Vec::new();
        let mut on_path: Vec<&Address> = vec![&self.address];
        walk(&adj, &self.address, max_len, cap, &mut path, &mut on_path, &mut out);
        out
    }

    /// Number of simple directed cycles of `min_len..=max_len` edges that
    /// leave the address and return to it. At most `path_cap` partial paths
    /// are explored.
    pub fn count_cycles(&self, min_len: usize, max_len: usize, path_cap: usize) -> usize {
        let adj = self.adjacency();
        let mut on_path: Vec<&Address> = vec![&self.address];
        let mut budget = path_cap;
        count_returns(
            &adj,
            &self.address,
            &self.address,
            0,
            (min_len, max_len),
            &mut on_path,
            &mut budget,
        )
    }
}

fn count_returns<'a>(
    adj: &HashMap<&'a Address, Vec<&'a Transfer>>,
    origin: &Address,
    node: &'a Address,
    len: usize,
    (min_len, max_len): (usize, usize),
    on_path: &mut Vec<&'a Address>,
    budget: &mut usize,
) -> usize {
    let Some(edges) = adj.get(node) else { return 0 };
    let mut count = 0;
    for &edge in edges.iter() {
        if &edge.destination == origin {
            if len + 1 >= min_len && len + 1 <= max_len {
                count += 1;
            }
            continue;
        }
        if len + 1 >= max_len || on_path.contains(&&edge.destination) {
            continue;
        }
        if *budget == 0 {
            break;
        }
        *budget -= 1;
        on_path.push(&edge.destination);
        count += count_returns(
            adj,
            origin,
            &edge.destination,
            len + 1,
            (min_len, max_len),
            on_path,
            budget,
        );
        on_path.pop();
    }
    count
}

fn walk<'a>(
    adj: &HashMap<&'a Address, Vec<&'a Transfer>>,
    node: &'a Address,
    max_len: usize,
    cap: usize,
    path: &mut Vec<&'a Transfer>,
    on_path: &mut Vec<&'a Address>,
    out: &mut Vec<Vec<&'a Transfer>>,
) {
    if path.len() >= max_len || out.len() >= cap {
        return;
    }
    let Some(edges) = adj.get(node) else { return };
    for &edge in edges.iter() {
        if on_path.contains(&&edge.destination) {
            continue;
        }
        path.push(edge);
        on_path.push(&edge.destination);
        out.push(path.clone());
        walk(adj, &edge.destination, max_len, cap, path, on_path, out);
        path.pop();
        on_path.pop();
        if out.len() >= cap {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn edge(from: &str, to: &str, value: f64) -> Transfer {
        Transfer {
            source: addr(from),
            destination: addr(to),
            count: 1,
            value_sum: value,
            last_timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn snapshot(edges: Vec<Transfer>) -> Snapshot {
        let mut snap = Snapshot::empty(addr("a"), Utc::now());
        snap.edges_out = edges.iter().filter(|e| e.source == snap.address).cloned().collect();
        snap.reachable = edges;
        snap
    }

    #[test]
    fn triangle_counts_as_one_cycle() {
        let snap = snapshot(vec![edge("a", "b", 1.0), edge("b", "c", 1.0), edge("c", "a", 1.0)]);
        assert_eq!(snap.count_cycles(2, 4, 100), 1);
    }

    #[test]
    fn back_and_forth_is_a_two_cycle() {
        let snap = snapshot(vec![edge("a", "b", 1.0), edge("b", "a", 1.0)]);
        assert_eq!(snap.count_cycles(2, 4, 100), 1);
        assert_eq!(snap.count_cycles(3, 4, 100), 0);
    }

    #[test]
    fn cycles_longer_than_bound_are_ignored() {
        let snap = snapshot(vec![
            edge("a", "b", 1.0),
            edge("b", "c", 1.0),
            edge("c", "d", 1.0),
            edge("d", "e", 1.0),
            edge("e", "a", 1.0),
        ]);
        assert_eq!(snap.count_cycles(2, 4, 100), 0);
        assert_eq!(snap.count_cycles(2, 5, 100), 1);
    }

    #[test]
    fn simple_paths_never_repeat_a_node() {
        let snap = snapshot(vec![edge("a", "b", 1.0), edge("b", "a", 1.0), edge("b", "c", 1.0)]);
        let paths = snap.simple_paths(5, 100);
        // a->b, a->b->c ; a->b->a is rejected
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.len() <= 2));
    }

    #[test]
    fn cycle_search_stops_at_path_cap() {
        let snap = snapshot(vec![edge("a", "b", 1.0), edge("b", "c", 1.0), edge("c", "a", 1.0)]);
        assert_eq!(snap.count_cycles(2, 4, 2), 1);
        assert_eq!(snap.count_cycles(2, 4, 1), 0);
    }
}
