use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::CrawlerConfig;
use crate::engine::Engine;
use crate::error::{AmlError, Result};
use crate::graph::types::{Address, AlertType};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlStats {
    pub visited: usize,
    pub analyzed: usize,
    pub suspicious: usize,
    pub expanded: usize,
    pub enqueued: usize,
    pub skipped_empty: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuspiciousAddress {
    pub address: Address,
    pub depth: u32,
    pub quick_risk_score: f64,
    pub alerts: Vec<AlertType>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlResult {
    pub seeds: Vec<Address>,
    pub stats: CrawlStats,
    pub suspicious: Vec<SuspiciousAddress>,
    pub cancelled: bool,
}

enum Visit {
    Empty,
    Analyzed {
        quick_risk_score: f64,
        alerts: Vec<AlertType>,
    },
}

/// Breadth-first crawl from `seeds`, expanding only through addresses whose
/// quick risk score clears `min_risk_score_to_expand`.
///
/// One address failing is logged and skipped. A store outage ends the crawl
/// with an error.
pub async fn crawl(
    engine: &Engine,
    seeds: &[Address],
    params: &CrawlerConfig,
    cancel: &CancellationToken,
) -> Result<CrawlResult> {
    let tx_limit = engine.config.chain.tx_limit_per_address;
    let mut queue: VecDeque<(Address, u32)> = seeds.iter().map(|s| (s.clone(), 0)).collect();
    let mut visited: HashSet<Address> = HashSet::new();
    let mut stats = CrawlStats::default();
    let mut suspicious = Vec::new();
    let mut cancelled = false;

    tracing::info!(
        seeds = seeds.len(),
        max_depth = params.max_depth,
        max_addresses = params.max_addresses,
        "Crawl started"
    );

    while let Some((address, depth)) = queue.pop_front() {
        if visited.len() >= params.max_addresses {
            break;
        }
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        if depth > params.max_depth || visited.contains(&address) {
            continue;
        }
        visited.insert(address.clone());
        stats.visited = visited.len();

        let (quick_risk_score, alerts) = match visit(engine, &address, tx_limit).await {
            Ok(Visit::Empty) => {
                stats.skipped_empty += 1;
                continue;
            }
            Ok(Visit::Analyzed {
                quick_risk_score,
                alerts,
            }) => (quick_risk_score, alerts),
            Err(e) if e.is_fatal() => {
                tracing::error!(address = %address, error = %e, "Graph store unavailable, aborting crawl");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(address = %address, depth, error = %e, "Failed to analyze address, skipping");
                stats.errors += 1;
                continue;
            }
        };
        stats.analyzed += 1;

        if quick_risk_score >= params.suspicion_floor {
            stats.suspicious += 1;
            tracing::info!(address = %address, depth, quick_risk_score, "Suspicious address");
            suspicious.push(SuspiciousAddress {
                address: address.clone(),
                depth,
                quick_risk_score,
                alerts,
            });

            if quick_risk_score >= params.min_risk_score_to_expand && depth < params.max_depth {
                let counterparties = engine
                    .store
                    .get_counterparties(&address, params.min_value, params.counterparty_limit)
                    .await?;
                stats.expanded += 1;
                for cp in counterparties {
                    if !visited.contains(&cp.address) {
                        queue.push_back((cp.address, depth + 1));
                        stats.enqueued += 1;
                    }
                }
            }
        }

        if params.request_delay_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(params.request_delay_ms)) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    tracing::info!(
        visited = stats.visited,
        analyzed = stats.analyzed,
        suspicious = stats.suspicious,
        errors = stats.errors,
        cancelled,
        "Crawl finished"
    );

    Ok(CrawlResult {
        seeds: seeds.to_vec(),
        stats,
        suspicious,
        cancelled,
    })
}

async fn visit(engine: &Engine, address: &Address, tx_limit: usize) -> Result<Visit> {
    let ingested = engine.ingest(address, tx_limit).await?;
    if ingested == 0 {
        return Ok(Visit::Empty);
    }
    let report = engine.pipeline.run_all(address).await?;
    Ok(Visit::Analyzed {
        quick_risk_score: report.quick_risk_score,
        alerts: report.detected().map(|r| r.alert_type).collect(),
    })
}

/// Seeds must be present and parse as addresses.
pub fn parse_seeds(raw: &[String]) -> Result<Vec<Address>> {
    if raw.is_empty() {
        return Err(AmlError::Validation("at least one seed address is required".into()));
    }
    raw.iter().map(|s| Address::parse(s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::graph::memory::MemoryGraph;
    use crate::graph::store::GraphStore;
    use crate::graph::types::Transaction;
    use chrono::Utc;
    use std::sync::Arc;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    /// `hub` sends 2.0 to each spoke, and each spoke forwards 2.0 to a leaf.
    async fn star(spokes: usize) -> Arc<MemoryGraph> {
        let store = Arc::new(MemoryGraph::new());
        let now = Utc::now() - chrono::Duration::minutes(5);
        for i in 0..spokes {
            for (n, from, to) in [
                (2 * i, "hub".to_string(), format!("spoke{}", i)),
                (2 * i + 1, format!("spoke{}", i), format!("leaf{}", i)),
            ] {
                store
                    .record_transaction(&Transaction {
                        hash: format!("h{}", n),
                        from: addr(&from),
                        to: addr(&to),
                        value: 2.0,
                        timestamp: now,
                        block: n as u64,
                        nonce: n as u64,
                    })
                    .await
                    .unwrap();
            }
        }
        store
    }

    fn expand_everything() -> CrawlerConfig {
        CrawlerConfig {
            min_risk_score_to_expand: 0.0,
            suspicion_floor: 0.0,
            request_delay_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn depth_zero_visits_only_the_seed() {
        let engine = Engine::from_config(Config::default(), star(4).await).unwrap();
        let params = CrawlerConfig {
            max_depth: 0,
            ..expand_everything()
        };
        let result = crawl(&engine, &[addr("hub")], &params, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.stats.visited, 1);
        assert_eq!(result.stats.enqueued, 0);
        assert_eq!(result.stats.expanded, 0);
    }

    #[tokio::test]
    async fn visited_never_exceeds_max_addresses() {
        let engine = Engine::from_config(Config::default(), star(10).await).unwrap();
        let params = CrawlerConfig {
            max_addresses: 4,
            ..expand_everything()
        };
        let result = crawl(&engine, &[addr("hub")], &params, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.stats.visited, 4);
        let unique: HashSet<_> = result.suspicious.iter().map(|s| s.address.clone()).collect();
        assert_eq!(unique.len(), result.suspicious.len());
    }

    #[tokio::test]
    async fn children_are_one_level_deeper() {
        let engine = Engine::from_config(Config::default(), star(3).await).unwrap();
        let params = CrawlerConfig {
            max_depth: 2,
            ..expand_everything()
        };
        let result = crawl(&engine, &[addr("hub")], &params, &CancellationToken::new())
            .await
            .unwrap();

        for s in &result.suspicious {
            let expected = match s.address.as_str() {
                "hub" => 0,
                a if a.starts_with("spoke") => 1,
                _ => 2,
            };
            assert_eq!(s.depth, expected, "{}", s.address);
            assert!(s.depth <= params.max_depth);
        }
        // hub + 3 spokes + 3 leaves
        assert_eq!(result.stats.visited, 7);
    }

    #[tokio::test]
    async fn quiet_addresses_are_not_expanded() {
        let engine = Engine::from_config(Config::default(), star(3).await).unwrap();
        let params = CrawlerConfig {
            request_delay_ms: 0,
            ..Default::default()
        };
        let result = crawl(&engine, &[addr("hub")], &params, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.stats.visited, 1);
        assert!(result.suspicious.is_empty());
    }

    #[tokio::test]
    async fn store_outage_aborts_the_crawl() {
        let store = star(2).await;
        let engine = Engine::from_config(Config::default(), store.clone()).unwrap();
        store.set_available(false);
        let err = crawl(&engine, &[addr("hub")], &expand_everything(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn cancelled_crawl_stops_before_the_next_address() {
        let engine = Engine::from_config(Config::default(), star(2).await).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = crawl(&engine, &[addr("hub")], &expand_everything(), &cancel)
            .await
            .unwrap();
        assert!(result.cancelled);
        assert_eq!(result.stats.visited, 0);
    }

    #[test]
    fn empty_seed_list_is_rejected() {
        assert!(matches!(parse_seeds(&[]), Err(AmlError::Validation(_))));
        assert_eq!(parse_seeds(&["0xABC".into()]).unwrap(), vec![addr("0xabc")]);
    }

    #[tokio::test]
    async fn unknown_seed_is_skipped_as_empty() {
        let engine = Engine::from_config(Config::default(), Arc::new(MemoryGraph::new())).unwrap();
        let result = crawl(&engine, &[addr("nobody")], &expand_everything(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.stats.skipped_empty, 1);
        assert_eq!(result.stats.analyzed, 0);
    }

    #[tokio::test]
    async fn failed_address_is_skipped_and_crawl_continues() {
        use crate::graph::testing::BrokenAddressGraph;

        let store = BrokenAddressGraph::new(star(3).await, "spoke1");
        let engine = Engine::from_config(Config::default(), store).unwrap();
        let params = CrawlerConfig {
            max_depth: 1,
            ..expand_everything()
        };
        let result = crawl(&engine, &[addr("hub")], &params, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.stats.errors, 1);
        assert_eq!(result.stats.visited, 4);
        assert_eq!(result.stats.analyzed, 3);
        let flagged: HashSet<&str> = result.suspicious.iter().map(|s| s.address.as_str()).collect();
        assert_eq!(flagged, HashSet::from(["hub", "spoke0", "spoke2"]));
    }
}
