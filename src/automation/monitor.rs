use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::MonitorConfig;
use crate::engine::{AddressAnalysis, Engine};
use crate::error::{AmlError, Result};
use crate::graph::types::Address;

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub from_block: u64,
    pub to_block: u64,
    pub min_value: f64,
    pub large_transactions: usize,
    pub analyzed: Vec<AddressAnalysis>,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorResult {
    pub checks: usize,
    pub failed_checks: usize,
    pub large_transactions: usize,
    pub addresses_analyzed: usize,
    pub high_risk: Vec<Address>,
    pub last_block: Option<u64>,
    pub cancelled: bool,
}

/// Watches for large transactions and analyzes both endpoints of each,
/// every endpoint at most once per monitor lifetime.
pub struct Monitor<'a> {
    engine: &'a Engine,
    params: &'a MonitorConfig,
    last_block: Option<u64>,
    seen: HashSet<Address>,
}

impl<'a> Monitor<'a> {
    pub fn new(engine: &'a Engine, params: &'a MonitorConfig) -> Self {
        Self {
            engine,
            params,
            last_block: None,
            seen: HashSet::new(),
        }
    }

    /// Inspect blocks since the previous check. The first check looks back
    /// `lookback_blocks` from the head. `None` when there is nothing new.
    pub async fn check(&mut self) -> Result<Option<TickReport>> {
        let Some(head) = self.engine.head.current_block().await? else {
            tracing::debug!("No chain head yet, nothing to monitor");
            return Ok(None);
        };
        let from_block = match self.last_block {
            Some(last) => last + 1,
            None => head.saturating_sub(self.engine.config.chain.lookback_blocks),
        };
        if from_block > head {
            return Ok(None);
        }

        let price = self.engine.price.price().await;
        let min_value = if price > 0.0 {
            self.params.min_value_usd / price
        } else {
            self.params.min_value_usd
        };

        let txs = self
            .engine
            .store
            .large_transactions(from_block, head, min_value, self.params.max_transactions_per_check)
            .await?;

        tracing::info!(
            from_block,
            to_block = head,
            min_value,
            large_transactions = txs.len(),
            "Monitor check"
        );

        let tx_limit = self.engine.config.chain.tx_limit_per_address;
        let mut analyzed = Vec::new();
        let mut errors = 0;
        for tx in &txs {
            for endpoint in [&tx.from, &tx.to] {
                if !self.seen.insert(endpoint.clone()) {
                    continue;
                }
                match self.engine.analyze(endpoint, tx_limit).await {
                    Ok(analysis) => analyzed.push(analysis),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!(address = %endpoint, tx = %tx.hash, error = %e, "Failed to analyze endpoint");
                        errors += 1;
                    }
                }
            }
        }

        self.last_block = Some(head);
        Ok(Some(TickReport {
            from_block,
            to_block: head,
            min_value,
            large_transactions: txs.len(),
            analyzed,
            errors,
        }))
    }

    pub fn last_block(&self) -> Option<u64> {
        self.last_block
    }
}

/// Run one check when `duration` is `None`, otherwise keep checking every
/// `check_interval_secs` until the duration elapses or `cancel` fires.
pub async fn run_monitor(
    engine: &Engine,
    params: &MonitorConfig,
    duration: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<MonitorResult> {
    let mut monitor = Monitor::new(engine, params);
    let mut result = MonitorResult::default();

    let Some(duration) = duration else {
        if let Some(tick) = monitor.check().await? {
            record(&mut result, &tick);
        }
        result.checks = 1;
        result.last_block = monitor.last_block();
        return Ok(result);
    };

    let deadline = Instant::now()
        .checked_add(duration)
        .ok_or_else(|| AmlError::Validation("monitor duration is too long".into()))?;
    tracing::info!(
        duration_secs = duration.as_secs(),
        interval_secs = params.check_interval_secs,
        "Monitor started"
    );

    while Instant::now() < deadline && !cancel.is_cancelled() {
        let wait = match monitor.check().await {
            Ok(tick) => {
                result.checks += 1;
                if let Some(tick) = tick {
                    record(&mut result, &tick);
                }
                Duration::from_secs(params.check_interval_secs)
            }
            Err(e) => {
                result.checks += 1;
                result.failed_checks += 1;
                tracing::error!(error = %e, backoff_secs = params.error_backoff_secs, "Monitor check failed");
                Duration::from_secs(params.error_backoff_secs)
            }
        };

        let wake = Instant::now()
            .checked_add(wait)
            .map_or(deadline, |at| at.min(deadline));
        tokio::select! {
            _ = tokio::time::sleep_until(wake) => {}
            _ = cancel.cancelled() => {}
        }
    }

    result.cancelled = cancel.is_cancelled();
    result.last_block = monitor.last_block();
    tracing::info!(
        checks = result.checks,
        addresses_analyzed = result.addresses_analyzed,
        cancelled = result.cancelled,
        "Monitor stopped"
    );
    Ok(result)
}

const HIGH_RISK: f64 = 70.0;

fn record(result: &mut MonitorResult, tick: &TickReport) {
    result.large_transactions += tick.large_transactions;
    result.addresses_analyzed += tick.analyzed.len();
    result.high_risk.extend(
        tick.analyzed
            .iter()
            .filter(|a| a.risk_score > HIGH_RISK)
            .map(|a| a.address.clone()),
    );
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

    async fn put(store: &MemoryGraph, hash: &str, from: &str, to: &str, value: f64, block: u64) {
        store
            .record_transaction(&Transaction {
                hash: hash.into(),
                from: addr(from),
                to: addr(to),
                value,
                timestamp: Utc::now() - chrono::Duration::minutes(1),
                block,
                nonce: 0,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn endpoints_are_analyzed_once() {
        let store = Arc::new(MemoryGraph::new());
        // 100k USD at the default 2000 USD price is 50 units
        put(&store, "big", "whale", "exchange", 60.0, 100).await;
        put(&store, "small", "x", "y", 1.0, 101).await;
        let engine = Engine::from_config(Config::default(), store.clone()).unwrap();
        let params = MonitorConfig::default();
        let mut monitor = Monitor::new(&engine, &params);

        let tick = monitor.check().await.unwrap().unwrap();
        assert_eq!(tick.min_value, 50.0);
        assert_eq!(tick.large_transactions, 1);
        let names: HashSet<_> = tick.analyzed.iter().map(|a| a.address.as_str().to_string()).collect();
        assert_eq!(names, HashSet::from(["whale".to_string(), "exchange".to_string()]));

        // Nothing past the head
        assert!(monitor.check().await.unwrap().is_none());

        put(&store, "big2", "whale", "exchange", 80.0, 102).await;
        let tick = monitor.check().await.unwrap().unwrap();
        assert_eq!(tick.from_block, 102);
        assert_eq!(tick.large_transactions, 1);
        assert!(tick.analyzed.is_empty());
    }

    #[tokio::test]
    async fn single_check_without_duration() {
        let store = Arc::new(MemoryGraph::new());
        put(&store, "big", "whale", "exchange", 60.0, 10).await;
        let engine = Engine::from_config(Config::default(), store).unwrap();
        let result = run_monitor(&engine, &MonitorConfig::default(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.checks, 1);
        assert_eq!(result.addresses_analyzed, 2);
        assert_eq!(result.last_block, Some(10));
    }

    #[tokio::test]
    async fn empty_store_has_nothing_to_check() {
        let engine = Engine::from_config(Config::default(), Arc::new(MemoryGraph::new())).unwrap();
        let params = MonitorConfig::default();
        let mut monitor = Monitor::new(&engine, &params);
        assert!(monitor.check().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn looping_monitor_stops_on_cancel() {
        let store = Arc::new(MemoryGraph::new());
        put(&store, "big", "whale", "exchange", 60.0, 10).await;
        let engine = Engine::from_config(Config::default(), store).unwrap();
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            stopper.cancel();
        });

        let result = run_monitor(
            &engine,
            &MonitorConfig::default(),
            Some(Duration::from_secs(24 * 3600)),
            &cancel,
        )
        .await
        .unwrap();
        assert!(result.cancelled);
        assert_eq!(result.checks, 1);
        assert_eq!(result.addresses_analyzed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_interval_sleeps_until_deadline() {
        let store = Arc::new(MemoryGraph::new());
        put(&store, "big", "whale", "exchange", 60.0, 10).await;
        let engine = Engine::from_config(Config::default(), store).unwrap();
        let params = MonitorConfig {
            check_interval_secs: u64::MAX,
            ..MonitorConfig::default()
        };

        let result = run_monitor(&engine, &params, Some(Duration::from_secs(3600)), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.cancelled);
        assert_eq!(result.checks, 1);

        let err = run_monitor(&engine, &params, Some(Duration::MAX), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AmlError::Validation(_)));
    }
}
