use std::collections::HashSet;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::engine::Engine;
use crate::graph::types::Address;

/// Risk above which a bulk row counts as high risk.
pub const HIGH_RISK_SCORE: f64 = 70.0;

/// One CSV row of a bulk run.
#[derive(Debug, Clone, Serialize)]
pub struct BulkRow {
    pub address: String,
    pub risk_score: Option<f64>,
    pub quick_risk_score: Option<f64>,
    pub ingested: Option<usize>,
    /// Detected alert types, `;`-separated.
    pub alerts: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub analyzed: usize,
    pub errors: usize,
    pub high_risk: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkReport {
    pub summary: BulkSummary,
    /// Highest risk first, failures last.
    pub rows: Vec<BulkRow>,
}

/// Fully analyze every address with at most `workers` analyses in flight.
/// Failures are reported per row and never stop the batch.
pub async fn analyze_many(engine: &Engine, addresses: &[Address], workers: usize) -> BulkReport {
    let tx_limit = engine.config.chain.tx_limit_per_address;
    tracing::info!(addresses = addresses.len(), workers, "Bulk analysis started");

    let mut rows: Vec<BulkRow> = stream::iter(addresses.iter().cloned())
        .map(|address| analyze_one(engine, address, tx_limit))
        .buffer_unordered(workers.max(1))
        .collect()
        .await;

    rows.sort_by(|a, b| {
        let score = |r: &BulkRow| r.risk_score.unwrap_or(f64::NEG_INFINITY);
        score(b)
            .total_cmp(&score(a))
            .then_with(|| a.address.cmp(&b.address))
    });

    let summary = BulkSummary {
        total: rows.len(),
        analyzed: rows.iter().filter(|r| r.error.is_none()).count(),
        errors: rows.iter().filter(|r| r.error.is_some()).count(),
        high_risk: rows
            .iter()
            .filter(|r| r.risk_score.is_some_and(|s| s > HIGH_RISK_SCORE))
            .count(),
    };
    tracing::info!(
        analyzed = summary.analyzed,
        errors = summary.errors,
        high_risk = summary.high_risk,
        "Bulk analysis finished"
    );

    BulkReport { summary, rows }
}

async fn analyze_one(engine: &Engine, address: Address, tx_limit: usize) -> BulkRow {
    match engine.analyze(&address, tx_limit).await {
        Ok(a) => BulkRow {
            address: address.to_string(),
            risk_score: Some(a.risk_score),
            quick_risk_score: Some(a.quick_risk_score),
            ingested: Some(a.ingested),
            alerts: a
                .detected
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(";"),
            error: None,
        },
        Err(e) => {
            tracing::warn!(address = %address, error = %e, "Bulk analysis failed for address");
            BulkRow {
                address: address.to_string(),
                risk_score: None,
                quick_risk_score: None,
                ingested: None,
                alerts: String::new(),
                error: Some(e.to_string()),
            }
        }
    }
}

/// Addresses from a text file, one per line. Blank lines and `#` comments
/// are ignored, duplicates keep their first position.
pub fn read_addresses(path: &str) -> eyre::Result<Vec<Address>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("Failed to read address file '{}': {}", path, e))?;
    parse_address_list(&content)
}

pub fn parse_address_list(content: &str) -> eyre::Result<Vec<Address>> {
    let mut seen = HashSet::new();
    let mut addresses = Vec::new();
    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let address = Address::parse(line).map_err(|e| eyre::eyre!("line {}: {}", n + 1, e))?;
        if seen.insert(address.clone()) {
            addresses.push(address);
        }
    }
    Ok(addresses)
}

pub fn write_csv(path: &str, rows: &[BulkRow]) -> eyre::Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| eyre::eyre!("Failed to create CSV '{}': {}", path, e))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    tracing::info!(path, rows = rows.len(), "Bulk results exported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::graph::memory::MemoryGraph;
    use crate::graph::store::GraphStore;
    use crate::graph::types::{AlertType, Transaction};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn address_list_skips_comments_and_duplicates() {
        let list = parse_address_list("# seeds\n0xAbC\n\n0xabc\n  def  \n").unwrap();
        let names: Vec<&str> = list.iter().map(|a| a.as_str()).collect();
        assert_eq!(names, vec!["0xabc", "def"]);
    }

    #[test]
    fn bad_address_reports_its_line() {
        let bad = format!("ok\n0x{}", "g".repeat(40));
        let err = parse_address_list(&bad).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test]
    async fn summary_counts_high_risk_rows() {
        let store = Arc::new(MemoryGraph::new());
        for (i, from) in ["a", "b"].iter().enumerate() {
            store
                .record_transaction(&Transaction {
                    hash: format!("h{}", i),
                    from: Address::parse(from).unwrap(),
                    to: Address::parse("sink").unwrap(),
                    value: 1.0,
                    timestamp: Utc::now() - chrono::Duration::minutes(1),
                    block: i as u64,
                    nonce: 0,
                })
                .await
                .unwrap();
        }
        let a = Address::parse("a").unwrap();
        for t in [AlertType::MixerPattern, AlertType::RugPull, AlertType::Phishing, AlertType::Layering] {
            store.write_alert(&a, t, 80.0, json!({"seeded": true})).await.unwrap();
        }
        store
            .write_structural_features(
                &a,
                &crate::graph::types::StructuralFeatures {
                    pagerank: 0.01,
                    degree: 100.0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let engine = Engine::from_config(Config::default(), store).unwrap();
        let addresses: Vec<Address> = ["a", "b", "sink"].iter().map(|s| Address::parse(s).unwrap()).collect();
        let report = analyze_many(&engine, &addresses, 2).await;

        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.analyzed, 3);
        assert_eq!(report.summary.errors, 0);
        assert_eq!(report.summary.high_risk, 1);
        assert_eq!(report.rows[0].address, "a");
    }

    #[tokio::test]
    async fn store_outage_is_reported_per_row() {
        let store = Arc::new(MemoryGraph::new());
        let engine = Engine::from_config(Config::default(), store.clone()).unwrap();
        store.set_available(false);
        let report = analyze_many(&engine, &[Address::parse("a").unwrap()], 4).await;
        assert_eq!(report.summary.errors, 1);
        assert!(report.rows[0].error.is_some());
    }
}
