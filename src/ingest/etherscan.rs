use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::{AmlError, Result};
use crate::graph::store::GraphStore;
use crate::graph::types::{Address, Transaction};

use super::{retry_rpc, IngestReport, Ingestor};

const WEI_PER_UNIT: u64 = 1_000_000_000_000_000_000;

/// One row of the `account/txlist` response. Every field arrives as a string.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTx {
    pub hash: String,
    pub from: String,
    #[serde(default)]
    pub to: String,
    pub value: String,
    pub time_stamp: String,
    pub block_number: String,
    #[serde(default)]
    pub nonce: String,
}

#[derive(Debug, Deserialize)]
struct TxListResponse {
    status: String,
    message: String,
    result: JsonValue,
}

/// Convert a decimal wei string into native units.
pub fn wei_to_units(wei: &str) -> f64 {
    let Ok(wei) = BigDecimal::from_str(wei.trim()) else {
        return 0.0;
    };
    (wei / BigDecimal::from(WEI_PER_UNIT)).to_f64().unwrap_or(0.0)
}

/// Normalize one raw row. Contract creations (empty `to`) are skipped.
pub fn normalize(raw: &RawTx) -> Option<Transaction> {
    if raw.to.trim().is_empty() {
        return None;
    }
    let secs: i64 = raw.time_stamp.parse().ok()?;
    Some(Transaction {
        hash: raw.hash.to_lowercase(),
        from: Address::parse(&raw.from).ok()?,
        to: Address::parse(&raw.to).ok()?,
        value: wei_to_units(&raw.value),
        timestamp: Utc.timestamp_opt(secs, 0).single()?,
        block: raw.block_number.parse().ok()?,
        nonce: raw.nonce.parse().unwrap_or(0),
    })
}

/// Pulls normal transactions from the Etherscan V2 API and merges them into the store.
pub struct EtherscanIngestor {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    chain_id: u64,
    store: Arc<dyn GraphStore>,
}

impl EtherscanIngestor {
    pub fn new(
        base_url: &str,
        api_key: &str,
        chain_id: u64,
        store: Arc<dyn GraphStore>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AmlError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            chain_id,
            store,
        })
    }

    async fn txlist(&self, address: &Address) -> Result<Vec<RawTx>> {
        let failed = |reason: String| AmlError::IngestionFailed {
            address: address.to_string(),
            reason,
        };

        let chain_id = self.chain_id.to_string();
        let params = [
            ("chainid", chain_id.as_str()),
            ("module", "account"),
            ("action", "txlist"),
            ("address", address.as_str()),
            ("startblock", "0"),
            ("endblock", "99999999"),
            ("sort", "asc"),
            ("apikey", self.api_key.as_str()),
        ];

        let response: TxListResponse = retry_rpc("etherscan txlist", || async {
            self.client
                .get(&self.base_url)
                .query(&params)
                .send()
                .await?
                .error_for_status()?
                .json::<TxListResponse>()
                .await
        })
        .await
        .map_err(|e| failed(e.to_string()))?;

        if response.status == "0" {
            if response.message == "No transactions found" {
                return Ok(Vec::new());
            }
            return Err(failed(format!("{}: {}", response.message, response.result)));
        }
        serde_json::from_value(response.result).map_err(|e| failed(e.to_string()))
    }
}

#[async_trait]
impl Ingestor for EtherscanIngestor {
    async fn fetch_and_merge(&self, address: &Address, limit: usize) -> Result<IngestReport> {
        tracing::info!(address = %address, chain_id = self.chain_id, "Ingesting from Etherscan");
        let raw = self.txlist(address).await?;

        let rows: Vec<Transaction> = raw.iter().take(limit).filter_map(normalize).collect();
        let mut inserted = 0usize;
        for tx in &rows {
            if self.store.record_transaction(tx).await? {
                inserted += 1;
            }
        }

        tracing::info!(
            address = %address,
            fetched = raw.len(),
            ingested = rows.len(),
            new = inserted,
            "Ingestion complete"
        );
        Ok(IngestReport {
            ingested: rows.len(),
        })
    }
}
