use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::Config;
use crate::detection::engine::DetectionPipeline;
use crate::error::Result;
use crate::feed::Feed;
use crate::graph::store::GraphStore;
use crate::graph::types::{Address, AlertType};
use crate::ingest::etherscan::EtherscanIngestor;
use crate::ingest::head::{BlockHead, RpcHead, StoreHead};
use crate::ingest::price::{CachedPrice, CoinGeckoPrice, FixedPrice, PriceFeed};
use crate::ingest::{GraphAnalytics, Ingestor, StoreOnlyIngestor};
use crate::scoring::risk::RiskScorer;

/// Result of a full analysis: ingest, detect, (optionally) refresh features, score.
#[derive(Debug, Clone, Serialize)]
pub struct AddressAnalysis {
    pub address: Address,
    pub ingested: usize,
    pub quick_risk_score: f64,
    pub risk_score: f64,
    pub detected: Vec<AlertType>,
    pub new_alerts: usize,
    pub failed_detectors: Vec<AlertType>,
}

/// Every component the controllers need, wired once at startup and shared by `Arc`.
pub struct Engine {
    pub config: Config,
    pub store: Arc<dyn GraphStore>,
    pub ingestor: Arc<dyn Ingestor>,
    pub analytics: Option<Arc<dyn GraphAnalytics>>,
    pub head: Arc<dyn BlockHead>,
    pub price: CachedPrice,
    pub pipeline: DetectionPipeline,
    pub scorer: RiskScorer,
    pub feed: Feed,
}

impl Engine {
    pub fn new(
        config: Config,
        store: Arc<dyn GraphStore>,
        ingestor: Arc<dyn Ingestor>,
        head: Arc<dyn BlockHead>,
        price: CachedPrice,
        feed: Feed,
    ) -> Self {
        let pipeline = DetectionPipeline::new(store.clone(), config.detection.clone(), feed.clone());
        let scorer = RiskScorer::new(store.clone(), config.scoring.clone(), feed.clone());
        Self {
            config,
            store,
            ingestor,
            analytics: None,
            head,
            price,
            pipeline,
            scorer,
            feed,
        }
    }

    /// Pick collaborators from the config: Etherscan when an API key is set,
    /// the RPC node for the chain head when `rpc_http` is set, CoinGecko when
    /// a price URL is set. Anything missing falls back to the store or the
    /// fixed price.
    pub fn from_config(config: Config, store: Arc<dyn GraphStore>) -> Result<Self> {
        let ingestor: Arc<dyn Ingestor> = match &config.chain.etherscan_api_key {
            Some(key) => Arc::new(EtherscanIngestor::new(
                &config.chain.etherscan_url,
                key,
                config.chain.chain_id,
                store.clone(),
            )?),
            None => {
                tracing::info!("No Etherscan API key, ingestion reads the store only");
                Arc::new(StoreOnlyIngestor::new(store.clone()))
            }
        };

        let head: Arc<dyn BlockHead> = match &config.chain.rpc_http {
            Some(url) => Arc::new(RpcHead::connect(url)?),
            None => Arc::new(StoreHead::new(store.clone())),
        };

        let source: Box<dyn PriceFeed> = match &config.price.coingecko_url {
            Some(url) => Box::new(CoinGeckoPrice::new(url)?),
            None => Box::new(FixedPrice(config.price.fixed_usd)),
        };
        let price = CachedPrice::new(
            source,
            Duration::from_secs(config.price.refresh_secs),
            config.price.fixed_usd,
        );

        Ok(Self::new(config, store, ingestor, head, price, Feed::default()))
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn GraphAnalytics>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    /// Ingest up to `tx_limit` transactions for `address`. A failed fetch is
    /// logged and treated as nothing new; only a store outage is an error.
    pub async fn ingest(&self, address: &Address, tx_limit: usize) -> Result<usize> {
        match self.ingestor.fetch_and_merge(address, tx_limit).await {
            Ok(report) => Ok(report.ingested),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "Ingestion failed, nothing to analyze");
                Ok(0)
            }
        }
    }

    /// Full analysis of one address. The scorer runs after every detector so
    /// it sees the alerts this run created.
    pub async fn analyze(&self, address: &Address, tx_limit: usize) -> Result<AddressAnalysis> {
        let ingested = self.ingest(address, tx_limit).await?;
        let report = self.pipeline.run_all(address).await?;

        if self.config.expansion.refresh_features {
            if let Some(analytics) = &self.analytics {
                if let Err(e) = analytics.refresh_features().await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    tracing::warn!(error = %e, "Feature refresh failed, scoring with stored features");
                }
            }
        }

        let risk_score = self.scorer.score(address).await?;
        tracing::info!(
            address = %address,
            ingested,
            quick_risk_score = report.quick_risk_score,
            risk_score,
            "Address analyzed"
        );

        Ok(AddressAnalysis {
            address: address.clone(),
            ingested,
            quick_risk_score: report.quick_risk_score,
            risk_score,
            detected: report.detected().map(|r| r.alert_type).collect(),
            new_alerts: report.new_alerts.len(),
            failed_detectors: report.failed_detectors(),
        })
    }
}
