use std::sync::Arc;

use chrono::Utc;

use crate::config::ScoringConfig;
use crate::error::Result;
use crate::feed::{Feed, FeedEvent};
use crate::graph::store::GraphStore;
use crate::graph::types::{Address, StructuralFeatures};

/// Min-max normalize against `[0, bound]`, saturating at the bound.
fn normalize(value: f64, bound: f64) -> f64 {
    if bound <= 0.0 || !value.is_finite() {
        return 0.0;
    }
    value.clamp(0.0, bound) / bound
}

/// Composite score from structural features and the number of alerts on record.
pub fn composite_score(features: &StructuralFeatures, alert_count: usize, cfg: &ScoringConfig) -> f64 {
    let base = cfg.pagerank_weight * normalize(features.pagerank, cfg.pagerank_bound)
        + cfg.degree_weight * normalize(features.degree, cfg.degree_bound)
        + cfg.in_degree_weight * normalize(features.in_degree, cfg.in_degree_bound)
        + cfg.out_degree_weight * normalize(features.out_degree, cfg.out_degree_bound)
        + cfg.triangle_weight * normalize(features.triangle_count, cfg.triangle_bound);
    let bonus = (cfg.points_per_alert * alert_count as f64).min(cfg.alert_cap);
    (base + bonus).clamp(0.0, 100.0)
}

/// Computes and persists the authoritative 0-100 risk score of an address.
pub struct RiskScorer {
    store: Arc<dyn GraphStore>,
    config: ScoringConfig,
    feed: Feed,
}

impl RiskScorer {
    pub fn new(store: Arc<dyn GraphStore>, config: ScoringConfig, feed: Feed) -> Self {
        Self {
            store,
            config,
            feed,
        }
    }

    /// Score `address` and write it back. Unknown addresses score 0 and are not created.
    ///
    /// Every read happens before the single write, so a store outage never
    /// leaves a partial score behind.
    pub async fn score(&self, address: &Address) -> Result<f64> {
        let Some(record) = self.store.get_address(address).await? else {
            return Ok(0.0);
        };
        let features = record.features.unwrap_or_default();
        let alerts = self.store.find_alerts(Some(address), &[], 0.0).await?;
        let score = composite_score(&features, alerts.len(), &self.config);

        self.store.write_risk_score(address, score).await?;
        self.feed.publish(FeedEvent::RiskScored {
            address: address.clone(),
            score,
            at: Utc::now(),
        });
        tracing::debug!(address = %address, risk_score = score, alerts = alerts.len(), "Risk score written");
        Ok(score)
    }
}
