use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::DetectionConfig;
use crate::error::Result;
use crate::feed::{Feed, FeedEvent};
use crate::graph::store::GraphStore;
use crate::graph::types::{Address, Alert, AlertType};

use super::types::{DetectorOutcome, DetectorResult};
use super::{fraud, laundering};

/// Per-alert weight and per-type cap of the quick risk score.
pub fn quick_weight(alert_type: AlertType) -> (f64, f64) {
    match alert_type {
        AlertType::Structuring => (15.0, 30.0),
        AlertType::PeelChain => (20.0, 40.0),
        AlertType::MixerPattern => (25.0, 50.0),
        AlertType::Taint => (20.0, 40.0),
        AlertType::Circularity => (15.0, 35.0),
        AlertType::VelocityAlert => (10.0, 20.0),
        AlertType::DormantReactivation => (10.0, 20.0),
        AlertType::RoundAmounts => (5.0, 10.0),
        AlertType::TimingPattern => (10.0, 20.0),
        AlertType::WashTrading => (15.0, 30.0),
        AlertType::Layering => (20.0, 40.0),
        AlertType::RugPull => (25.0, 50.0),
        AlertType::PonziScheme => (25.0, 50.0),
        AlertType::Phishing => (25.0, 50.0),
        AlertType::MevBot => (10.0, 20.0),
        AlertType::DustAttack => (5.0, 10.0),
        AlertType::FlashLoan => (20.0, 40.0),
        AlertType::Sanction => (0.0, 0.0),
    }
}

/// Alert-count-only risk approximation, capped at 100.
pub fn quick_risk_score(alerts: &[Alert]) -> f64 {
    let mut counts: BTreeMap<AlertType, usize> = BTreeMap::new();
    for alert in alerts {
        *counts.entry(alert.alert_type).or_default() += 1;
    }
    let total: f64 = counts
        .into_iter()
        .map(|(t, n)| {
            let (per, cap) = quick_weight(t);
            (per * n as f64).min(cap)
        })
        .sum();
    total.min(100.0)
}

/// Everything one pipeline run produced for one address.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub address: Address,
    pub as_of: DateTime<Utc>,
    pub outcomes: BTreeMap<AlertType, DetectorOutcome>,
    /// Alerts appended by this run.
    pub new_alerts: Vec<Alert>,
    pub quick_risk_score: f64,
}

impl PipelineReport {
    pub fn detected(&self) -> impl Iterator<Item = &DetectorResult> {
        self.outcomes
            .values()
            .filter_map(DetectorOutcome::result)
            .filter(|r| r.is_alert())
    }

    pub fn failed_detectors(&self) -> Vec<AlertType> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, DetectorOutcome::Failed { .. }))
            .map(|(t, _)| *t)
            .collect()
    }
}

/// Runs every detector for one address against one snapshot and persists the alerts.
pub struct DetectionPipeline {
    store: Arc<dyn GraphStore>,
    config: DetectionConfig,
    feed: Feed,
}

impl DetectionPipeline {
    pub fn new(store: Arc<dyn GraphStore>, config: DetectionConfig, feed: Feed) -> Self {
        Self {
            store,
            config,
            feed,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub async fn run_all(&self, address: &Address) -> Result<PipelineReport> {
        self.run_at(address, Utc::now()).await
    }

    /// Run with an explicit clock. Fails only when the store itself is unreachable.
    pub async fn run_at(&self, address: &Address, as_of: DateTime<Utc>) -> Result<PipelineReport> {
        let cfg = &self.config;
        let snap = self
            .store
            .snapshot(
                address,
                as_of,
                cfg.neighborhood_hops,
                cfg.neighborhood_edge_limit,
            )
            .await?;

        let mut results: Vec<std::result::Result<DetectorResult, (AlertType, String)>> = vec![
            Ok(laundering::detect_structuring(&snap, cfg)),
            Ok(laundering::detect_peel_chain(&snap, cfg)),
            Ok(laundering::detect_mixer(&snap, cfg)),
        ];

        results.push(
            laundering::detect_taint(self.store.as_ref(), &snap, cfg)
                .await
                .map_err(|e| (AlertType::Taint, e.to_string())),
        );

        results.extend(
            [
                laundering::detect_circularity(&snap, cfg),
                laundering::detect_velocity(&snap, cfg),
                laundering::detect_dormant_reactivation(&snap, cfg),
                laundering::detect_round_amounts(&snap, cfg),
                laundering::detect_timing_pattern(&snap, cfg),
                laundering::detect_wash_trading(&snap, cfg),
                laundering::detect_layering(&snap, cfg),
                laundering::detect_dust_attack(&snap, cfg),
                fraud::detect_rug_pull(&snap, cfg),
                fraud::detect_ponzi(&snap, cfg),
                fraud::detect_phishing(&snap, cfg),
                fraud::detect_mev_bot(&snap, cfg),
                fraud::detect_flash_loan(&snap, cfg),
            ]
            .into_iter()
            .map(Ok),
        );

        let mut outcomes = BTreeMap::new();
        let mut new_alerts = Vec::new();
        for result in results {
            let result = match result {
                Ok(result) => result,
                Err((alert_type, reason)) => {
                    tracing::warn!(
                        address = %address,
                        detector = alert_type.as_str(),
                        error = %reason,
                        "Detector failed, skipping"
                    );
                    outcomes.insert(alert_type, DetectorOutcome::Failed { reason });
                    continue;
                }
            };

            let alert = if result.is_alert() {
                self.store
                    .write_alert(
                        address,
                        result.alert_type,
                        result.score,
                        result.details.clone(),
                    )
                    .await?
            } else {
                None
            };
            if let Some(alert) = &alert {
                tracing::debug!(
                    address = %address,
                    alert_type = alert.alert_type.as_str(),
                    score = alert.score,
                    "Alert recorded"
                );
                new_alerts.push(alert.clone());
                self.feed.publish(FeedEvent::AlertRaised(alert.clone()));
            }
            outcomes.insert(result.alert_type, DetectorOutcome::Completed { result, alert });
        }

        let alerts = self.store.find_alerts(Some(address), &[], 0.0).await?;
        let quick = quick_risk_score(&alerts);

        tracing::debug!(
            address = %address,
            new_alerts = new_alerts.len(),
            quick_risk_score = quick,
            "Detection pipeline complete"
        );

        Ok(PipelineReport {
            address: address.clone(),
            as_of,
            outcomes,
            new_alerts,
            quick_risk_score: quick,
        })
    }
}
