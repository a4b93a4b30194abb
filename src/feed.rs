use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::graph::types::{Address, Alert};

/// Something observable that happened to an address.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    AlertRaised(Alert),
    RiskScored {
        address: Address,
        score: f64,
        at: DateTime<Utc>,
    },
}

/// Fan-out channel for created alerts and updated risk scores.
#[derive(Clone)]
pub struct Feed {
    tx: broadcast::Sender<FeedEvent>,
}

impl Feed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.tx.subscribe()
    }

    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: FeedEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for Feed {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Log every feed event until the channel closes.
pub async fn log_events(mut rx: broadcast::Receiver<FeedEvent>) {
    loop {
        match rx.recv().await {
            Ok(FeedEvent::AlertRaised(alert)) => {
                tracing::warn!(
                    address = %alert.address,
                    alert_type = alert.alert_type.as_str(),
                    score = alert.score,
                    details = %alert.details,
                    "ALERT RAISED"
                );
            }
            Ok(FeedEvent::RiskScored { address, score, .. }) => {
                tracing::info!(address = %address, risk_score = score, "Risk score updated");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Feed logger lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
