use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::graph::types::{Alert, AlertType};

/// Outcome of one detector over one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorResult {
    pub alert_type: AlertType,
    pub detected: bool,
    /// Always within [0, 100].
    pub score: f64,
    pub details: JsonValue,
}

impl DetectorResult {
    pub fn clean(alert_type: AlertType) -> Self {
        Self {
            alert_type,
            detected: false,
            score: 0.0,
            details: JsonValue::Null,
        }
    }

    pub fn flagged(alert_type: AlertType, score: f64, details: JsonValue) -> Self {
        Self::scored(alert_type, true, score, details)
    }

    /// Result whose `detected` flag is decided by the caller (additive fraud rules).
    pub fn scored(alert_type: AlertType, detected: bool, score: f64, details: JsonValue) -> Self {
        let score = if score.is_finite() { score.clamp(0.0, 100.0) } else { 0.0 };
        Self {
            alert_type,
            detected,
            score,
            details,
        }
    }

    /// Whether this result should be persisted as an alert.
    pub fn is_alert(&self) -> bool {
        self.detected && self.score > 0.0
    }
}

/// What the pipeline did with one detector.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DetectorOutcome {
    Completed {
        result: DetectorResult,
        /// Alert appended by this run; `None` when clean or already recorded.
        alert: Option<Alert>,
    },
    Failed {
        reason: String,
    },
}

impl DetectorOutcome {
    pub fn result(&self) -> Option<&DetectorResult> {
        match self {
            Self::Completed { result, .. } => Some(result),
            Self::Failed { .. } => None,
        }
    }
}
