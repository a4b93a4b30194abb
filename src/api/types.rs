use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::automation::jobs::{Job, JobKind, JobStatus};
use crate::graph::types::{AddressRecord, Alert};

fn default_true() -> bool {
    true
}

// ============================================================
// Requests
// ============================================================

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub addresses: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartCrawlerRequest {
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default = "default_true")]
    pub run_async: bool,
    /// Partial `[crawler]` section overriding the configured values.
    pub params: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
pub struct StartMonitorRequest {
    /// Absent means a single check.
    pub duration_hours: Option<f64>,
    #[serde(default = "default_true")]
    pub run_async: bool,
    pub params: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
pub struct StartExpansionRequest {
    pub seed: String,
    #[serde(default = "default_true")]
    pub run_async: bool,
    pub params: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
}

#[derive(Debug, Deserialize)]
pub struct AlertFilter {
    pub min_score: Option<f64>,
}

// ============================================================
// Responses
// ============================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub latest_block: Option<u64>,
    pub running_jobs: usize,
}

#[derive(Debug, Serialize)]
pub struct AddressResponse {
    pub record: AddressRecord,
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub count: usize,
    pub jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
