use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{AmlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Crawler,
    Monitor,
    Expansion,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crawler => "crawler",
            Self::Monitor => "monitor",
            Self::Expansion => "expansion",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Started,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// One automation run as seen by API clients.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub params: JsonValue,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
}

/// Shared table of every job this process has started.
///
/// Only the worker owning a job calls [`finish`](Self::finish) for it, and a
/// job leaves `started` at most once, so a late worker never overwrites a
/// cancellation.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobEntry>>,
    seq: AtomicU64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new `started` job and hand back its cancellation token.
    pub async fn create(&self, kind: JobKind, params: JsonValue) -> (Job, CancellationToken) {
        let now = Utc::now();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}_{}_{}", kind, now.format("%Y%m%d_%H%M%S"), seq);
        let job = Job {
            id: id.clone(),
            kind,
            status: JobStatus::Started,
            params,
            result: None,
            error: None,
            started_at: now,
            completed_at: None,
        };
        let cancel = CancellationToken::new();
        self.jobs.write().await.insert(
            id,
            JobEntry {
                job: job.clone(),
                cancel: cancel.clone(),
            },
        );
        tracing::info!(job_id = %job.id, kind = %kind, "Job started");
        (job, cancel)
    }

    /// Record the worker's outcome. Ignored unless the job is still `started`.
    pub async fn finish(&self, id: &str, outcome: std::result::Result<JsonValue, String>) {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(id) else {
            return;
        };
        if entry.job.status.is_terminal() {
            tracing::info!(job_id = id, status = entry.job.status.as_str(), "Job already terminal, dropping worker result");
            return;
        }
        match outcome {
            Ok(result) => {
                entry.job.status = JobStatus::Completed;
                entry.job.result = Some(result);
                tracing::info!(job_id = id, "Job completed");
            }
            Err(error) => {
                tracing::error!(job_id = id, error = %error, "Job failed");
                entry.job.status = JobStatus::Failed;
                entry.job.error = Some(error);
            }
        }
        entry.job.completed_at = Some(Utc::now());
    }

    pub async fn get(&self, id: &str) -> Result<Job> {
        self.jobs
            .read()
            .await
            .get(id)
            .map(|e| e.job.clone())
            .ok_or_else(|| AmlError::JobNotFound(id.to_string()))
    }

    /// Jobs matching the filters, newest first.
    pub async fn list(&self, kind: Option<JobKind>, status: Option<JobStatus>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .map(|e| &e.job)
            .filter(|j| kind.map_or(true, |k| j.kind == k))
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        jobs
    }

    /// Move a `started` job to `cancelled` and signal its worker.
    pub async fn cancel(&self, id: &str) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| AmlError::JobNotFound(id.to_string()))?;
        if entry.job.status.is_terminal() {
            return Err(AmlError::JobAlreadyTerminal {
                job_id: id.to_string(),
                status: entry.job.status.as_str().to_string(),
            });
        }
        entry.job.status = JobStatus::Cancelled;
        entry.job.result = Some(json!({ "message": "Job cancelled by user" }));
        entry.job.completed_at = Some(Utc::now());
        entry.cancel.cancel();
        tracing::info!(job_id = id, "Job cancelled");
        Ok(entry.job.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_carry_kind_and_sequence() {
        let registry = JobRegistry::new();
        let (a, _) = registry.create(JobKind::Crawler, json!({})).await;
        let (b, _) = registry.create(JobKind::Monitor, json!({})).await;
        assert!(a.id.starts_with("crawler_"));
        assert!(a.id.ends_with("_1"));
        assert!(b.id.starts_with("monitor_"));
        assert!(b.id.ends_with("_2"));
        assert_eq!(a.status, JobStatus::Started);
    }

    #[tokio::test]
    async fn cancel_is_one_way() {
        let registry = JobRegistry::new();
        let (job, token) = registry.create(JobKind::Crawler, json!({"seeds": ["a"]})).await;

        let cancelled = registry.cancel(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(token.is_cancelled());
        assert_eq!(registry.get(&job.id).await.unwrap().status, JobStatus::Cancelled);

        let again = registry.cancel(&job.id).await.unwrap_err();
        assert!(matches!(again, AmlError::JobAlreadyTerminal { .. }));

        // A worker that finishes late must not resurrect the job
        registry.finish(&job.id, Ok(json!({"visited": 3}))).await;
        let job = registry.get(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.result, Some(json!({"message": "Job cancelled by user"})));
    }

    #[tokio::test]
    async fn unknown_jobs_are_not_found() {
        let registry = JobRegistry::new();
        assert!(matches!(registry.get("nope").await, Err(AmlError::JobNotFound(_))));
        assert!(matches!(registry.cancel("nope").await, Err(AmlError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn terminal_jobs_cannot_be_cancelled() {
        let registry = JobRegistry::new();
        let (job, _) = registry.create(JobKind::Expansion, json!({})).await;
        registry.finish(&job.id, Err("graph store unavailable".into())).await;
        let failed = registry.get(&job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("graph store unavailable"));
        assert!(registry.cancel(&job.id).await.is_err());
    }

    #[tokio::test]
    async fn list_filters_and_orders_newest_first() {
        let registry = JobRegistry::new();
        let (first, _) = registry.create(JobKind::Crawler, json!({})).await;
        let (second, _) = registry.create(JobKind::Crawler, json!({})).await;
        let (_, _) = registry.create(JobKind::Monitor, json!({})).await;
        registry.finish(&first.id, Ok(json!({}))).await;

        let crawlers = registry.list(Some(JobKind::Crawler), None).await;
        assert_eq!(crawlers.len(), 2);
        assert_eq!(crawlers[0].id, second.id);

        let done = registry.list(None, Some(JobStatus::Completed)).await;
        assert_eq!(done.len(), 1);
        assert_eq!(registry.list(None, None).await.len(), 3);
    }
}
