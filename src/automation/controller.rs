use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::error::{AmlError, Result};
use crate::graph::types::Address;

use super::crawler::{crawl, parse_seeds};
use super::expansion::expand;
use super::jobs::{Job, JobKind, JobRegistry, JobStatus};
use super::monitor::run_monitor;

/// Overlay caller-supplied fields onto the configured defaults.
pub fn with_overrides<T>(defaults: &T, overrides: Option<&JsonValue>) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut merged = serde_json::to_value(defaults)
        .map_err(|e| AmlError::Validation(format!("params: {}", e)))?;
    match overrides {
        None | Some(JsonValue::Null) => {}
        Some(JsonValue::Object(extra)) => {
            if let JsonValue::Object(base) = &mut merged {
                for (k, v) in extra {
                    base.insert(k.clone(), v.clone());
                }
            }
        }
        Some(other) => {
            return Err(AmlError::Validation(format!("params must be an object, got {}", other)));
        }
    }
    serde_json::from_value(merged).map_err(|e| AmlError::Validation(format!("params: {}", e)))
}

/// Starts, tracks and cancels crawler, monitor and expansion jobs.
pub struct AutomationController {
    engine: Arc<Engine>,
    registry: Arc<JobRegistry>,
}

impl AutomationController {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            registry: Arc::new(JobRegistry::new()),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn start_crawler(
        &self,
        seeds: &[String],
        overrides: Option<&JsonValue>,
        run_async: bool,
    ) -> Result<Job> {
        let seeds = parse_seeds(seeds)?;
        let params = with_overrides(&self.engine.config.crawler, overrides)?;
        params.validate().map_err(AmlError::Validation)?;
        let recorded = json!({ "seeds": seeds, "params": params });

        self.launch(JobKind::Crawler, recorded, run_async, move |engine, cancel| async move {
            crawl(&engine, &seeds, &params, &cancel).await
        })
        .await
    }

    pub async fn start_monitor(
        &self,
        duration_hours: Option<f64>,
        overrides: Option<&JsonValue>,
        run_async: bool,
    ) -> Result<Job> {
        let duration = match duration_hours {
            Some(h) if !h.is_finite() || h <= 0.0 => {
                return Err(AmlError::Validation("duration_hours must be positive".into()));
            }
            Some(h) => Some(
                Duration::try_from_secs_f64(h * 3600.0)
                    .map_err(|_| AmlError::Validation("duration_hours is too large".into()))?,
            ),
            None => None,
        };
        let params = with_overrides(&self.engine.config.monitor, overrides)?;
        params.validate().map_err(AmlError::Validation)?;
        let recorded = json!({ "duration_hours": duration_hours, "params": params });

        self.launch(JobKind::Monitor, recorded, run_async, move |engine, cancel| async move {
            run_monitor(&engine, &params, duration, &cancel).await
        })
        .await
    }

    pub async fn start_expansion(
        &self,
        seed: &str,
        overrides: Option<&JsonValue>,
        run_async: bool,
    ) -> Result<Job> {
        let seed = Address::parse(seed)?;
        let params = with_overrides(&self.engine.config.expansion, overrides)?;
        params.validate().map_err(AmlError::Validation)?;
        let recorded = json!({ "seed": seed, "params": params });

        self.launch(JobKind::Expansion, recorded, run_async, move |engine, cancel| async move {
            expand(&engine, &seed, &params, &cancel).await
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Job> {
        self.registry.get(id).await
    }

    pub async fn list(&self, kind: Option<JobKind>, status: Option<JobStatus>) -> Vec<Job> {
        self.registry.list(kind, status).await
    }

    pub async fn cancel(&self, id: &str) -> Result<Job> {
        self.registry.cancel(id).await
    }

    /// Register the job, then run `work` inline or on a background task.
    /// Inline runs return the final record; background runs return the
    /// `started` record immediately. A panicking worker fails its job.
    async fn launch<F, Fut, T>(
        &self,
        kind: JobKind,
        params: JsonValue,
        run_async: bool,
        work: F,
    ) -> Result<Job>
    where
        F: FnOnce(Arc<Engine>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let (job, cancel) = self.registry.create(kind, params).await;
        let registry = self.registry.clone();
        let engine = self.engine.clone();
        let id = job.id.clone();

        let run = async move {
            let outcome = match tokio::spawn(work(engine, cancel)).await {
                Ok(Ok(result)) => serde_json::to_value(result).map_err(|e| e.to_string()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Job worker aborted");
                    Err(format!("worker aborted: {}", e))
                }
            };
            registry.finish(&id, outcome).await;
        };

        if run_async {
            tokio::spawn(run);
            Ok(job)
        } else {
            run.await;
            self.registry.get(&job.id).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, CrawlerConfig};
    use crate::graph::memory::MemoryGraph;
    use crate::graph::store::GraphStore;
    use crate::graph::types::Transaction;
    use chrono::Utc;

    async fn controller() -> (AutomationController, Arc<MemoryGraph>) {
        let store = Arc::new(MemoryGraph::new());
        store
            .record_transaction(&Transaction {
                hash: "h1".into(),
                from: Address::parse("a").unwrap(),
                to: Address::parse("b").unwrap(),
                value: 100.0,
                timestamp: Utc::now() - chrono::Duration::minutes(1),
                block: 7,
                nonce: 0,
            })
            .await
            .unwrap();
        let mut config = Config::default();
        config.crawler.request_delay_ms = 0;
        let engine = Engine::from_config(config, store.clone()).unwrap();
        (AutomationController::new(Arc::new(engine)), store)
    }

    #[test]
    fn overrides_patch_only_named_fields() {
        let defaults = CrawlerConfig::default();
        let merged = with_overrides(&defaults, Some(&json!({"max_depth": 1}))).unwrap();
        assert_eq!(merged.max_depth, 1);
        assert_eq!(merged.max_addresses, defaults.max_addresses);

        let untouched = with_overrides(&defaults, None).unwrap();
        assert_eq!(untouched.max_depth, defaults.max_depth);

        assert!(with_overrides(&defaults, Some(&json!({"max_depth": "deep"}))).is_err());
        assert!(with_overrides(&defaults, Some(&json!([1, 2]))).is_err());
    }

    #[tokio::test]
    async fn sync_crawler_returns_final_status() {
        let (ctl, _) = controller().await;
        let job = ctl
            .start_crawler(&["a".to_string()], Some(&json!({"max_depth": 0})), false)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap()["stats"]["visited"], json!(1));
    }

    #[tokio::test]
    async fn missing_seeds_fail_fast() {
        let (ctl, _) = controller().await;
        let err = ctl.start_crawler(&[], None, true).await.unwrap_err();
        assert!(matches!(err, AmlError::Validation(_)));
        assert!(ctl.list(None, None).await.is_empty());

        let err = ctl.start_monitor(Some(-1.0), None, true).await.unwrap_err();
        assert!(matches!(err, AmlError::Validation(_)));
    }

    #[tokio::test]
    async fn store_outage_fails_the_job() {
        let (ctl, store) = controller().await;
        store.set_available(false);
        let job = ctl.start_expansion("a", None, false).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_background_monitor_stays_cancelled() {
        let (ctl, _) = controller().await;
        let job = ctl.start_monitor(Some(24.0), None, true).await.unwrap();
        assert_eq!(job.status, JobStatus::Started);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let cancelled = ctl.cancel(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        // Let the worker observe the token and finish
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ctl.get(&job.id).await.unwrap().status, JobStatus::Cancelled);
        assert!(matches!(
            ctl.cancel(&job.id).await,
            Err(AmlError::JobAlreadyTerminal { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_overrides_register_no_job() {
        let (ctl, _) = controller().await;
        let seeds = ["a".to_string()];

        let err = ctl
            .start_crawler(&seeds, Some(&json!({"min_value": -1.0})), true)
            .await
            .unwrap_err();
        assert!(matches!(err, AmlError::Validation(_)));
        let err = ctl
            .start_crawler(&seeds, Some(&json!({"suspicion_floor": -5.0})), true)
            .await
            .unwrap_err();
        assert!(matches!(err, AmlError::Validation(_)));
        let err = ctl
            .start_expansion("a", Some(&json!({"trigger_score": -1.0})), true)
            .await
            .unwrap_err();
        assert!(matches!(err, AmlError::Validation(_)));
        let err = ctl
            .start_monitor(Some(1.0), Some(&json!({"check_interval_secs": u64::MAX})), true)
            .await
            .unwrap_err();
        assert!(matches!(err, AmlError::Validation(_)));

        assert!(ctl.list(None, None).await.is_empty());
    }

    #[tokio::test]
    async fn huge_monitor_duration_is_rejected() {
        let (ctl, _) = controller().await;
        let err = ctl.start_monitor(Some(1e17), None, true).await.unwrap_err();
        assert!(matches!(err, AmlError::Validation(_)));
        assert!(ctl.list(None, None).await.is_empty());
    }

    #[tokio::test]
    async fn panicking_worker_fails_its_job() {
        let (ctl, _) = controller().await;
        let job = ctl
            .launch(JobKind::Monitor, json!({}), false, |_, _| async move {
                if true {
                    panic!("worker blew up");
                }
                Ok::<u32, AmlError>(0)
            })
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("worker aborted"));
    }
}
