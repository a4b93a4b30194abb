use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

use crate::automation::jobs::{Job, JobStatus};
use crate::bulk::{analyze_many, BulkReport};
use crate::engine::AddressAnalysis;
use crate::error::AmlError;
use crate::graph::types::Address;

use super::types::*;
use super::AppState;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

const MAX_BULK_ADDRESSES: usize = 1000;

fn api_error(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: msg.into(),
        }),
    )
}

pub fn error_status(e: &AmlError) -> StatusCode {
    match e {
        AmlError::Validation(_) => StatusCode::BAD_REQUEST,
        AmlError::JobNotFound(_) => StatusCode::NOT_FOUND,
        AmlError::JobAlreadyTerminal { .. } => StatusCode::CONFLICT,
        AmlError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AmlError::IngestionFailed { .. } => StatusCode::BAD_GATEWAY,
        AmlError::Detector { .. } | AmlError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn from_aml(e: AmlError) -> (StatusCode, Json<ErrorResponse>) {
    api_error(error_status(&e), e.to_string())
}

fn parse_address(raw: &str) -> Result<Address, (StatusCode, Json<ErrorResponse>)> {
    Address::parse(raw).map_err(from_aml)
}

// ============================================================
// Health
// ============================================================

pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    let engine = state.controller.engine();
    let latest_block = engine.store.latest_block().await.map_err(from_aml)?;
    let running_jobs = state
        .controller
        .list(None, Some(JobStatus::Started))
        .await
        .len();
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        latest_block,
        running_jobs,
    }))
}

// ============================================================
// Addresses
// ============================================================

pub async fn address_detail(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
    Query(filter): Query<AlertFilter>,
) -> ApiResult<AddressResponse> {
    let addr = parse_address(&address)?;
    let store = &state.controller.engine().store;
    let record = store
        .get_address(&addr)
        .await
        .map_err(from_aml)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Address {} not found", addr)))?;
    let alerts = store
        .find_alerts(Some(&addr), &[], filter.min_score.unwrap_or(0.0))
        .await
        .map_err(from_aml)?;
    Ok(Json(AddressResponse { record, alerts }))
}

pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<AddressAnalysis> {
    let addr = parse_address(&address)?;
    let engine = state.controller.engine();
    engine
        .analyze(&addr, engine.config.chain.tx_limit_per_address)
        .await
        .map(Json)
        .map_err(from_aml)
}

pub async fn bulk(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BulkRequest>,
) -> ApiResult<BulkReport> {
    if req.addresses.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "addresses must not be empty"));
    }
    if req.addresses.len() > MAX_BULK_ADDRESSES {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("at most {} addresses per request", MAX_BULK_ADDRESSES),
        ));
    }
    let addresses = req
        .addresses
        .iter()
        .map(|a| parse_address(a))
        .collect::<Result<Vec<_>, _>>()?;

    let engine = state.controller.engine();
    Ok(Json(
        analyze_many(engine, &addresses, engine.config.automation.bulk_workers).await,
    ))
}

// ============================================================
// Automation
// ============================================================

pub async fn start_crawler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartCrawlerRequest>,
) -> ApiResult<Job> {
    state
        .controller
        .start_crawler(&req.seeds, req.params.as_ref(), req.run_async)
        .await
        .map(Json)
        .map_err(from_aml)
}

pub async fn start_monitor(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartMonitorRequest>,
) -> ApiResult<Job> {
    state
        .controller
        .start_monitor(req.duration_hours, req.params.as_ref(), req.run_async)
        .await
        .map(Json)
        .map_err(from_aml)
}

pub async fn start_expansion(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartExpansionRequest>,
) -> ApiResult<Job> {
    state
        .controller
        .start_expansion(&req.seed, req.params.as_ref(), req.run_async)
        .await
        .map(Json)
        .map_err(from_aml)
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<JobFilter>,
) -> ApiResult<JobListResponse> {
    let jobs = state.controller.list(filter.kind, filter.status).await;
    Ok(Json(JobListResponse {
        count: jobs.len(),
        jobs,
    }))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Job> {
    state.controller.get(&job_id).await.map(Json).map_err(from_aml)
}

pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Job> {
    state.controller.cancel(&job_id).await.map(Json).map_err(from_aml)
}
