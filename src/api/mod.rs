pub mod handlers;
pub mod types;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::automation::controller::AutomationController;

pub struct AppState {
    pub controller: Arc<AutomationController>,
}

pub fn router(controller: Arc<AutomationController>) -> Router {
    let state = Arc::new(AppState { controller });

    Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/address/{address}", get(handlers::address_detail))
        .route("/api/v1/address/{address}/analyze", post(handlers::analyze))
        .route("/api/v1/bulk", post(handlers::bulk))
        .route("/api/v1/automation/crawler", post(handlers::start_crawler))
        .route("/api/v1/automation/monitor", post(handlers::start_monitor))
        .route("/api/v1/automation/expansion", post(handlers::start_expansion))
        .route("/api/v1/automation/jobs", get(handlers::list_jobs))
        .route("/api/v1/automation/jobs/{job_id}", get(handlers::get_job))
        .route(
            "/api/v1/automation/jobs/{job_id}/cancel",
            post(handlers::cancel_job),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub async fn serve(controller: Arc<AutomationController>, host: &str, port: u16) -> eyre::Result<()> {
    let app = router(controller);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
