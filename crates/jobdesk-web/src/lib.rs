//! Axum JSON API over the ingestion pipeline and review workflow.

mod auth;
mod error;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use jobdesk_core::{
    Actor, Fingerprint, JobRecord, ListQuery, NormalizedJob, PageRequest, RawJob, Stage,
    ValidationErrors, DEFAULT_PER_PAGE,
};
use jobdesk_pipeline::{IngestPipeline, ReviewWorkflow};
use jobdesk_storage::JobStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub use auth::{Authorizer, StaticTokenAuthorizer, TokenConfigError};
pub use error::{ApiError, INTERNAL_DETAIL};

pub const CRATE_NAME: &str = "jobdesk-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub api_tokens: String,
    pub expose_errors: bool,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("JOBDESK_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            api_tokens: std::env::var("JOBDESK_API_TOKENS").unwrap_or_default(),
            expose_errors: std::env::var("JOBDESK_EXPOSE_ERRORS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    pub fn authorizer(&self) -> anyhow::Result<StaticTokenAuthorizer> {
        StaticTokenAuthorizer::parse(&self.api_tokens).context("parsing JOBDESK_API_TOKENS")
    }
}

pub struct AppState {
    pub ingest: Arc<IngestPipeline>,
    pub review: ReviewWorkflow,
    pub authorizer: Arc<dyn Authorizer>,
    pub expose_errors: bool,
}

impl AppState {
    pub fn new(ingest: Arc<IngestPipeline>, authorizer: Arc<dyn Authorizer>) -> Self {
        let review = ReviewWorkflow::new(Arc::clone(ingest.store()));
        Self {
            ingest,
            review,
            authorizer,
            expose_errors: false,
        }
    }

    pub fn with_expose_errors(mut self, expose_errors: bool) -> Self {
        self.expose_errors = expose_errors;
        self
    }

    fn actor(&self, headers: &HeaderMap) -> Result<Actor, ApiError> {
        auth::bearer_token(headers)
            .and_then(|token| self.authorizer.actor_for_token(token))
            .ok_or(ApiError::Unauthorized)
    }

    fn fail(&self, err: impl Into<ApiError>) -> ApiError {
        err.into().exposing(self.expose_errors)
    }
}

type Shared = Arc<AppState>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/ingest", post(ingest_handler))
        .route("/ingest/batch", post(ingest_batch_handler))
        .route("/jobs", get(jobs_handler))
        .route("/jobs/{id}", get(job_detail_handler))
        .route("/admin/pending", get(pending_handler))
        .route("/admin/rejected", get(rejected_handler))
        .route("/admin/approve", post(approve_handler))
        .route("/admin/reject", post(reject_handler))
        .route("/admin/bulk-approve", post(bulk_approve_handler))
        .route("/admin/bulk-reject", post(bulk_reject_handler))
        .route("/admin/stats", get(stats_handler))
        .route("/admin/repair", post(repair_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &WebConfig, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "jobdesk api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler failed; shutting down");
    }
    info!("shutdown requested");
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    page: Option<u32>,
    per_page: Option<u32>,
    q: Option<String>,
    source: Option<String>,
    location: Option<String>,
}

impl ListParams {
    fn into_query(self) -> Result<ListQuery, ValidationErrors> {
        let page = PageRequest::new(
            self.page.unwrap_or(1),
            self.per_page.unwrap_or(DEFAULT_PER_PAGE),
        )?;
        Ok(ListQuery {
            page,
            text: self.q,
            source: self.source,
            location: self.location,
        })
    }
}

fn list_query(params: Result<Query<ListParams>, QueryRejection>) -> Result<ListQuery, ApiError> {
    let Query(params) = params?;
    Ok(params.into_query()?)
}

/// Approved record as served publicly. The approver's identity is withheld.
#[derive(Debug, Serialize)]
struct PublicJob {
    id: Uuid,
    #[serde(flatten)]
    job: NormalizedJob,
    approved_at: Option<DateTime<Utc>>,
}

impl From<JobRecord> for PublicJob {
    fn from(record: JobRecord) -> Self {
        Self {
            approved_at: record.approved_at(),
            id: record.id,
            job: record.job,
        }
    }
}

#[derive(Debug, Serialize)]
struct Ingested {
    message: &'static str,
    fingerprint: Fingerprint,
}

#[derive(Debug, Serialize)]
struct Transitioned {
    message: &'static str,
    data: JobRecord,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    /// Items are decoded one by one so a single malformed entry cannot sink the batch.
    jobs: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct RejectRequest {
    job_id: String,
    reason: String,
}

#[derive(Debug, Deserialize)]
struct BulkApproveRequest {
    job_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BulkRejectRequest {
    job_ids: Vec<String>,
    reason: String,
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ready_handler(State(state): State<Shared>) -> Response {
    match state.ingest.store().count(Stage::Pending).await {
        Ok(_) => Json(json!({"status": "ready", "database": "connected"})).into_response(),
        Err(err) => {
            warn!(error = %err, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "not_ready", "database": "disconnected"})),
            )
                .into_response()
        }
    }
}

async fn ingest_handler(
    State(state): State<Shared>,
    payload: Result<Json<RawJob>, JsonRejection>,
) -> Result<(StatusCode, Json<Ingested>), ApiError> {
    let Json(raw) = payload?;
    let fingerprint = state.ingest.ingest(raw).await.map_err(|e| state.fail(e))?;
    Ok((
        StatusCode::CREATED,
        Json(Ingested {
            message: "Job ingested successfully",
            fingerprint,
        }),
    ))
}

async fn ingest_batch_handler(
    State(state): State<Shared>,
    payload: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(batch) = payload?;
    let items = batch
        .jobs
        .into_iter()
        .map(|item| serde_json::from_value::<RawJob>(item).map_err(|e| e.to_string()))
        .collect();
    let report = state
        .ingest
        .ingest_decoded(items)
        .await
        .map_err(|e| state.fail(e))?;
    Ok((StatusCode::CREATED, Json(report)).into_response())
}

async fn jobs_handler(
    State(state): State<Shared>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let query = list_query(params)?;
    let page = state
        .review
        .list_approved(&query)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(page.map(PublicJob::from)).into_response())
}

async fn job_detail_handler(
    State(state): State<Shared>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let record = state
        .review
        .get_approved(&id)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(PublicJob::from(record)).into_response())
}

async fn pending_handler(
    State(state): State<Shared>,
    headers: HeaderMap,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let actor = state.actor(&headers)?;
    let mut query = list_query(params)?;
    query.location = None;
    let page = state
        .review
        .list_pending(&actor, &query)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(page).into_response())
}

async fn rejected_handler(
    State(state): State<Shared>,
    headers: HeaderMap,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let actor = state.actor(&headers)?;
    let mut query = list_query(params)?;
    query.location = None;
    let page = state
        .review
        .list_rejected(&actor, &query)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(page).into_response())
}

async fn approve_handler(
    State(state): State<Shared>,
    headers: HeaderMap,
    payload: Result<Json<ApproveRequest>, JsonRejection>,
) -> Result<Json<Transitioned>, ApiError> {
    let actor = state.actor(&headers)?;
    let Json(request) = payload?;
    let record = state
        .review
        .approve(&actor, &request.job_id)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(Transitioned {
        message: "Job approved successfully",
        data: record,
    }))
}

async fn reject_handler(
    State(state): State<Shared>,
    headers: HeaderMap,
    payload: Result<Json<RejectRequest>, JsonRejection>,
) -> Result<Json<Transitioned>, ApiError> {
    let actor = state.actor(&headers)?;
    let Json(request) = payload?;
    let record = state
        .review
        .reject(&actor, &request.job_id, &request.reason)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(Transitioned {
        message: "Job rejected successfully",
        data: record,
    }))
}

async fn bulk_approve_handler(
    State(state): State<Shared>,
    headers: HeaderMap,
    payload: Result<Json<BulkApproveRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let actor = state.actor(&headers)?;
    let Json(request) = payload?;
    let report = state
        .review
        .bulk_approve(&actor, &request.job_ids)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(report).into_response())
}

async fn bulk_reject_handler(
    State(state): State<Shared>,
    headers: HeaderMap,
    payload: Result<Json<BulkRejectRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let actor = state.actor(&headers)?;
    let Json(request) = payload?;
    let report = state
        .review
        .bulk_reject(&actor, &request.job_ids, &request.reason)
        .await
        .map_err(|e| state.fail(e))?;
    Ok(Json(report).into_response())
}

async fn stats_handler(
    State(state): State<Shared>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let actor = state.actor(&headers)?;
    let stats = state.review.stats(&actor).await.map_err(|e| state.fail(e))?;
    Ok(Json(stats).into_response())
}

async fn repair_handler(
    State(state): State<Shared>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let actor = state.actor(&headers)?;
    let report = state.review.repair(&actor).await.map_err(|e| state.fail(e))?;
    Ok(Json(report).into_response())
}
