use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::StorageError;
use crate::jobs::{Job, JobState, Scheduler, StateCounts};
use crate::mail::EmailPayload;

/// Fixed acknowledgement returned by the enqueue trigger.
pub const EMAIL_ACK: &str = "email sent";

#[derive(Clone, Debug)]
pub struct EmailDefaults {
    pub delay: Duration,
    pub to: String,
    pub template: String,
}

impl Default for EmailDefaults {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            to: "noreply@example.com".to_string(),
            template: "welcome".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Scheduler,
    pub email: EmailDefaults,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Enqueue trigger
        .route("/send-email", get(send_email_query).post(send_email_json))
        // Admin / inspect
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/replay", post(replay_job))
        .route("/dead-letters", get(list_dead_letters))
        // Metrics
        .route("/metrics", get(metrics))
        .route("/metrics/prom", get(metrics_prom))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn storage_err(e: StorageError) -> ApiError {
    tracing::error!(error = %e, "storage error in request");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("storage error: {e}"))
}

fn not_found(id: Uuid) -> ApiError {
    (StatusCode::NOT_FOUND, format!("job {id} not found"))
}

#[derive(Debug, Default, Deserialize)]
pub struct SendEmailRequest {
    pub to: Option<String>,
    pub template: Option<String>,
}

/// Enqueue a delayed send and answer immediately.
///
/// The response never reflects delivery; only a failed enqueue changes it.
async fn enqueue_email(state: &ApiState, req: SendEmailRequest) -> Result<&'static str, ApiError> {
    let email = EmailPayload::new(
        req.to
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| state.email.to.clone()),
        req.template
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| state.email.template.clone()),
    );

    let job_id = state
        .scheduler
        .enqueue(email.to_value(), state.email.delay)
        .await
        .map_err(storage_err)?;

    tracing::info!(%job_id, to = %email.to, template = %email.template, "email job enqueued");
    Ok(EMAIL_ACK)
}

pub async fn send_email_query(
    State(state): State<ApiState>,
    Query(req): Query<SendEmailRequest>,
) -> Result<&'static str, ApiError> {
    enqueue_email(&state, req).await
}

pub async fn send_email_json(
    State(state): State<ApiState>,
    Json(req): Json<SendEmailRequest>,
) -> Result<&'static str, ApiError> {
    enqueue_email(&state, req).await
}

pub async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    match state.scheduler.get(id).await.map_err(storage_err)? {
        Some(job) => Ok(Json(job)),
        None => Err(not_found(id)),
    }
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub cancelled: bool,
}

pub async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResponse>, ApiError> {
    if state.scheduler.cancel(id).await.map_err(storage_err)? {
        return Ok(Json(CancelResponse {
            job_id: id,
            cancelled: true,
        }));
    }

    match state.scheduler.get(id).await.map_err(storage_err)? {
        None => Err(not_found(id)),
        Some(job) => Err((
            StatusCode::CONFLICT,
            format!("job {id} is {} and cannot be cancelled", job.state),
        )),
    }
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub new_job_id: Uuid,
    pub replay_of_job_id: Uuid,
}

pub async fn replay_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReplayResponse>, ApiError> {
    if let Some(new_job_id) = state.scheduler.replay(id).await.map_err(storage_err)? {
        return Ok(Json(ReplayResponse {
            new_job_id,
            replay_of_job_id: id,
        }));
    }

    match state.scheduler.get(id).await.map_err(storage_err)? {
        None => Err(not_found(id)),
        Some(job) => Err((
            StatusCode::CONFLICT,
            format!("job {id} is {}; only dead-lettered jobs can be replayed", job.state),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub state: JobState,
    pub items: Vec<Job>,
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let job_state = match q.state.as_deref() {
        None => JobState::Pending,
        Some(s) => JobState::parse(s)
            .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown state {s:?}")))?,
    };

    let items = state
        .scheduler
        .list(job_state, q.limit.unwrap_or(100))
        .await
        .map_err(storage_err)?;

    Ok(Json(ListJobsResponse {
        state: job_state,
        items,
    }))
}

pub async fn list_dead_letters(
    State(state): State<ApiState>,
    Query(mut q): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    // force state=dead_lettered
    q.state = Some(JobState::DeadLettered.as_str().to_string());
    list_jobs(State(state), Query(q)).await
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub now_utc: DateTime<Utc>,
    pub counts: StateCounts,
}

pub async fn metrics(State(state): State<ApiState>) -> Result<Json<MetricsResponse>, ApiError> {
    let counts = state.scheduler.counts().await.map_err(storage_err)?;
    Ok(Json(MetricsResponse {
        now_utc: state.scheduler.now(),
        counts,
    }))
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Response {
    match state.scheduler.counts().await {
        Ok(counts) => {
            let mut body = String::from(concat!(
                "# HELP mailflow_jobs Number of jobs per state\n",
                "# TYPE mailflow_jobs gauge\n",
            ));
            for st in JobState::ALL {
                body.push_str(&format!(
                    "mailflow_jobs{{state=\"{}\"}} {}\n",
                    st.as_str(),
                    counts.get(st)
                ));
            }
            (StatusCode::OK, body).into_response()
        }
        Err(e) => storage_err(e).into_response(),
    }
}

pub async fn health() -> &'static str {
    "ok"
}
