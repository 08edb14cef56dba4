//! API route definitions.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::auth::{session_token, CurrentUser, SESSION_COOKIE};
use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::error::Error;
use crate::executor::probe::{self, ProbeRequest, ProbeResult};
use crate::model::{Job, JobId, JobLog, JobPatch, NewJob};
use crate::storage::{RetentionPolicy, User};

const DEFAULT_JOB_PAGE: u32 = 20;
const DEFAULT_LOG_PAGE: u32 = 50;
const MAX_PAGE: u32 = 100;
const DEFAULT_PREVIEW: usize = 5;
const MAX_PREVIEW: usize = 50;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/profile", get(profile))
        .route("/auth/logout", post(logout))
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/test", post(test_endpoint))
        .route("/api/jobs/cleanup-logs", post(cleanup_logs))
        .route("/api/jobs/{id}", get(get_job).put(update_job).delete(delete_job))
        .route("/api/jobs/{id}/run", post(run_job))
        .route("/api/jobs/{id}/logs", get(list_logs))
        .route("/api/jobs/{id}/next-runs", get(next_runs))
}

/// A job as returned to clients.
#[derive(Debug, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    /// Next scheduled fire; `null` for inactive jobs.
    pub next_run_at: Option<DateTime<Utc>>,
}

impl JobView {
    fn new(job: Job, now: DateTime<Utc>) -> Self {
        let next_run_at = job.next_run_after(now);
        Self { job, next_run_at }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Page {
    limit: Option<u32>,
    offset: Option<u32>,
}

impl Page {
    fn resolve(&self, default_limit: u32) -> (u32, u32) {
        let limit = self.limit.unwrap_or(default_limit).clamp(1, MAX_PAGE);
        (limit, self.offset.unwrap_or(0))
    }
}

#[derive(Debug, Default, Deserialize)]
struct Preview {
    count: Option<usize>,
}

fn parse_id(raw: &str) -> ApiResult<JobId> {
    raw.parse().map_err(|_| ApiError::not_found())
}

/// Load a job the caller owns; anything else is "not found".
fn owned_job(state: &AppState, raw_id: &str, owner: &User) -> ApiResult<Job> {
    let id = parse_id(raw_id)?;
    state
        .jobs
        .get_owned(id, owner.id)?
        .ok_or_else(|| Error::JobNotFound(id).into())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let scheduled = state.scheduler.snapshot().await.map(|q| q.len());
    let status = if scheduled.is_ok() { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "scheduled_jobs": scheduled.unwrap_or(0),
        "running_jobs": state.dispatcher.running_count(),
    }))
}

async fn profile(CurrentUser(user): CurrentUser) -> Json<User> {
    Json(user)
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<impl IntoResponse> {
    if let Some(token) = session_token(&headers) {
        state.users.revoke(&token)?;
    }
    let clear = format!("{SESSION_COOKIE}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax");
    Ok((
        [(SET_COOKIE, clear)],
        Json(json!({ "message": "Logged out successfully" })),
    ))
}

async fn create_job(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    payload: Result<Json<NewJob>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<JobView>)> {
    let Json(req) = payload?;
    let now = state.clock.now();
    let job = Job::create(user.id, req, now, &state.config.executor)?;
    state.jobs.insert(&job)?;

    // The job is saved either way; a stopped scheduler only delays it.
    if let Err(e) = state.scheduler.register(&job).await {
        warn!(job_id = %job.id, error = %e, "Created job could not be scheduled");
    }
    info!(job_id = %job.id, user_id = %user.id, active = job.active, schedule = %job.schedule, "Job created");
    Ok((StatusCode::CREATED, Json(JobView::new(job, now))))
}

async fn list_jobs(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    page: Result<Query<Page>, QueryRejection>,
) -> ApiResult<Json<Vec<JobView>>> {
    let Query(page) = page?;
    let (limit, offset) = page.resolve(DEFAULT_JOB_PAGE);
    let now = state.clock.now();
    let jobs = state.jobs.list_by_user(user.id, limit, offset)?;
    Ok(Json(jobs.into_iter().map(|j| JobView::new(j, now)).collect()))
}

async fn get_job(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    let job = owned_job(&state, &id, &user)?;
    Ok(Json(JobView::new(job, state.clock.now())))
}

async fn update_job(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
    payload: Result<Json<JobPatch>, JsonRejection>,
) -> ApiResult<Json<JobView>> {
    let mut job = owned_job(&state, &id, &user)?;
    let Json(patch) = payload?;
    let now = state.clock.now();
    let effect = patch.apply(&mut job, now, &state.config.executor)?;
    if !state.jobs.update(&job)? {
        return Err(Error::JobNotFound(job.id).into());
    }

    if effect.requeue {
        if let Err(e) = state.scheduler.register(&job).await {
            warn!(job_id = %job.id, error = %e, "Updated job could not be rescheduled");
        }
    }
    info!(job_id = %job.id, active = job.active, requeued = effect.requeue, "Job updated");
    Ok(Json(JobView::new(job, now)))
}

async fn delete_job(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = parse_id(&id)?;
    if !state.jobs.delete(id, user.id)? {
        return Err(Error::JobNotFound(id).into());
    }
    if let Err(e) = state.scheduler.remove(id).await {
        // Harmless: the dispatcher skips jobs missing from the store.
        warn!(job_id = %id, error = %e, "Deleted job could not be dequeued");
    }
    info!(job_id = %id, "Job deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn run_job(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<JobLog>> {
    let job = owned_job(&state, &id, &user)?;
    info!(job_id = %job.id, "Manual run requested");
    let log = state.dispatcher.run_now(job).await?;
    Ok(Json(log))
}

async fn list_logs(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
    page: Result<Query<Page>, QueryRejection>,
) -> ApiResult<Json<Vec<JobLog>>> {
    let job = owned_job(&state, &id, &user)?;
    let Query(page) = page?;
    let (limit, offset) = page.resolve(DEFAULT_LOG_PAGE);
    Ok(Json(state.logs.list(job.id, limit, offset)?))
}

async fn next_runs(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
    preview: Result<Query<Preview>, QueryRejection>,
) -> ApiResult<Json<Vec<DateTime<Utc>>>> {
    let job = owned_job(&state, &id, &user)?;
    let Query(preview) = preview?;
    let count = preview.count.unwrap_or(DEFAULT_PREVIEW);
    if !(1..=MAX_PREVIEW).contains(&count) {
        return Err(ApiError::bad_request(format!("count must be within 1-{MAX_PREVIEW}")));
    }
    let schedule = job.parsed_schedule().map_err(Error::from)?;
    Ok(Json(schedule.upcoming(state.clock.now(), count)))
}

async fn test_endpoint(
    State(state): State<AppState>,
    CurrentUser(_user): CurrentUser,
    payload: Result<Json<ProbeRequest>, JsonRejection>,
) -> ApiResult<Json<ProbeResult>> {
    let Json(req) = payload?;
    let result = probe::probe(state.transport.as_ref(), req, &state.config.executor).await?;
    Ok(Json(result))
}

async fn cleanup_logs(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Value>> {
    let policy = RetentionPolicy::from(&state.config.logs);
    let report = state.logs.cleanup(&policy, state.clock.now())?;
    info!(
        user_id = %user.id,
        expired = report.expired,
        over_cap = report.over_cap,
        "Log cleanup requested"
    );
    Ok(Json(json!({
        "deleted": report.total(),
        "expired": report.expired,
        "over_cap": report.over_cap,
        "message": format!("Deleted {} old log entries", report.total()),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_defaults_and_clamping() {
        assert_eq!(Page::default().resolve(20), (20, 0));
        let page = Page {
            limit: Some(1000),
            offset: Some(40),
        };
        assert_eq!(page.resolve(20), (MAX_PAGE, 40));
        let page = Page {
            limit: Some(0),
            offset: None,
        };
        assert_eq!(page.resolve(50), (1, 0));
    }

    #[test]
    fn test_malformed_ids_read_as_not_found() {
        assert_eq!(parse_id("not-a-uuid").unwrap_err().status(), StatusCode::NOT_FOUND);
        assert!(parse_id(&uuid::Uuid::new_v4().to_string()).is_ok());
    }
}
