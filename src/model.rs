//! Job and job-log types shared by the store, scheduler, executor and API.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{ExecutorConfig, MAX_TIMEOUT_SECS, MIN_TIMEOUT_SECS};
use crate::error::Result;
use crate::scheduler::cron::Schedule;

pub type JobId = Uuid;
pub type UserId = Uuid;

const MAX_NAME_LEN: usize = 200;

/// A request field that failed validation at the API boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP method
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            _ => Err(ValidationError::new(
                "method",
                format!(
                    "invalid HTTP method '{s}'. Supported methods: GET, POST, PUT, DELETE, PATCH, HEAD, OPTIONS"
                ),
            )),
        }
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(m: HttpMethod) -> Self {
        match m {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A scheduled HTTP call owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub name: String,
    pub schedule: String,
    pub endpoint: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub active: bool,
    /// Per-request timeout; the executor default applies when unset.
    pub timeout_secs: Option<u64>,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Start of the most recent scheduled fire.
    pub last_fired_at: Option<DateTime<Utc>>,
    /// When the job was created or last had its schedule or `active` flag changed.
    #[serde(skip)]
    pub armed_at: DateTime<Utc>,
}

impl Job {
    /// Validate a create request and build the job it describes.
    pub fn create(owner: UserId, req: NewJob, now: DateTime<Utc>, limits: &ExecutorConfig) -> Result<Self> {
        let job = Self {
            id: Uuid::new_v4(),
            user_id: owner,
            name: validate_name(&req.name)?,
            schedule: validate_schedule(&req.schedule, now)?,
            endpoint: validate_endpoint(&req.endpoint)?.to_string(),
            method: req.method.parse()?,
            headers: validate_headers(req.headers)?,
            body: req.body,
            active: req.active,
            timeout_secs: validate_timeout(req.timeout_secs, limits)?,
            retries: validate_retries(req.retries, limits)?,
            created_at: now,
            updated_at: now,
            last_fired_at: None,
            armed_at: now,
        };
        Ok(job)
    }

    /// Parse the stored schedule.
    pub fn parsed_schedule(&self) -> std::result::Result<Schedule, crate::scheduler::cron::CronError> {
        Schedule::parse(&self.schedule)
    }

    /// Next fire after `now`, or `None` for inactive or unschedulable jobs.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.active {
            return None;
        }
        self.parsed_schedule().ok()?.next_after(now).ok()
    }

    /// The point the schedule resumes from after a restart: the later of the
    /// last scheduled fire and the last time the job was (re)armed.
    pub fn resume_anchor(&self) -> DateTime<Utc> {
        match self.last_fired_at {
            Some(fired) => fired.max(self.armed_at),
            None => self.armed_at,
        }
    }
}

/// Body of `POST /api/jobs`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub schedule: String,
    pub endpoint: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: u32,
}

/// Body of `PUT /api/jobs/{id}`. Absent fields are left untouched; `body`
/// and `timeout_secs` may be set to `null` to clear them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobPatch {
    pub name: Option<String>,
    pub schedule: Option<String>,
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, deserialize_with = "present")]
    pub body: Option<Option<String>>,
    pub active: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    pub timeout_secs: Option<Option<u64>>,
    pub retries: Option<u32>,
}

/// What a patch changed, as far as the scheduler cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatchEffect {
    pub requeue: bool,
}

impl JobPatch {
    /// Validate the patch and apply it to `job`. On error `job` is unchanged.
    pub fn apply(self, job: &mut Job, now: DateTime<Utc>, limits: &ExecutorConfig) -> Result<PatchEffect> {
        let mut next = job.clone();

        if let Some(name) = self.name {
            next.name = validate_name(&name)?;
        }
        if let Some(schedule) = self.schedule {
            next.schedule = validate_schedule(&schedule, now)?;
        }
        if let Some(endpoint) = self.endpoint {
            next.endpoint = validate_endpoint(&endpoint)?.to_string();
        }
        if let Some(method) = self.method {
            next.method = method.parse()?;
        }
        if let Some(headers) = self.headers {
            next.headers = validate_headers(headers)?;
        }
        if let Some(body) = self.body {
            next.body = body;
        }
        if let Some(active) = self.active {
            next.active = active;
        }
        if let Some(timeout) = self.timeout_secs {
            next.timeout_secs = validate_timeout(timeout, limits)?;
        }
        if let Some(retries) = self.retries {
            next.retries = validate_retries(retries, limits)?;
        }

        let effect = PatchEffect {
            requeue: next.schedule != job.schedule || next.active != job.active,
        };
        next.updated_at = now;
        if effect.requeue {
            next.armed_at = now;
        }
        *job = next;
        Ok(effect)
    }
}

/// Distinguishes an explicit `null` from an absent field.
fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ---------------------------------------------------------------------------
// Field validation
// ---------------------------------------------------------------------------

fn validate_name(name: &str) -> std::result::Result<String, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::new("name", "must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::new(
            "name",
            format!("must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    Ok(name.to_string())
}

/// A schedule is accepted only if it parses and fires at least once more.
fn validate_schedule(expr: &str, now: DateTime<Utc>) -> Result<String> {
    let schedule = Schedule::parse(expr)?;
    schedule.next_after(now)?;
    Ok(schedule.to_string())
}

pub fn validate_endpoint(endpoint: &str) -> std::result::Result<Url, ValidationError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(ValidationError::new("endpoint", "endpoint URL is required"));
    }
    let url = Url::parse(endpoint).map_err(|e| {
        ValidationError::new(
            "endpoint",
            format!("invalid endpoint URL '{endpoint}': {e}. The URL must start with http:// or https://"),
        )
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::new(
            "endpoint",
            format!("unsupported scheme '{}'; use http or https", url.scheme()),
        ));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::new("endpoint", "URL has no host"));
    }
    Ok(url)
}

pub fn validate_headers(
    headers: BTreeMap<String, String>,
) -> std::result::Result<BTreeMap<String, String>, ValidationError> {
    for (name, value) in &headers {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ValidationError::new("headers", format!("invalid header name '{name}'")))?;
        HeaderValue::from_str(value).map_err(|_| {
            ValidationError::new("headers", format!("invalid value for header '{name}'"))
        })?;
    }
    Ok(headers)
}

fn validate_timeout(
    timeout: Option<u64>,
    limits: &ExecutorConfig,
) -> std::result::Result<Option<u64>, ValidationError> {
    match timeout {
        Some(secs) if secs < MIN_TIMEOUT_SECS || secs > limits.max_timeout_secs => {
            Err(ValidationError::new(
                "timeout_secs",
                format!(
                    "must be within {MIN_TIMEOUT_SECS}-{} seconds",
                    limits.max_timeout_secs.min(MAX_TIMEOUT_SECS)
                ),
            ))
        }
        other => Ok(other),
    }
}

fn validate_retries(retries: u32, limits: &ExecutorConfig) -> std::result::Result<u32, ValidationError> {
    if retries > limits.max_retries {
        return Err(ValidationError::new(
            "retries",
            format!("must be at most {}", limits.max_retries),
        ));
    }
    Ok(retries)
}

// ---------------------------------------------------------------------------
// Job log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    /// Run started, not yet finalized.
    Running,
    Success,
    Failure,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStatus::Running => "running",
            LogStatus::Success => "success",
            LogStatus::Failure => "failure",
        }
    }
}

impl FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(LogStatus::Running),
            "success" => Ok(LogStatus::Success),
            "failure" => Ok(LogStatus::Failure),
            other => Err(format!("unknown log status '{other}'")),
        }
    }
}

/// Record of one logical run of a job, retries included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobLog {
    pub id: Uuid,
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: LogStatus,
    pub response_code: Option<u16>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// HTTP attempts made, including the first.
    pub attempts: u32,
}

impl JobLog {
    /// A fresh, unfinalized record.
    pub fn started(job_id: JobId, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            started_at,
            finished_at: None,
            duration_ms: None,
            status: LogStatus::Running,
            response_code: None,
            error: None,
            response_body: None,
            attempts: 0,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.status != LogStatus::Running
    }

    /// Close the record. `finished_at` is clamped so it never precedes `started_at`.
    pub fn finish(&mut self, finished_at: DateTime<Utc>, status: LogStatus) {
        let finished_at = finished_at.max(self.started_at);
        self.finished_at = Some(finished_at);
        self.duration_ms = Some((finished_at - self.started_at).num_milliseconds());
        self.status = status;
    }
}
