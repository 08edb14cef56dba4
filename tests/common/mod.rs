//! Shared fixtures: a scripted transport and a service backed by a temp DB.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use cronix::clock::{Clock, SharedClock, TokioClock};
use cronix::config::Config;
use cronix::executor::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use cronix::storage::{self, Pool, User, UserStore};
use cronix::App;

/// How the fake endpoint answers one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16),
    Body(u16, String),
    /// Answer after a delay.
    Slow(Duration, u16),
    /// Never answer.
    Hang,
    Fail(TransportError),
}

/// A [`Transport`] that replays scripted replies, then a fallback.
pub struct FakeTransport {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    requests: Mutex<Vec<HttpRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTransport {
    pub fn new(fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn ok() -> Arc<Self> {
        Self::new(Reply::Status(200))
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn response(status: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status,
        status_text: status.to_string(),
        headers: Default::default(),
        body: body.as_bytes().to_vec(),
        truncated: false,
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: &HttpRequest, _timeout: Duration) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let reply = self.script.lock().pop_front().unwrap_or_else(|| self.fallback.clone());
        match reply {
            Reply::Status(status) => Ok(response(status, "")),
            Reply::Body(status, body) => Ok(response(status, &body)),
            Reply::Slow(delay, status) => {
                tokio::time::sleep(delay).await;
                Ok(response(status, ""))
            }
            Reply::Hang => std::future::pending().await,
            Reply::Fail(e) => Err(e),
        }
    }
}

/// Wall-clock start of every test: half a minute past midnight.
pub fn origin() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-01-01T00:00:30Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// A database with one signed-in user, before the service starts.
pub struct TestEnv {
    pub pool: Pool,
    pub clock: SharedClock,
    pub user: User,
    pub token: String,
    pub config: Config,
    _dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = storage::open_pool(&dir.path().join("cronix.db")).unwrap();
        let clock: SharedClock = Arc::new(TokioClock::starting_at(origin()));
        let users = UserStore::new(pool.clone());
        let user = users.upsert("ada@example.com", "Ada", clock.now()).unwrap();
        let token = users
            .create_session(user.id, clock.now(), chrono::Duration::days(7))
            .unwrap();

        let mut config = Config::default();
        config.executor.backoff_base_ms = 100;
        config.executor.backoff_max_ms = 1_000;

        Self {
            pool,
            clock,
            user,
            token,
            config,
            _dir: dir,
        }
    }

    pub async fn start(&self, transport: Arc<FakeTransport>) -> App {
        App::start(
            Arc::new(self.config.clone()),
            self.pool.clone(),
            self.clock.clone(),
            transport,
            CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    /// Call the API as the signed-in user.
    pub async fn call(&self, app: &App, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.call_with_token(app, method, uri, body, Some(&self.token)).await
    }

    pub async fn call_with_token(
        &self,
        app: &App,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let resp = app.router().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
        };
        (status, value)
    }

    /// Create a job through the API and return its id.
    pub async fn create_job(&self, app: &App, body: Value) -> String {
        let (status, job) = self.call(app, Method::POST, "/api/jobs", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED, "{job}");
        job["id"].as_str().unwrap().to_string()
    }
}

pub fn job_body(name: &str, schedule: &str, active: bool) -> Value {
    serde_json::json!({
        "name": name,
        "schedule": schedule,
        "endpoint": "http://hooks.test/ping",
        "method": "POST",
        "headers": {"X-Token": "abc"},
        "body": "{\"ping\":true}",
        "active": active,
    })
}
