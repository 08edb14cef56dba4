//! Outbound HTTP transport.
//!
//! The executor and the endpoint probe talk to the network only through
//! [`Transport`], so the retry and timeout policy can be exercised without
//! sockets.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Url};
use thiserror::Error;

use crate::model::{HttpMethod, Job};

/// A fully described outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    /// Response bodies are truncated to this many bytes.
    pub body_limit: usize,
}

impl HttpRequest {
    pub fn for_job(job: &Job, body_limit: usize) -> Self {
        Self {
            method: job.method,
            url: job.endpoint.clone(),
            headers: job.headers.clone(),
            body: job.body.clone(),
            body_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Status line, e.g. `"404 Not Found"`.
    pub status_text: String,
    /// First value of each response header.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// Whether `body` was cut at the request's limit.
    pub truncated: bool,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The request could not be built; retrying cannot help.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::InvalidRequest(_))
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Perform one HTTP exchange, giving up after `timeout`.
    async fn send(&self, request: &HttpRequest, timeout: Duration) -> Result<HttpResponse, TransportError>;
}

/// [`Transport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(concat!("cronix/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { client })
    }

    fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, TransportError> {
        let mut map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::InvalidRequest(format!("invalid header name '{name}'")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| TransportError::InvalidRequest(format!("invalid value for header '{name}'")))?;
            map.insert(name, value);
        }
        Ok(map)
    }

    async fn exchange(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = Url::parse(&request.url)
            .map_err(|e| TransportError::InvalidRequest(format!("invalid URL '{}': {e}", request.url)))?;
        let headers = Self::header_map(&request.headers)?;

        let mut builder = self
            .client
            .request(request.method.into(), url)
            .headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let mut resp = builder.send().await.map_err(classify)?;

        let status = resp.status();
        let status_text = match status.canonical_reason() {
            Some(reason) => format!("{} {}", status.as_u16(), reason),
            None => status.as_u16().to_string(),
        };
        let mut headers = BTreeMap::new();
        for (name, value) in resp.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_string())
                    .or_insert_with(|| value.to_string());
            }
        }

        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = resp.chunk().await.map_err(classify)? {
            let room = request.body_limit.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text,
            headers,
            body,
            truncated,
        })
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest, timeout: Duration) -> Result<HttpResponse, TransportError> {
        match tokio::time::timeout(timeout, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

/// Add `Content-Type: application/json` when a body is sent without one.
pub fn default_json_content_type(request: &mut HttpRequest) {
    if request.body.is_none() {
        return;
    }
    let has_content_type = request
        .headers
        .keys()
        .any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));
    if !has_content_type {
        request
            .headers
            .insert(CONTENT_TYPE.as_str().to_string(), "application/json".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(url: String) -> HttpRequest {
        HttpRequest {
            method: HttpMethod::Get,
            url,
            headers: BTreeMap::new(),
            body: None,
            body_limit: 1024,
        }
    }

    #[tokio::test]
    async fn test_sends_method_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-token", "abc"))
            .and(body_string("{\"k\":1}"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("x-reply", "yes")
                    .set_body_string("created"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut req = request(format!("{}/hook", server.uri()));
        req.method = HttpMethod::Post;
        req.headers.insert("X-Token".into(), "abc".into());
        req.body = Some("{\"k\":1}".into());

        let transport = ReqwestTransport::new().unwrap();
        let resp = transport.send(&req, Duration::from_secs(5)).await.unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(resp.status_text, "201 Created");
        assert!(resp.is_success());
        assert_eq!(resp.headers.get("x-reply").map(String::as_str), Some("yes"));
        assert_eq!(resp.body_text(), "created");
        assert!(!resp.truncated);
    }

    #[tokio::test]
    async fn test_truncates_large_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(5000)))
            .mount(&server)
            .await;

        let mut req = request(server.uri());
        req.body_limit = 100;
        let resp = ReqwestTransport::new()
            .unwrap()
            .send(&req, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.body.len(), 100);
        assert!(resp.truncated);
    }

    #[tokio::test]
    async fn test_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = ReqwestTransport::new()
            .unwrap()
            .send(&request(server.uri()), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::from_millis(100)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        // Port 9 (discard) is closed on test hosts.
        let err = ReqwestTransport::new()
            .unwrap()
            .send(&request("http://127.0.0.1:9/".into()), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }

    #[test]
    fn test_default_json_content_type() {
        let mut req = request("http://x/".into());
        default_json_content_type(&mut req);
        assert!(req.headers.is_empty());

        req.body = Some("{}".into());
        default_json_content_type(&mut req);
        assert_eq!(req.headers.get("content-type").map(String::as_str), Some("application/json"));

        let mut req = request("http://x/".into());
        req.body = Some("a=1".into());
        req.headers.insert("Content-Type".into(), "text/plain".into());
        default_json_content_type(&mut req);
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.headers.get("Content-Type").map(String::as_str), Some("text/plain"));
    }
}
