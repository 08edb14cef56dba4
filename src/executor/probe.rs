//! One-off endpoint probe behind `POST /api/jobs/test`.
//!
//! Lets a user try a request before saving it as a job. Nothing is
//! persisted and no retries are made.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::transport::{default_json_content_type, HttpRequest, HttpResponse, Transport};
use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::model::{validate_endpoint, validate_headers, HttpMethod};

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeRequest {
    pub endpoint: String,
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON when the body is JSON, the raw text otherwise, `null` when empty.
    pub body: Value,
}

impl From<HttpResponse> for ProbeResult {
    fn from(resp: HttpResponse) -> Self {
        let body = if resp.body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&resp.body).unwrap_or_else(|_| Value::String(resp.body_text()))
        };
        Self {
            status: resp.status,
            status_text: resp.status_text,
            headers: resp.headers,
            body,
        }
    }
}

pub async fn probe(transport: &dyn Transport, req: ProbeRequest, limits: &ExecutorConfig) -> Result<ProbeResult> {
    let url = validate_endpoint(&req.endpoint)?;
    let method: HttpMethod = req.method.parse()?;
    let mut request = HttpRequest {
        method,
        url: url.to_string(),
        headers: validate_headers(req.headers)?,
        body: req.body,
        body_limit: limits.probe_body_bytes,
    };
    default_json_content_type(&mut request);

    debug!(url = %request.url, method = %method, "Probing endpoint");
    let resp = transport
        .send(&request, limits.probe_timeout())
        .await
        .map_err(Error::Upstream)?;
    Ok(resp.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::transport::ReqwestTransport;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn req(endpoint: String, method: &str, body: Option<&str>) -> ProbeRequest {
        ProbeRequest {
            endpoint,
            method: method.into(),
            headers: BTreeMap::new(),
            body: body.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_probe_parses_json_and_defaults_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let result = probe(&transport, req(server.uri(), "post", Some("{}")), &ExecutorConfig::default())
            .await
            .unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.status_text, "200 OK");
        assert_eq!(result.body, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_probe_returns_text_bodies_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down for maintenance"))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let result = probe(&transport, req(server.uri(), "GET", None), &ExecutorConfig::default())
            .await
            .unwrap();
        assert_eq!(result.status, 503);
        assert_eq!(result.body, Value::String("down for maintenance".into()));
    }

    #[tokio::test]
    async fn test_probe_rejects_bad_input_before_sending() {
        let transport = ReqwestTransport::new().unwrap();
        let limits = ExecutorConfig::default();

        let err = probe(&transport, req("ftp://x/".into(), "GET", None), &limits).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = probe(&transport, req("http://x/".into(), "FETCH", None), &limits).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_probe_network_failure_is_upstream_error() {
        let transport = ReqwestTransport::new().unwrap();
        let err = probe(&transport, req("http://127.0.0.1:9/".into(), "GET", None), &ExecutorConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
    }

    #[test]
    fn test_empty_body_is_null() {
        let resp = HttpResponse {
            status: 204,
            status_text: "204 No Content".into(),
            headers: BTreeMap::new(),
            body: Vec::new(),
            truncated: false,
        };
        assert_eq!(ProbeResult::from(resp).body, Value::Null);
    }
}
