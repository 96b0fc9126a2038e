//! Metered request session: every call goes through here so the built-in
//! request metrics are recorded the same way for all request types.

use std::sync::Arc;
use std::time::Duration;

use chatload_common::Result;
use chatload_transport::{HttpRequest, Transport, TransportError};
use tokio::time::Instant;

use crate::metrics::{tags, Counter, Rate, Registry, Tags, Trend};

pub const HTTP_REQS: &str = "http_reqs";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Auth,
    Chat,
    History,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Auth => "auth",
            RequestKind::Chat => "chat",
            RequestKind::History => "history",
        }
    }
}

/// Outcome of one request. Transport failures arrive as status 0 with the
/// error kept alongside, so callers only ever branch on status and body.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: String,
    pub duration: Duration,
    pub error: Option<TransportError>,
}

impl Response {
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.body)
    }

    /// Body for log lines; falls back to the transport error.
    pub fn describe(&self) -> String {
        match &self.error {
            Some(e) => e.to_string(),
            None => self.body.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Session {
    transport: Arc<dyn Transport>,
    reqs: Arc<Counter>,
    duration: Arc<Trend>,
    failed: Arc<Rate>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, registry: &Registry) -> Result<Self> {
        Ok(Self {
            transport,
            reqs: registry.counter(HTTP_REQS)?,
            duration: registry.trend(HTTP_REQ_DURATION)?,
            failed: registry.rate(HTTP_REQ_FAILED)?,
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> { &self.transport }

    pub async fn post(&self, kind: RequestKind, request: HttpRequest) -> Response {
        self.send(kind, None, request).await
    }

    /// Like [`Session::post`], with the sample also tagged `group`.
    pub async fn post_in_group(&self, group: &str, kind: RequestKind, request: HttpRequest) -> Response {
        self.send(kind, Some(group), request).await
    }

    async fn send(&self, kind: RequestKind, group: Option<&str>, request: HttpRequest) -> Response {
        let url = request.url.clone();
        let started = Instant::now();
        let result = self.transport.post(request).await;
        let duration = started.elapsed();
        let response = match result {
            Ok(r) => Response { status: r.status, body: r.body, duration, error: None },
            Err(e) => {
                tracing::warn!(target: "http", %url, kind = kind.as_str(), error = %e, "request got no response");
                Response { status: 0, body: String::new(), duration, error: Some(e) }
            }
        };
        self.record(kind, group, &response);
        response
    }

    fn record(&self, kind: RequestKind, group: Option<&str>, response: &Response) {
        let t: Tags = match group {
            Some(group) => tags(&[("type", kind.as_str()), ("group", group)]),
            None => tags(&[("type", kind.as_str())]),
        };
        self.reqs.inc();
        self.duration.add_duration(response.duration, &t);
        self.failed.add(response.status == 0 || response.status >= 400);
        chatload_obs::observe_request(kind.as_str(), response.status, response.duration.as_secs_f64());
    }
}

/// Result of probing a service's `/health/` endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Health {
    pub url: String,
    pub status: u16,
    pub healthy: bool,
    pub detail: String,
}

pub async fn probe_health(transport: &dyn Transport, base_url: &str) -> Health {
    let url = format!("{}/health/", base_url.trim_end_matches('/'));
    match transport.get(&url).await {
        Ok(r) => {
            let healthy = r.status == 200
                && serde_json::from_str::<serde_json::Value>(&r.body)
                    .ok()
                    .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(|s| s == "healthy"))
                    .unwrap_or(false);
            Health { url, status: r.status, healthy, detail: r.body }
        }
        Err(e) => Health { url, status: 0, healthy: false, detail: e.to_string() },
    }
}
