//! `reqwest`-backed [`Transport`].

use std::time::Duration;

use async_trait::async_trait;
use chatload_common::{ChatloadError, Result};
use chatload_transport::{HttpRequest, HttpResponse, Transport, TransportError};
use reqwest::Client;

#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// One client is shared by every VU so connections are pooled.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(concat!("chatload/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ChatloadError::Http(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn finish(resp: reqwest::Response) -> std::result::Result<HttpResponse, TransportError> {
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(map_err)?;
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let mut builder = self.client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let resp = builder.send().await.map_err(map_err)?;
        Self::finish(resp).await
    }

    async fn get(&self, url: &str) -> std::result::Result<HttpResponse, TransportError> {
        let resp = self.client.get(url).send().await.map_err(map_err)?;
        Self::finish(resp).await
    }
}

fn map_err(e: reqwest::Error) -> TransportError {
    tracing::debug!(target: "http", error = %e, "transport error");
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}
