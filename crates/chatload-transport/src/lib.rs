//! The seam between the workflow and the network. The real client lives in
//! `chatload-http`; tests script a [`mock::MockTransport`].

use async_trait::async_trait;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn post(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json_body(self, body: Vec<u8>) -> Self {
        let mut req = self.header("Content-Type", "application/json");
        req.body = Some(body);
        req
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self { status, body: body.into() }
    }
}

/// Failure to obtain any response at all (connect, timeout, read).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;
}

#[cfg(feature = "mock")]
pub mod mock {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    type Reply = Result<HttpResponse, TransportError>;

    /// Replies by URL suffix and records every request it sees.
    ///
    /// Each route holds a queue; the last reply in a queue is sticky so a
    /// single scripted reply serves any number of calls.
    #[derive(Default)]
    pub struct MockTransport {
        routes: Mutex<Vec<(String, VecDeque<Reply>)>>,
        calls: Mutex<Vec<HttpRequest>>,
    }

    impl MockTransport {
        pub fn new() -> Self { Self::default() }

        pub fn respond(self, suffix: &str, status: u16, body: &str) -> Self {
            self.push(suffix, Ok(HttpResponse::new(status, body)));
            self
        }

        pub fn fail(self, suffix: &str, err: TransportError) -> Self {
            self.push(suffix, Err(err));
            self
        }

        fn push(&self, suffix: &str, reply: Reply) {
            let mut routes = self.routes.lock();
            match routes.iter_mut().find(|(s, _)| s == suffix) {
                Some((_, queue)) => queue.push_back(reply),
                None => routes.push((suffix.to_string(), VecDeque::from([reply]))),
            }
        }

        pub fn calls(&self) -> Vec<HttpRequest> { self.calls.lock().clone() }

        pub fn calls_to(&self, suffix: &str) -> Vec<HttpRequest> {
            self.calls.lock().iter().filter(|r| r.url.ends_with(suffix)).cloned().collect()
        }

        fn reply(&self, request: HttpRequest) -> Reply {
            let url = request.url.clone();
            self.calls.lock().push(request);
            let mut routes = self.routes.lock();
            let Some((_, queue)) = routes.iter_mut().find(|(s, _)| url.ends_with(s.as_str())) else {
                return Ok(HttpResponse::new(404, r#"{"detail":"Not Found"}"#));
            };
            if queue.len() > 1 {
                queue.pop_front().unwrap_or_else(|| Err(TransportError::Other("empty route".into())))
            } else {
                queue.front().cloned().unwrap_or_else(|| Err(TransportError::Other("empty route".into())))
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.reply(request)
        }

        async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
            self.reply(HttpRequest { url: url.to_string(), ..HttpRequest::default() })
        }
    }
}
