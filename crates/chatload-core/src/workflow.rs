//! The chat iteration: token, ask, history, think time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatload_common::config::TargetConfig;
use chatload_common::Result;
use chatload_transport::HttpRequest;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::http::{RequestKind, Response, Session};
use crate::metrics::{tags, Checks, Rate, Registry, Trend};
use crate::scheduler::{Scenario, VuContext};

pub const ERRORS: &str = "errors";
pub const SUCCESS_RATE: &str = "success_rate";
pub const REQUEST_DURATION: &str = "request_duration";
pub const GROUP_DURATION: &str = "group_duration";
/// Group the chat and history calls run under, in k6 `::name` form.
pub const CHAT_GROUP: &str = "::Chat API Tests";

/// Identity used by even VUs.
pub const USER_EVEN: &str = "dev_test006";
/// Identity used by odd VUs.
pub const USER_ODD: &str = "dev_test007";
pub const QUESTION: &str = "What is your name?";
pub const MODEL: &str = "GPT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub topic_id: String,
    pub question: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub user_id: String,
    pub topic_id: String,
}

/// The conversation one iteration talks about. Chat and history requests
/// are both built from the same value so they cannot drift apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Conversation {
    pub user_id: &'static str,
    pub topic_id: String,
}

impl Conversation {
    pub fn for_iteration(vu: &VuContext) -> Self {
        Self { user_id: user_for_vu(vu.vu), topic_id: format!("topic_{}_{}", vu.vu, vu.iteration) }
    }

    pub fn chat_request(&self) -> ChatRequest {
        ChatRequest {
            user_id: self.user_id.to_string(),
            topic_id: self.topic_id.clone(),
            question: QUESTION.to_string(),
            model: MODEL.to_string(),
        }
    }

    pub fn history_request(&self) -> HistoryRequest {
        HistoryRequest { user_id: self.user_id.to_string(), topic_id: self.topic_id.clone() }
    }
}

pub fn user_for_vu(vu: usize) -> &'static str {
    if vu % 2 == 0 { USER_EVEN } else { USER_ODD }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Why an iteration stopped short. None of these escape the iteration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("failed to get token: {status} {body}")]
    Auth { status: u16, body: String },
    #[error("chat request failed: {status} {body}")]
    ChatCheck { status: u16, body: String },
    #[error("history request failed: {status} {body}")]
    HistoryCheck { status: u16, body: String },
    #[error("could not encode request body: {0}")]
    Encode(String),
}

pub struct ChatWorkflow {
    session: Session,
    target: Arc<TargetConfig>,
    think_time: Duration,
    checks: Arc<Checks>,
    errors: Arc<Rate>,
    success_rate: Arc<Rate>,
    request_duration: Arc<Trend>,
    group_duration: Arc<Trend>,
}

impl ChatWorkflow {
    pub fn new(session: Session, target: TargetConfig, think_time: Duration, registry: &Registry) -> Result<Self> {
        Ok(Self {
            session,
            target: Arc::new(target),
            think_time,
            checks: registry.checks(),
            errors: registry.rate(ERRORS)?,
            success_rate: registry.rate(SUCCESS_RATE)?,
            request_duration: registry.trend(REQUEST_DURATION)?,
            group_duration: registry.trend(GROUP_DURATION)?,
        })
    }

    /// Runs every step except the think time. An `Err` means the iteration
    /// ended early; metrics have already been recorded either way.
    pub async fn run_iteration(&self, vu: &VuContext) -> std::result::Result<(), WorkflowError> {
        let token = match self.authenticate().await {
            Ok(token) => token,
            Err(e) => {
                self.errors.add(true);
                return Err(e);
            }
        };
        let conversation = Conversation::for_iteration(vu);
        let started = Instant::now();
        let outcome = self.chat_group(&token, &conversation).await;
        self.group_duration.add_duration(started.elapsed(), &tags(&[("group", CHAT_GROUP)]));
        outcome
    }

    async fn chat_group(&self, token: &str, conversation: &Conversation) -> std::result::Result<(), WorkflowError> {
        self.ask(token, conversation).await?;
        self.history(token, conversation).await
    }

    async fn authenticate(&self) -> std::result::Result<String, WorkflowError> {
        let request = HttpRequest::post(format!("{}/token/", self.target.base_url_oauth))
            .header("client-id", self.target.client_id.as_str())
            .header("client-secret", self.target.client_secret.as_str());
        let resp = self.session.post(RequestKind::Auth, request).await;
        let ok = self.checks.record("Token generated successfully", resp.status == 200);
        let token = serde_json::from_str::<TokenResponse>(&resp.body)
            .ok()
            .map(|t| t.access_token)
            .filter(|t| !t.is_empty());
        match token {
            Some(token) if ok => Ok(token),
            _ => Err(WorkflowError::Auth { status: resp.status, body: resp.describe() }),
        }
    }

    async fn ask(&self, token: &str, conversation: &Conversation) -> std::result::Result<(), WorkflowError> {
        let body = serde_json::to_vec(&conversation.chat_request()).map_err(|e| {
            self.errors.add(true);
            WorkflowError::Encode(e.to_string())
        })?;
        let request = HttpRequest::post(format!("{}/ask/", self.target.base_url_chat))
            .header("token", format!("Bearer {token}"))
            .json_body(body);
        let resp = self.session.post_in_group(CHAT_GROUP, RequestKind::Chat, request).await;

        let status_ok = self.checks.record("Chat status is 200", resp.status == 200);
        let data_ok = self.checks.record("Chat response has data", has_data(&resp, "chat"));
        let ok = status_ok && data_ok;

        self.success_rate.add(ok);
        self.errors.add(!ok);
        self.request_duration.add(resp.duration.as_secs_f64() * 1000.0);

        if ok {
            Ok(())
        } else {
            Err(WorkflowError::ChatCheck { status: resp.status, body: resp.describe() })
        }
    }

    async fn history(&self, token: &str, conversation: &Conversation) -> std::result::Result<(), WorkflowError> {
        let body = serde_json::to_vec(&conversation.history_request())
            .map_err(|e| WorkflowError::Encode(e.to_string()))?;
        let request = HttpRequest::post(format!("{}/conversation/", self.target.base_url_chat))
            .header("token", format!("Bearer {token}"))
            .json_body(body);
        let resp = self.session.post_in_group(CHAT_GROUP, RequestKind::History, request).await;

        let status_ok = self.checks.record("History status is 200", resp.status == 200);
        let data_ok = self.checks.record("History response has data", has_data(&resp, "history"));
        if status_ok && data_ok {
            Ok(())
        } else {
            Err(WorkflowError::HistoryCheck { status: resp.status, body: resp.describe() })
        }
    }
}

/// True when the body is JSON with a `data` key (null counts as present).
fn has_data(resp: &Response, what: &str) -> bool {
    match resp.json() {
        Ok(json) => json.get("data").is_some(),
        Err(_) => {
            tracing::error!(target: "workflow", body = %resp.describe(), "failed to parse {what} response");
            false
        }
    }
}

#[async_trait]
impl Scenario for ChatWorkflow {
    async fn iteration(&self, vu: &VuContext) {
        match self.run_iteration(vu).await {
            Ok(()) => {}
            Err(WorkflowError::HistoryCheck { status, body }) => {
                tracing::error!(target: "workflow", vu = vu.vu, iter = vu.iteration, status, body = %body, "history request failed");
            }
            Err(err) => {
                tracing::error!(target: "workflow", vu = vu.vu, iter = vu.iteration, error = %err, "iteration ended early");
            }
        }
        tokio::time::sleep(self.think_time).await;
    }
}
