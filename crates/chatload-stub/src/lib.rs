//! Stand-in for the OAuth and chat services, for local dry runs and tests.
//! Answers are canned; what matters is the wire contract.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone)]
pub struct StubOptions {
    pub client_id: String,
    pub client_secret: String,
    /// Artificial latency added to every `/ask/` call.
    pub answer_delay: Duration,
}

impl Default for StubOptions {
    fn default() -> Self {
        Self {
            client_id: "ai_develop_01".into(),
            client_secret: "abc123".into(),
            answer_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Exchange {
    pub question: String,
    pub answer: String,
}

#[derive(Clone)]
pub struct StubState {
    options: Arc<StubOptions>,
    tokens: Arc<Mutex<HashSet<String>>>,
    conversations: Arc<Mutex<HashMap<(String, String), Vec<Exchange>>>>,
}

impl StubState {
    pub fn new(options: StubOptions) -> Self {
        Self {
            options: Arc::new(options),
            tokens: Arc::new(Mutex::new(HashSet::new())),
            conversations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn issued_tokens(&self) -> usize { self.tokens.lock().len() }

    pub fn conversation(&self, user_id: &str, topic_id: &str) -> Vec<Exchange> {
        self.conversations
            .lock()
            .get(&(user_id.to_string(), topic_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

pub fn app(options: StubOptions) -> Router {
    router(StubState::new(options))
}

pub fn router(state: StubState) -> Router {
    Router::new()
        .route("/oauth/v1/health/", get(|| async { Json(json!({"status": "healthy", "service": "oauth"})) }))
        .route("/oauth/v1/token/", post(token))
        .route("/langgpt/v1/health/", get(|| async { Json(json!({"status": "healthy", "service": "ai-chat"})) }))
        .route("/langgpt/v1/ask/", post(ask))
        .route("/langgpt/v1/conversation/", post(conversation))
        .with_state(state)
}

fn detail(status: StatusCode, msg: &str) -> Response {
    (status, Json(json!({ "detail": msg }))).into_response()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn token(State(state): State<StubState>, headers: HeaderMap) -> Response {
    let (Some(id), Some(secret)) = (header(&headers, "client-id"), header(&headers, "client-secret")) else {
        return detail(StatusCode::UNPROCESSABLE_ENTITY, "client-id and client-secret headers are required");
    };
    if id != state.options.client_id || secret != state.options.client_secret {
        tracing::info!(target: "stub", client_id = id, "rejected token request");
        return detail(StatusCode::UNAUTHORIZED, "Access Denied");
    }
    let access_token = uuid::Uuid::new_v4().simple().to_string();
    state.tokens.lock().insert(access_token.clone());
    Json(json!({ "access_token": access_token, "token_type": "bearer" })).into_response()
}

fn authorized(state: &StubState, headers: &HeaderMap) -> bool {
    header(headers, "token")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| state.tokens.lock().contains(t.trim()))
        .unwrap_or(false)
}

#[derive(Deserialize)]
struct AskBody {
    user_id: Option<String>,
    topic_id: Option<String>,
    question: Option<String>,
    #[allow(dead_code)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct ConversationBody {
    user_id: Option<String>,
    topic_id: Option<String>,
}

async fn ask(State(state): State<StubState>, headers: HeaderMap, body: Option<Json<AskBody>>) -> Response {
    if !authorized(&state, &headers) {
        return detail(StatusCode::UNAUTHORIZED, "Invalid access token!");
    }
    let Some(Json(AskBody { user_id: Some(user), topic_id: Some(topic), question: Some(question), .. })) = body else {
        return detail(StatusCode::BAD_REQUEST, "data is required.");
    };
    if !state.options.answer_delay.is_zero() {
        tokio::time::sleep(state.options.answer_delay).await;
    }
    let answer = "I'm a bot".to_string();
    state
        .conversations
        .lock()
        .entry((user, topic))
        .or_default()
        .push(Exchange { question, answer: answer.clone() });
    Json(json!({ "data": { "answer": answer } })).into_response()
}

async fn conversation(State(state): State<StubState>, headers: HeaderMap, body: Option<Json<ConversationBody>>) -> Response {
    if !authorized(&state, &headers) {
        return detail(StatusCode::UNAUTHORIZED, "Invalid access token!");
    }
    let Some(Json(ConversationBody { user_id: Some(user), topic_id: Some(topic) })) = body else {
        return detail(StatusCode::BAD_REQUEST, "data is required.");
    };
    let history = state.conversation(&user, &topic);
    Json(json!({ "data": history })).into_response()
}
