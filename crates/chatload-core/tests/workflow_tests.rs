use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chatload_common::config::TargetConfig;
use chatload_core::http::Session;
use chatload_core::metrics::{tags, Registry};
use chatload_core::scheduler::{Scenario, VuContext};
use chatload_core::workflow::{ChatRequest, ChatWorkflow, HistoryRequest, WorkflowError, USER_EVEN, USER_ODD};
use chatload_transport::mock::MockTransport;
use chatload_transport::TransportError;
use parking_lot::Mutex;

const TOKEN_OK: &str = r#"{"access_token":"tok1","token_type":"bearer"}"#;
const ASK_OK: &str = r#"{"data":{"answer":"I'm a bot"}}"#;
const HISTORY_OK: &str = r#"{"data":[{"question":"What is your name?","answer":"I'm a bot"}]}"#;

fn setup(mock: MockTransport) -> (Arc<MockTransport>, Arc<Registry>, ChatWorkflow) {
    let mock = Arc::new(mock);
    let registry = Registry::new();
    let session = Session::new(mock.clone(), &registry).unwrap();
    let workflow = ChatWorkflow::new(session, TargetConfig::default(), Duration::from_secs(1), &registry).unwrap();
    (mock, registry, workflow)
}

fn happy_mock() -> MockTransport {
    MockTransport::new()
        .respond("/token/", 200, TOKEN_OK)
        .respond("/ask/", 200, ASK_OK)
        .respond("/conversation/", 200, HISTORY_OK)
}

/// Collects formatted log lines written while the returned guard is alive.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
}

impl LogCapture {
    fn contents(&self) -> String { String::from_utf8_lossy(&self.0.lock()).into_owned() }
}

fn capture_logs() -> (LogCapture, tracing::subscriber::DefaultGuard) {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    (capture, tracing::subscriber::set_default(subscriber))
}

fn vu(vu: usize, iteration: u64) -> VuContext {
    VuContext { vu, iteration }
}

#[tokio::test(start_paused = true)]
async fn full_iteration_records_success_and_paces() {
    let (mock, registry, workflow) = setup(happy_mock());

    let started = tokio::time::Instant::now();
    workflow.iteration(&vu(1, 0)).await;
    assert!(started.elapsed() >= Duration::from_secs(1));

    let success = registry.rate("success_rate").unwrap();
    assert_eq!((success.passes(), success.total()), (1, 1));
    let errors = registry.rate("errors").unwrap();
    assert_eq!((errors.passes(), errors.total()), (0, 1));
    assert_eq!(registry.trend("request_duration").unwrap().snapshot(&[]).count(), 1);
    let chat = registry.trend("http_req_duration").unwrap().snapshot(&tags(&[("type", "chat")]));
    assert_eq!(chat.count(), 1);
    assert_eq!(registry.counter("http_reqs").unwrap().get(), 3);
    assert!(registry.checks().records().iter().all(|c| c.fails == 0 && c.passes == 1));

    let token = &mock.calls_to("/token/")[0];
    assert_eq!(token.header_value("client-id"), Some("ai_develop_01"));
    assert_eq!(token.header_value("client-secret"), Some("abc123"));
    assert!(token.body.is_none());

    let ask = &mock.calls_to("/ask/")[0];
    assert_eq!(ask.url, "http://localhost:8002/langgpt/v1/ask/");
    assert_eq!(ask.header_value("token"), Some("Bearer tok1"));
    assert_eq!(ask.header_value("content-type"), Some("application/json"));
    let body: ChatRequest = serde_json::from_slice(ask.body.as_deref().unwrap()).unwrap();
    assert_eq!(body.user_id, USER_ODD);
    assert_eq!(body.topic_id, "topic_1_0");
    assert_eq!(body.question, "What is your name?");
    assert_eq!(body.model, "GPT");
}

#[tokio::test(start_paused = true)]
async fn auth_rejection_stops_the_iteration() {
    let mock = MockTransport::new()
        .respond("/token/", 401, r#"{"detail":"Access Denied"}"#)
        .respond("/ask/", 200, ASK_OK)
        .respond("/conversation/", 200, HISTORY_OK);
    let (mock, registry, workflow) = setup(mock);

    let err = workflow.run_iteration(&vu(2, 0)).await.unwrap_err();
    assert_eq!(err, WorkflowError::Auth { status: 401, body: r#"{"detail":"Access Denied"}"#.into() });

    let errors = registry.rate("errors").unwrap();
    assert_eq!((errors.passes(), errors.total()), (1, 1));
    assert_eq!(registry.rate("success_rate").unwrap().total(), 0);
    assert_eq!(registry.trend("request_duration").unwrap().snapshot(&[]).count(), 0);
    assert!(mock.calls_to("/ask/").is_empty());
    assert!(mock.calls_to("/conversation/").is_empty());
}

#[tokio::test(start_paused = true)]
async fn auth_failure_still_observes_think_time() {
    let mock = MockTransport::new().respond("/token/", 503, "unavailable");
    let (_mock, _registry, workflow) = setup(mock);
    let started = tokio::time::Instant::now();
    workflow.iteration(&vu(1, 0)).await;
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn token_without_access_token_is_an_auth_failure() {
    let mock = MockTransport::new().respond("/token/", 200, r#"{"token":"x"}"#);
    let (mock, registry, workflow) = setup(mock);
    assert!(matches!(workflow.run_iteration(&vu(1, 0)).await, Err(WorkflowError::Auth { status: 200, .. })));
    assert_eq!(registry.rate("errors").unwrap().passes(), 1);
    assert_eq!(mock.calls().len(), 1);
}

#[tokio::test]
async fn failed_chat_skips_history() {
    let mock = MockTransport::new()
        .respond("/token/", 200, TOKEN_OK)
        .respond("/ask/", 500, r#"{"detail":"internal server error"}"#)
        .respond("/conversation/", 200, HISTORY_OK);
    let (mock, registry, workflow) = setup(mock);

    let err = workflow.run_iteration(&vu(1, 0)).await.unwrap_err();
    assert!(matches!(err, WorkflowError::ChatCheck { status: 500, .. }));
    assert!(mock.calls_to("/conversation/").is_empty());
    let errors = registry.rate("errors").unwrap();
    assert_eq!((errors.passes(), errors.total()), (1, 1));
    let success = registry.rate("success_rate").unwrap();
    assert_eq!((success.passes(), success.total()), (0, 1));
    assert_eq!(registry.trend("request_duration").unwrap().snapshot(&[]).count(), 1);
    assert_eq!(registry.rate("http_req_failed").unwrap().passes(), 1);
}

#[tokio::test]
async fn unparseable_or_dataless_chat_body_fails_the_check() {
    for body in ["<html>oops</html>", r#"{"answer":"no envelope"}"#] {
        let mock = MockTransport::new()
            .respond("/token/", 200, TOKEN_OK)
            .respond("/ask/", 200, body)
            .respond("/conversation/", 200, HISTORY_OK);
        let (mock, registry, workflow) = setup(mock);

        assert!(matches!(workflow.run_iteration(&vu(1, 0)).await, Err(WorkflowError::ChatCheck { status: 200, .. })));
        assert!(mock.calls_to("/conversation/").is_empty());
        assert_eq!(registry.rate("errors").unwrap().passes(), 1);
        let checks = registry.checks().records();
        let data = checks.iter().find(|c| c.name == "Chat response has data").unwrap();
        assert_eq!((data.passes, data.fails), (0, 1));
        let status = checks.iter().find(|c| c.name == "Chat status is 200").unwrap();
        assert_eq!((status.passes, status.fails), (1, 0));
    }
}

#[tokio::test]
async fn null_data_counts_as_present() {
    let mock = MockTransport::new()
        .respond("/token/", 200, TOKEN_OK)
        .respond("/ask/", 200, r#"{"data":null}"#)
        .respond("/conversation/", 200, HISTORY_OK);
    let (_mock, _registry, workflow) = setup(mock);
    assert!(workflow.run_iteration(&vu(1, 0)).await.is_ok());
}

#[tokio::test]
async fn chat_transport_error_is_a_soft_failure() {
    let mock = MockTransport::new()
        .respond("/token/", 200, TOKEN_OK)
        .fail("/ask/", TransportError::Timeout);
    let (_mock, registry, workflow) = setup(mock);

    let err = workflow.run_iteration(&vu(1, 0)).await.unwrap_err();
    assert_eq!(err, WorkflowError::ChatCheck { status: 0, body: "request timed out".into() });
    assert_eq!(registry.rate("errors").unwrap().passes(), 1);
}

#[tokio::test]
async fn history_failure_does_not_count_as_error() {
    let mock = MockTransport::new()
        .respond("/token/", 200, TOKEN_OK)
        .respond("/ask/", 200, ASK_OK)
        .respond("/conversation/", 404, r#"{"detail":"Not Found"}"#);
    let (mock, registry, workflow) = setup(mock);

    let err = workflow.run_iteration(&vu(3, 2)).await.unwrap_err();
    assert!(matches!(err, WorkflowError::HistoryCheck { status: 404, .. }));
    assert_eq!(mock.calls_to("/conversation/").len(), 1);
    let errors = registry.rate("errors").unwrap();
    assert_eq!((errors.passes(), errors.total()), (0, 1));
    assert_eq!(registry.rate("success_rate").unwrap().rate(), 1.0);
    let history = registry.checks().records().into_iter().find(|c| c.name == "History status is 200").unwrap();
    assert_eq!(history.fails, 1);
}

#[tokio::test]
async fn chat_and_history_share_user_and_topic() {
    let (mock, _registry, workflow) = setup(happy_mock());

    for v in 1..=4 {
        for i in 0..3 {
            workflow.run_iteration(&vu(v, i)).await.unwrap();
        }
    }

    let asks = mock.calls_to("/ask/");
    let histories = mock.calls_to("/conversation/");
    assert_eq!(asks.len(), 12);
    assert_eq!(histories.len(), 12);

    let mut topics = HashSet::new();
    for (n, (ask, hist)) in asks.iter().zip(&histories).enumerate() {
        let chat: ChatRequest = serde_json::from_slice(ask.body.as_deref().unwrap()).unwrap();
        let history: HistoryRequest = serde_json::from_slice(hist.body.as_deref().unwrap()).unwrap();
        let v = n / 3 + 1;
        let expected_user = if v % 2 == 0 { USER_EVEN } else { USER_ODD };
        assert_eq!(chat.user_id, expected_user);
        assert_eq!(history.user_id, chat.user_id);
        assert_eq!(history.topic_id, chat.topic_id);
        assert_eq!(chat.topic_id, format!("topic_{}_{}", v, n % 3));
        assert!(topics.insert(chat.topic_id));
        assert_eq!(hist.header_value("token"), Some("Bearer tok1"));
    }
}

#[tokio::test(start_paused = true)]
async fn history_failure_is_logged_with_status_and_body() {
    let mock = MockTransport::new()
        .respond("/token/", 200, TOKEN_OK)
        .respond("/ask/", 200, ASK_OK)
        .respond("/conversation/", 404, r#"{"detail":"Not Found"}"#);
    let (_mock, registry, workflow) = setup(mock);
    let (logs, _guard) = capture_logs();

    workflow.iteration(&vu(3, 2)).await;

    let out = logs.contents();
    assert!(out.contains("ERROR"), "{out}");
    assert!(out.contains("history request failed"), "{out}");
    assert!(out.contains("status=404"), "{out}");
    assert!(out.contains("Not Found"), "{out}");
    assert!(!out.contains("iteration ended early"), "{out}");
    assert_eq!(registry.rate("errors").unwrap().passes(), 0);
}

#[tokio::test(start_paused = true)]
async fn successful_iteration_logs_nothing_at_warn_or_above() {
    let (_mock, _registry, workflow) = setup(happy_mock());
    let (logs, _guard) = capture_logs();

    workflow.iteration(&vu(1, 0)).await;

    assert_eq!(logs.contents(), "");
}

#[tokio::test(start_paused = true)]
async fn chat_failure_is_logged_as_an_early_end() {
    let mock = MockTransport::new()
        .respond("/token/", 200, TOKEN_OK)
        .respond("/ask/", 500, r#"{"detail":"internal server error"}"#);
    let (_mock, _registry, workflow) = setup(mock);
    let (logs, _guard) = capture_logs();

    workflow.iteration(&vu(1, 0)).await;

    let out = logs.contents();
    assert!(out.contains("iteration ended early"), "{out}");
    assert!(out.contains("chat request failed: 500"), "{out}");
}

#[tokio::test]
async fn chat_and_history_run_inside_the_chat_group() {
    let (_mock, registry, workflow) = setup(happy_mock());
    workflow.run_iteration(&vu(1, 0)).await.unwrap();

    let group = tags(&[("group", "::Chat API Tests")]);
    assert_eq!(registry.trend("group_duration").unwrap().snapshot(&group).count(), 1);
    let grouped = registry.trend("http_req_duration").unwrap().snapshot(&group);
    assert_eq!(grouped.count(), 2);
    let auth = registry.trend("http_req_duration").unwrap().snapshot(&tags(&[("type", "auth")]));
    assert_eq!(auth.count(), 1);
    let auth_in_group = tags(&[("group", "::Chat API Tests"), ("type", "auth")]);
    assert_eq!(registry.trend("http_req_duration").unwrap().snapshot(&auth_in_group).count(), 0);
}

#[tokio::test]
async fn failed_auth_never_enters_the_chat_group() {
    let mock = MockTransport::new().respond("/token/", 401, r#"{"detail":"Access Denied"}"#);
    let (_mock, registry, workflow) = setup(mock);
    assert!(workflow.run_iteration(&vu(1, 0)).await.is_err());
    assert_eq!(registry.trend("group_duration").unwrap().snapshot(&[]).count(), 0);
}
