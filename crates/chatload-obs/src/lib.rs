//! Prometheus mirror of the load generator's own activity, for scraping
//! while a long run is in progress.

use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder};

static HTTP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        "chatload_http_requests_total",
        "Requests issued against the target, by request type and status",
        &["type", "status"]
    )
    .expect("chatload_http_requests_total registers once")
});
static HTTP_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    prometheus::register_histogram_vec!(
        "chatload_http_request_duration_seconds",
        "Request latency observed by the load generator",
        &["type"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("chatload_http_request_duration_seconds registers once")
});
static VUS: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("chatload_vus", "Currently active virtual users")
        .expect("chatload_vus registers once")
});
static ITERATIONS: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("chatload_iterations_total", "Completed workflow iterations")
        .expect("chatload_iterations_total registers once")
});

pub fn init() {
    let _ = &*HTTP_REQUESTS;
    let _ = &*HTTP_DURATION;
    let _ = &*VUS;
    let _ = &*ITERATIONS;
}

/// `status` 0 means no response was received.
pub fn observe_request(kind: &str, status: u16, seconds: f64) {
    HTTP_REQUESTS.with_label_values(&[kind, &status.to_string()]).inc();
    HTTP_DURATION.with_label_values(&[kind]).observe(seconds);
}

pub fn set_vus(active: usize) {
    VUS.set(active as i64);
}

pub fn inc_iterations() {
    ITERATIONS.inc();
}

/// Text exposition of the default registry.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}
