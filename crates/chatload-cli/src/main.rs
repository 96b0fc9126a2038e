use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{http::header, http::StatusCode, response::IntoResponse, routing::get, Router};
use chatload_common::config::LoadTestConfig;
use chatload_core::http::{probe_health, Session};
use chatload_core::metrics::Registry;
use chatload_core::scheduler::VuContext;
use chatload_core::workflow::ChatWorkflow;
use chatload_http::ReqwestTransport;
use clap::{Args, Parser, Subcommand};
use opentelemetry_otlp::WithExportConfig;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit status when the run completed but a threshold was crossed.
const THRESHOLDS_FAILED: u8 = 99;

#[derive(Parser, Debug)]
#[command(name = "chatload", version, about = "Load test for the chat and OAuth services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the staged ramp and evaluate thresholds
    Run(RunArgs),
    /// Run a single iteration with one VU and report what happened
    Smoke,
    /// Probe the health endpoints of both services
    Health,
    /// Serve a stand-in for both services on one port
    Stub(StubArgs),
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Where to write the JSON summary
    #[arg(short, long)]
    summary: Option<PathBuf>,
    /// Pause at the end of every iteration, in milliseconds
    #[arg(long)]
    think_time_ms: Option<u64>,
    /// Serve Prometheus metrics for the duration of the run
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Args, Debug)]
struct StubArgs {
    #[arg(short, long, default_value_t = 8000)]
    port: u16,
    /// Added latency per chat answer, in milliseconds
    #[arg(long, default_value_t = 0)]
    answer_delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_load(args).await,
        Commands::Smoke => smoke().await,
        Commands::Health => health().await,
        Commands::Stub(args) => serve_stub(args).await,
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_load(args: RunArgs) -> anyhow::Result<ExitCode> {
    let mut cfg = LoadTestConfig::load().context("loading config")?;
    if let Some(path) = args.summary {
        cfg.summary_path = path;
    }
    if let Some(ms) = args.think_time_ms {
        cfg.think_time = Duration::from_millis(ms);
    }

    chatload_obs::init();
    if let Some(addr) = args.metrics_addr {
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(addr).await {
                tracing::error!(%addr, error = %e, "metrics endpoint stopped");
            }
        });
    }

    tracing::info!(
        oauth = %cfg.target.base_url_oauth,
        chat = %cfg.target.base_url_chat,
        max_vus = cfg.max_vus(),
        duration_secs = cfg.total_duration().as_secs(),
        "starting load test"
    );
    let transport = Arc::new(ReqwestTransport::new(cfg.request_timeout)?);
    let report = chatload_core::run(&cfg, transport).await?;

    report
        .summary
        .write_json(&cfg.summary_path)
        .with_context(|| format!("writing summary to {}", cfg.summary_path.display()))?;
    println!("{}", report.summary.render_text());

    if report.passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::error!("some thresholds have failed");
        Ok(ExitCode::from(THRESHOLDS_FAILED))
    }
}

async fn smoke() -> anyhow::Result<ExitCode> {
    let cfg = LoadTestConfig::load().context("loading config")?;
    let registry = Registry::new();
    let transport = Arc::new(ReqwestTransport::new(cfg.request_timeout)?);
    let session = Session::new(transport, &registry)?;
    let workflow = ChatWorkflow::new(session, cfg.target.clone(), Duration::ZERO, &registry)?;

    let outcome = workflow.run_iteration(&VuContext { vu: 1, iteration: 0 }).await;
    for check in registry.checks().records() {
        let mark = if check.fails == 0 { '✓' } else { '✗' };
        println!("{} {}", mark, check.name);
    }
    match outcome {
        Ok(()) => {
            println!("iteration completed");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("iteration ended early: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn health() -> anyhow::Result<ExitCode> {
    let cfg = LoadTestConfig::load().context("loading config")?;
    let transport = ReqwestTransport::new(cfg.request_timeout)?;
    let mut all_healthy = true;
    for base in [&cfg.target.base_url_oauth, &cfg.target.base_url_chat] {
        let h = probe_health(&transport, base).await;
        println!("{} {} ({})", if h.healthy { "up  " } else { "DOWN" }, h.url, h.status);
        if !h.healthy {
            tracing::warn!(url = %h.url, status = h.status, detail = %h.detail, "service unhealthy");
        }
        all_healthy &= h.healthy;
    }
    Ok(if all_healthy { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn serve_stub(args: StubArgs) -> anyhow::Result<ExitCode> {
    let options = chatload_stub::StubOptions {
        answer_delay: Duration::from_millis(args.answer_delay_ms),
        ..Default::default()
    };
    let app: Router = chatload_stub::app(options);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await?;
    tracing::info!("stub listening on http://0.0.0.0:{}", args.port);
    tracing::info!(
        "point the run at it with BASE_URL_OAUTH=http://localhost:{0}/oauth/v1 BASE_URL_CHAT=http://localhost:{0}/langgpt/v1",
        args.port
    );
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(ExitCode::SUCCESS)
}

async fn serve_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(metrics));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics on http://{}/metrics", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics() -> impl IntoResponse {
    match chatload_obs::render() {
        Ok(body) => ([(header::CONTENT_TYPE, chatload_obs::content_type())], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .install_simple()
            .ok();
        if let Some(tracer) = tracer {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(OpenTelemetryLayer::new(tracer))
                .init();
            return;
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
