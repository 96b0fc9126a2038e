//! Load-generation runtime and the chat workflow it drives.

pub mod http;
pub mod metrics;
pub mod scheduler;
pub mod summary;
pub mod threshold;
pub mod workflow;

use std::sync::Arc;

use chatload_common::config::LoadTestConfig;
use chatload_common::Result;
use chatload_transport::Transport;

use crate::metrics::Registry;
use crate::scheduler::RampingVus;
use crate::summary::RunSummary;
use crate::threshold::ThresholdSet;
use crate::workflow::ChatWorkflow;

/// Everything a finished run produced.
pub struct RunReport {
    pub summary: RunSummary,
    pub registry: Arc<Registry>,
}

impl RunReport {
    pub fn passed(&self) -> bool { self.summary.thresholds_ok }
}

/// Runs the configured ramp of [`ChatWorkflow`] iterations and evaluates
/// thresholds. Thresholds are parsed up front so a typo fails before load
/// is generated.
pub async fn run(cfg: &LoadTestConfig, transport: Arc<dyn Transport>) -> Result<RunReport> {
    let thresholds = ThresholdSet::parse(&cfg.thresholds)?;
    let registry = Registry::new();
    let session = http::Session::new(transport, &registry)?;
    let workflow = Arc::new(ChatWorkflow::new(session, cfg.target.clone(), cfg.think_time, &registry)?);

    let stats = RampingVus::from_config(cfg).run(workflow, &registry).await?;
    let results = thresholds.evaluate(&registry, stats.duration);
    let summary = RunSummary::build(&registry, &stats, &thresholds, &results);
    Ok(RunReport { summary, registry })
}
