//! Ramping-VU executor.
//!
//! A driver loop publishes the interpolated VU target on a `watch` channel
//! every tick. VU tasks are spawned lazily up to the highest target seen; VU
//! `n` keeps iterating while `n <= target` and parks otherwise, so its
//! iteration counter survives a ramp-down/ramp-up cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatload_common::config::{LoadTestConfig, Stage};
use chatload_common::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::metrics::{Counter, Registry, Tags, Trend};

pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";

/// Identity of one iteration: 1-based VU index, 0-based per-VU iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VuContext {
    pub vu: usize,
    pub iteration: u64,
}

/// Body of one iteration. Must return normally; failures belong in metrics.
#[async_trait]
pub trait Scenario: Send + Sync + 'static {
    async fn iteration(&self, vu: &VuContext);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStats {
    pub duration: Duration,
    pub iterations: u64,
    pub interrupted: u64,
    pub vus_max: usize,
}

#[derive(Debug, Clone)]
pub struct RampingVus {
    start_vus: usize,
    stages: Vec<Stage>,
    tick: Duration,
    graceful_stop: Duration,
}

impl RampingVus {
    pub fn new(start_vus: usize, stages: Vec<Stage>, tick: Duration, graceful_stop: Duration) -> Self {
        Self { start_vus, stages, tick, graceful_stop }
    }

    pub fn from_config(cfg: &LoadTestConfig) -> Self {
        Self::new(cfg.start_vus, cfg.stages.clone(), cfg.scheduler_tick, cfg.graceful_stop)
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Target VU count at `elapsed`. Ramps up round down and ramps down round
    /// up, so a stage never overshoots and lands exactly on its target.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        let mut from = self.start_vus;
        let mut stage_start = Duration::ZERO;
        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let frac = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                let value = from as f64 + (stage.target as f64 - from as f64) * frac;
                return if stage.target >= from { value.floor() as usize } else { value.ceil() as usize };
            }
            from = stage.target;
            stage_start = stage_end;
        }
        from
    }

    pub async fn run<S: Scenario>(&self, scenario: Arc<S>, registry: &Registry) -> Result<RunStats> {
        let iterations = registry.counter(ITERATIONS)?;
        let iteration_duration = registry.trend(ITERATION_DURATION)?;
        let total = self.total_duration();
        let started = Instant::now();

        let (tx, rx) = watch::channel(Some(self.target_at(Duration::ZERO)));
        let mut handles: Vec<JoinHandle<u64>> = Vec::new();
        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        tracing::info!(target: "scheduler", stages = self.stages.len(), total_secs = total.as_secs_f64(), "starting ramp");

        loop {
            ticker.tick().await;
            let elapsed = started.elapsed();
            if elapsed >= total {
                break;
            }
            let target = self.target_at(elapsed);
            while handles.len() < target {
                let vu = handles.len() + 1;
                tracing::debug!(target: "scheduler", vu, "spawning vu");
                handles.push(tokio::spawn(vu_loop(
                    vu,
                    scenario.clone(),
                    rx.clone(),
                    iterations.clone(),
                    iteration_duration.clone(),
                )));
            }
            let changed = tx.send_if_modified(|current| {
                if *current == Some(target) { return false; }
                *current = Some(target);
                true
            });
            if changed {
                tracing::debug!(target: "scheduler", target, elapsed_ms = elapsed.as_millis() as u64, "vu target changed");
                chatload_obs::set_vus(target);
            }
        }

        let _ = tx.send(None);
        chatload_obs::set_vus(0);
        let deadline = Instant::now() + self.graceful_stop;
        let mut interrupted = 0;
        for handle in handles.iter_mut() {
            match time::timeout_at(deadline, &mut *handle).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(target: "scheduler", error = %e, "vu task failed"),
                Err(_) => {
                    handle.abort();
                    interrupted += 1;
                }
            }
        }
        if interrupted > 0 {
            tracing::warn!(target: "scheduler", interrupted, "iterations cut off after graceful stop");
        }

        let stats = RunStats {
            duration: started.elapsed(),
            iterations: iterations.get(),
            interrupted,
            vus_max: handles.len(),
        };
        tracing::info!(target: "scheduler", iterations = stats.iterations, vus_max = stats.vus_max, "ramp finished");
        Ok(stats)
    }
}

async fn vu_loop<S: Scenario>(
    vu: usize,
    scenario: Arc<S>,
    mut rx: watch::Receiver<Option<usize>>,
    iterations: Arc<Counter>,
    iteration_duration: Arc<Trend>,
) -> u64 {
    let mut iteration = 0u64;
    loop {
        let state = *rx.borrow_and_update();
        match state {
            None => break,
            Some(target) if vu <= target => {
                let started = Instant::now();
                scenario.iteration(&VuContext { vu, iteration }).await;
                iteration_duration.add_duration(started.elapsed(), &Tags::new());
                iterations.inc();
                chatload_obs::inc_iterations();
                iteration += 1;
            }
            Some(_) => {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }
    iteration
}
