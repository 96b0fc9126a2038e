//! End-of-run report: a JSON document for tooling and a text rendering for
//! the console.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use chatload_common::Result;
use serde::Serialize;

use crate::metrics::{MetricSample, Registry, Stat};
use crate::scheduler::RunStats;
use crate::threshold::{ThresholdResult, ThresholdSet};

const TREND_STATS: [Stat; 6] = [
    Stat::Avg,
    Stat::Min,
    Stat::Med,
    Stat::Max,
    Stat::Percentile(90.0),
    Stat::Percentile(95.0),
];

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub test_run_duration_ms: f64,
    pub vus_max: usize,
    pub interrupted_iterations: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThresholdStatus {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricSummary {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub values: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub thresholds: BTreeMap<String, ThresholdStatus>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CheckSummary {
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunSummary {
    pub state: RunState,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub checks: Vec<CheckSummary>,
    pub thresholds_ok: bool,
}

impl RunSummary {
    pub fn build(registry: &Registry, stats: &RunStats, thresholds: &ThresholdSet, results: &[ThresholdResult]) -> Self {
        let elapsed = stats.duration;
        let mut metrics = BTreeMap::new();

        let mut names = registry.names();
        if !names.iter().any(|n| n == "checks") {
            names.push("checks".to_string());
        }
        for name in names {
            let kind = match registry.get(&name) {
                Some(m) => m.kind(),
                None => "rate",
            };
            if let Some(sample) = registry.sample(&name, &[], elapsed) {
                metrics.insert(name, MetricSummary { kind, values: values_of(&sample), thresholds: BTreeMap::new() });
            }
        }
        for (selector, metric, tags) in thresholds.submetric_selectors() {
            let kind = registry.get(&metric).map(|m| m.kind()).unwrap_or("trend");
            if let Some(sample) = registry.sample(&metric, &tags, elapsed) {
                metrics.insert(selector, MetricSummary { kind, values: values_of(&sample), thresholds: BTreeMap::new() });
            }
        }
        for r in results {
            if let Some(m) = metrics.get_mut(&r.threshold.selector) {
                m.thresholds.insert(r.threshold.expr.clone(), ThresholdStatus { ok: r.ok });
            }
        }

        let checks = registry
            .checks()
            .records()
            .into_iter()
            .map(|c| CheckSummary { name: c.name, passes: c.passes, fails: c.fails })
            .collect();

        Self {
            state: RunState {
                test_run_duration_ms: elapsed.as_secs_f64() * 1000.0,
                vus_max: stats.vus_max,
                interrupted_iterations: stats.interrupted,
            },
            metrics,
            checks,
            thresholds_ok: results.iter().all(|r| r.ok),
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for c in &self.checks {
            let mark = if c.fails == 0 { '✓' } else { '✗' };
            let _ = writeln!(out, "     {} {}", mark, c.name);
            if c.fails > 0 {
                let total = c.passes + c.fails;
                let _ = writeln!(
                    out,
                    "      ↳  {:.0}% — ✓ {} / ✗ {}",
                    c.passes as f64 * 100.0 / total as f64,
                    c.passes,
                    c.fails
                );
            }
        }
        if !self.checks.is_empty() {
            out.push('\n');
        }
        for (name, m) in &self.metrics {
            let mark = if m.thresholds.is_empty() {
                ' '
            } else if m.thresholds.values().all(|t| t.ok) {
                '✓'
            } else {
                '✗'
            };
            let label = match name.split_once('{') {
                Some((_, tags)) => format!("  {{ {} }}", tags.strip_suffix('}').unwrap_or(tags)),
                None => name.clone(),
            };
            let _ = writeln!(out, "   {} {:.<32}: {}", mark, format!("{label} "), render_values(m));
        }
        let _ = writeln!(
            out,
            "\n     running ({:.1}s), vus_max={}, interrupted iterations={}",
            self.state.test_run_duration_ms / 1000.0,
            self.state.vus_max,
            self.state.interrupted_iterations
        );
        out
    }
}

fn values_of(sample: &MetricSample) -> BTreeMap<String, f64> {
    let mut values = BTreeMap::new();
    match sample {
        MetricSample::Counter { count, per_second } => {
            values.insert("count".to_string(), *count as f64);
            values.insert("rate".to_string(), *per_second);
        }
        MetricSample::Rate { passes, fails, rate } => {
            values.insert("rate".to_string(), *rate);
            values.insert("passes".to_string(), *passes as f64);
            values.insert("fails".to_string(), *fails as f64);
        }
        MetricSample::Trend(_) => {
            for stat in TREND_STATS {
                if let Some(v) = sample.stat(stat) {
                    values.insert(stat.label(), v);
                }
            }
        }
    }
    values
}

fn render_values(m: &MetricSummary) -> String {
    let get = |k: &str| m.values.get(k).copied().unwrap_or(0.0);
    match m.kind {
        "counter" => format!("{} {:.2}/s", get("count"), get("rate")),
        "rate" => format!("{:.2}% ✓ {} ✗ {}", get("rate") * 100.0, get("passes"), get("fails")),
        _ => TREND_STATS
            .iter()
            .map(|s| format!("{}={}", s.label(), fmt_ms(get(&s.label()))))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn fmt_ms(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else {
        format!("{:.2}ms", ms)
    }
}
