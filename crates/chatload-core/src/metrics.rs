//! Write-only accumulators shared by every VU, plus the read side used by
//! thresholds and the summary once the run is over.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chatload_common::{ChatloadError, Result};
use parking_lot::Mutex;

/// Sorted `key:value` pairs attached to a sample.
pub type Tags = Vec<(String, String)>;

pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    let mut t: Tags = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    t.sort();
    t
}

#[derive(Debug, Default)]
pub struct Counter { value: AtomicU64 }

impl Counter {
    pub fn add(&self, n: u64) { self.value.fetch_add(n, Ordering::Relaxed); }
    pub fn inc(&self) { self.add(1) }
    pub fn get(&self) -> u64 { self.value.load(Ordering::Relaxed) }
}

/// Fraction of non-zero samples.
#[derive(Debug, Default)]
pub struct Rate {
    passes: AtomicU64,
    total: AtomicU64,
}

impl Rate {
    pub fn add(&self, sample: bool) {
        if sample { self.passes.fetch_add(1, Ordering::Relaxed); }
        self.total.fetch_add(1, Ordering::Relaxed);
    }
    pub fn passes(&self) -> u64 { self.passes.load(Ordering::Relaxed) }
    pub fn total(&self) -> u64 { self.total.load(Ordering::Relaxed) }
    pub fn fails(&self) -> u64 { self.total().saturating_sub(self.passes()) }
    pub fn rate(&self) -> f64 {
        let total = self.total();
        if total == 0 { 0.0 } else { self.passes() as f64 / total as f64 }
    }
}

/// Distribution of values (milliseconds for every trend this crate records),
/// grouped by tag set so tagged sub-metrics can be selected later.
#[derive(Debug, Default)]
pub struct Trend { groups: Mutex<Vec<(Tags, Vec<f64>)>> }

impl Trend {
    pub fn add(&self, value: f64) { self.add_tagged(value, &Tags::new()) }

    pub fn add_duration(&self, d: Duration, tags: &Tags) { self.add_tagged(d.as_secs_f64() * 1000.0, tags) }

    pub fn add_tagged(&self, value: f64, tags: &Tags) {
        let mut groups = self.groups.lock();
        match groups.iter_mut().find(|(t, _)| t == tags) {
            Some((_, values)) => values.push(value),
            None => groups.push((tags.clone(), vec![value])),
        }
    }

    /// Samples whose tags include every pair in `filter`.
    pub fn snapshot(&self, filter: &[(String, String)]) -> TrendSnapshot {
        let groups = self.groups.lock();
        let mut values: Vec<f64> = groups
            .iter()
            .filter(|(t, _)| filter.iter().all(|f| t.contains(f)))
            .flat_map(|(_, v)| v.iter().copied())
            .collect();
        drop(groups);
        values.sort_by(|a, b| a.total_cmp(b));
        TrendSnapshot { sorted: values }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrendSnapshot { sorted: Vec<f64> }

impl TrendSnapshot {
    pub fn from_values(mut values: Vec<f64>) -> Self {
        values.sort_by(|a, b| a.total_cmp(b));
        Self { sorted: values }
    }
    pub fn count(&self) -> usize { self.sorted.len() }
    pub fn min(&self) -> f64 { self.sorted.first().copied().unwrap_or(0.0) }
    pub fn max(&self) -> f64 { self.sorted.last().copied().unwrap_or(0.0) }
    pub fn avg(&self) -> f64 {
        if self.sorted.is_empty() { return 0.0; }
        self.sorted.iter().sum::<f64>() / self.sorted.len() as f64
    }
    pub fn med(&self) -> f64 { self.percentile(50.0) }

    /// Linear interpolation between the closest ranks; empty trends read as 0.
    pub fn percentile(&self, pct: f64) -> f64 {
        match self.sorted.len() {
            0 => 0.0,
            1 => self.sorted[0],
            n => {
                let i = (pct / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
                let lo = self.sorted[i.floor() as usize];
                let hi = self.sorted[i.ceil() as usize];
                lo + (hi - lo) * (i - i.floor())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRecord {
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

/// Named boolean assertions, kept in first-seen order.
#[derive(Debug, Default)]
pub struct Checks { records: Mutex<Vec<CheckRecord>> }

impl Checks {
    /// Records one evaluation and hands the result back.
    pub fn record(&self, name: &str, ok: bool) -> bool {
        let mut records = self.records.lock();
        let idx = match records.iter().position(|r| r.name == name) {
            Some(i) => i,
            None => {
                records.push(CheckRecord { name: name.to_string(), passes: 0, fails: 0 });
                records.len() - 1
            }
        };
        if ok { records[idx].passes += 1 } else { records[idx].fails += 1 }
        ok
    }

    pub fn records(&self) -> Vec<CheckRecord> { self.records.lock().clone() }

    pub fn totals(&self) -> (u64, u64) {
        self.records.lock().iter().fold((0, 0), |(p, f), r| (p + r.passes, f + r.fails))
    }
}

#[derive(Debug, Clone)]
pub enum Metric {
    Counter(Arc<Counter>),
    Rate(Arc<Rate>),
    Trend(Arc<Trend>),
}

impl Metric {
    pub fn kind(&self) -> &'static str {
        match self {
            Metric::Counter(_) => "counter",
            Metric::Rate(_) => "rate",
            Metric::Trend(_) => "trend",
        }
    }
}

/// Point-in-time aggregate of one metric (or a tagged slice of a trend).
#[derive(Debug, Clone, PartialEq)]
pub enum MetricSample {
    Counter { count: u64, per_second: f64 },
    Rate { passes: u64, fails: u64, rate: f64 },
    Trend(TrendSnapshot),
}

/// Aggregation a threshold or summary line reads from a [`MetricSample`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stat {
    Count,
    Rate,
    Avg,
    Min,
    Med,
    Max,
    Percentile(f64),
}

impl Stat {
    pub fn label(&self) -> String {
        match self {
            Stat::Count => "count".into(),
            Stat::Rate => "rate".into(),
            Stat::Avg => "avg".into(),
            Stat::Min => "min".into(),
            Stat::Med => "med".into(),
            Stat::Max => "max".into(),
            Stat::Percentile(p) => format!("p({})", p),
        }
    }
}

impl MetricSample {
    /// `None` when the stat does not apply to this kind of metric.
    pub fn stat(&self, stat: Stat) -> Option<f64> {
        match (self, stat) {
            (MetricSample::Counter { count, .. }, Stat::Count) => Some(*count as f64),
            (MetricSample::Counter { per_second, .. }, Stat::Rate) => Some(*per_second),
            (MetricSample::Rate { rate, .. }, Stat::Rate) => Some(*rate),
            (MetricSample::Rate { passes, fails, .. }, Stat::Count) => Some((passes + fails) as f64),
            (MetricSample::Trend(t), Stat::Count) => Some(t.count() as f64),
            (MetricSample::Trend(t), Stat::Avg) => Some(t.avg()),
            (MetricSample::Trend(t), Stat::Min) => Some(t.min()),
            (MetricSample::Trend(t), Stat::Med) => Some(t.med()),
            (MetricSample::Trend(t), Stat::Max) => Some(t.max()),
            (MetricSample::Trend(t), Stat::Percentile(p)) => Some(t.percentile(p)),
            _ => None,
        }
    }
}

/// Get-or-create store of named metrics for one run.
#[derive(Debug, Default)]
pub struct Registry {
    metrics: Mutex<BTreeMap<String, Metric>>,
    checks: Arc<Checks>,
}

macro_rules! get_or_create {
    ($fn:ident, $variant:ident, $ty:ty) => {
        pub fn $fn(&self, name: &str) -> Result<Arc<$ty>> {
            let mut metrics = self.metrics.lock();
            match metrics.get(name) {
                Some(Metric::$variant(m)) => Ok(m.clone()),
                Some(other) => Err(ChatloadError::Message(format!(
                    "metric '{}' already registered as {}",
                    name,
                    other.kind()
                ))),
                None => {
                    let m = Arc::new(<$ty>::default());
                    metrics.insert(name.to_string(), Metric::$variant(m.clone()));
                    Ok(m)
                }
            }
        }
    };
}

impl Registry {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    get_or_create!(counter, Counter, Counter);
    get_or_create!(rate, Rate, Rate);
    get_or_create!(trend, Trend, Trend);

    pub fn checks(&self) -> Arc<Checks> { self.checks.clone() }

    pub fn names(&self) -> Vec<String> { self.metrics.lock().keys().cloned().collect() }

    pub fn get(&self, name: &str) -> Option<Metric> { self.metrics.lock().get(name).cloned() }

    /// Aggregates `name`, restricted to `filter` tags. `checks` is synthesized
    /// from the check records. Tag filters only apply to trends.
    pub fn sample(&self, name: &str, filter: &[(String, String)], elapsed: Duration) -> Option<MetricSample> {
        if name == "checks" && filter.is_empty() && self.get(name).is_none() {
            let (passes, fails) = self.checks.totals();
            let total = passes + fails;
            let rate = if total == 0 { 0.0 } else { passes as f64 / total as f64 };
            return Some(MetricSample::Rate { passes, fails, rate });
        }
        match self.get(name)? {
            Metric::Trend(t) => Some(MetricSample::Trend(t.snapshot(filter))),
            _ if !filter.is_empty() => None,
            Metric::Counter(c) => {
                let secs = elapsed.as_secs_f64();
                let per_second = if secs > 0.0 { c.get() as f64 / secs } else { 0.0 };
                Some(MetricSample::Counter { count: c.get(), per_second })
            }
            Metric::Rate(r) => Some(MetricSample::Rate { passes: r.passes(), fails: r.fails(), rate: r.rate() }),
        }
    }
}
