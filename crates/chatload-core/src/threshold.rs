//! Pass/fail conditions over aggregated metrics, written as
//! `metric{tag:value}` selectors with expressions like `p(95)<5000`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chatload_common::{ChatloadError, Result};

use crate::metrics::{Registry, Stat, Tags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Op::Lt => lhs < rhs,
            Op::Le => lhs <= rhs,
            Op::Gt => lhs > rhs,
            Op::Ge => lhs >= rhs,
            Op::Eq => lhs == rhs,
            Op::Ne => lhs != rhs,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    /// Selector as written, e.g. `http_req_duration{type:chat}`.
    pub selector: String,
    pub metric: String,
    pub tags: Tags,
    /// Expression as written, e.g. `p(95)<10000`.
    pub expr: String,
    pub stat: Stat,
    pub op: Op,
    pub value: f64,
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.selector, self.expr)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdResult {
    pub threshold: Threshold,
    pub observed: Option<f64>,
    pub ok: bool,
}

pub fn parse_selector(selector: &str) -> Result<(String, Tags)> {
    let err = |reason: &str| ChatloadError::Threshold { expr: selector.to_string(), reason: reason.to_string() };
    let selector = selector.trim();
    let Some(open) = selector.find('{') else {
        if selector.is_empty() { return Err(err("empty metric name")); }
        return Ok((selector.to_string(), Tags::new()));
    };
    let inner = selector[open + 1..].strip_suffix('}').ok_or_else(|| err("unterminated tag filter"))?;
    let name = selector[..open].trim();
    if name.is_empty() {
        return Err(err("empty metric name"));
    }
    let mut tags = Tags::new();
    for pair in inner.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once(':').ok_or_else(|| err("tag filters must be key:value"))?;
        tags.push((k.trim().to_string(), v.trim().to_string()));
    }
    tags.sort();
    Ok((name.to_string(), tags))
}

pub fn parse_expr(expr: &str) -> Result<(Stat, Op, f64)> {
    let err = |reason: String| ChatloadError::Threshold { expr: expr.to_string(), reason };
    const OPS: [(&str, Op); 6] = [
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("==", Op::Eq),
        ("!=", Op::Ne),
        ("<", Op::Lt),
        (">", Op::Gt),
    ];
    let (pos, token, op) = OPS
        .iter()
        .filter_map(|(tok, op)| expr.find(tok).map(|pos| (pos, *tok, *op)))
        .min_by_key(|(pos, tok, _)| (*pos, std::cmp::Reverse(tok.len())))
        .ok_or_else(|| err("missing comparison operator".into()))?;
    let lhs = expr[..pos].trim();
    let rhs = expr[pos + token.len()..].trim();
    let value: f64 = rhs.parse().map_err(|_| err(format!("'{rhs}' is not a number")))?;
    let stat = match lhs {
        "count" => Stat::Count,
        "rate" => Stat::Rate,
        "avg" => Stat::Avg,
        "min" => Stat::Min,
        "med" => Stat::Med,
        "max" => Stat::Max,
        other => {
            let pct = other
                .strip_prefix("p(")
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(|| err(format!("unknown aggregation '{other}'")))?;
            let pct: f64 = pct.trim().parse().map_err(|_| err(format!("bad percentile '{pct}'")))?;
            if !(0.0..=100.0).contains(&pct) {
                return Err(err(format!("percentile {pct} out of range")));
            }
            Stat::Percentile(pct)
        }
    };
    Ok((stat, op, value))
}

/// All thresholds of a run, in selector order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdSet {
    entries: Vec<Threshold>,
}

impl ThresholdSet {
    pub fn parse(config: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut entries = Vec::new();
        for (selector, exprs) in config {
            let (metric, tags) = parse_selector(selector)?;
            for expr in exprs {
                let (stat, op, value) = parse_expr(expr)?;
                entries.push(Threshold {
                    selector: selector.trim().to_string(),
                    metric: metric.clone(),
                    tags: tags.clone(),
                    expr: expr.trim().to_string(),
                    stat,
                    op,
                    value,
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[Threshold] { &self.entries }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Tagged selectors, which the summary reports as sub-metrics.
    pub fn submetric_selectors(&self) -> Vec<(String, String, Tags)> {
        let mut out: Vec<(String, String, Tags)> = Vec::new();
        for t in self.entries.iter().filter(|t| !t.tags.is_empty()) {
            if !out.iter().any(|(s, _, _)| s == &t.selector) {
                out.push((t.selector.clone(), t.metric.clone(), t.tags.clone()));
            }
        }
        out
    }

    /// Unknown metrics and stats that do not apply to the metric fail.
    pub fn evaluate(&self, registry: &Registry, elapsed: Duration) -> Vec<ThresholdResult> {
        self.entries
            .iter()
            .map(|t| {
                let observed = registry.sample(&t.metric, &t.tags, elapsed).and_then(|s| s.stat(t.stat));
                let ok = observed.map(|v| t.op.apply(v, t.value)).unwrap_or(false);
                if !ok {
                    tracing::warn!(target: "threshold", threshold = %t, ?observed, "threshold crossed");
                }
                ThresholdResult { threshold: t.clone(), observed, ok }
            })
            .collect()
    }
}
