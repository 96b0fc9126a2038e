use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ChatloadError, Result};

/// Endpoints and client credentials of the system under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub base_url_oauth: String,
    pub base_url_chat: String,
    pub client_id: String,
    pub client_secret: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url_oauth: "http://localhost:8001/oauth/v1".into(),
            base_url_chat: "http://localhost:8002/langgpt/v1".into(),
            client_id: "ai_develop_01".into(),
            client_secret: "abc123".into(),
        }
    }
}

/// One segment of the VU ramp: move linearly to `target` over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "crate::duration::serde")]
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadTestConfig {
    pub target: TargetConfig,
    /// VUs active before the first stage starts ramping.
    pub start_vus: usize,
    pub stages: Vec<Stage>,
    /// Metric selector (`http_req_duration{type:chat}`) to threshold expressions.
    pub thresholds: BTreeMap<String, Vec<String>>,
    pub summary_path: PathBuf,
    #[serde(with = "crate::duration::serde")]
    pub think_time: Duration,
    #[serde(with = "crate::duration::serde")]
    pub request_timeout: Duration,
    #[serde(with = "crate::duration::serde")]
    pub scheduler_tick: Duration,
    #[serde(with = "crate::duration::serde")]
    pub graceful_stop: Duration,
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        let secs = Duration::from_secs;
        let mut thresholds = BTreeMap::new();
        thresholds.insert("http_req_duration".to_string(), vec!["p(95)<5000".to_string()]);
        thresholds.insert("http_req_duration{type:chat}".to_string(), vec!["p(95)<10000".to_string()]);
        thresholds.insert("errors".to_string(), vec!["rate<0.1".to_string()]);
        Self {
            target: TargetConfig::default(),
            start_vus: 1,
            stages: vec![
                Stage::new(secs(10), 2),
                Stage::new(secs(30), 2),
                Stage::new(secs(20), 5),
                Stage::new(secs(30), 5),
                Stage::new(secs(10), 0),
            ],
            thresholds,
            summary_path: PathBuf::from("src/tests/load/summary.json"),
            think_time: secs(1),
            request_timeout: secs(60),
            scheduler_tick: Duration::from_millis(100),
            graceful_stop: secs(30),
        }
    }
}

impl LoadTestConfig {
    /// Loads `CHATLOAD_CONFIG` (YAML) when set, then applies environment overrides.
    pub fn load() -> Result<Self> {
        let mut cfg = match env::var("CHATLOAD_CONFIG") {
            Ok(path) => Self::from_yaml(&std::fs::read_to_string(path)?)?,
            Err(_) => Self::default(),
        };
        cfg.apply_env(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Overrides fields from variables resolved by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BASE_URL_OAUTH") { self.target.base_url_oauth = v; }
        if let Some(v) = lookup("BASE_URL_CHAT") { self.target.base_url_chat = v; }
        if let Some(v) = lookup("CLIENT_ID") { self.target.client_id = v; }
        if let Some(v) = lookup("CLIENT_SECRET") { self.target.client_secret = v; }
        if let Some(v) = lookup("CHATLOAD_SUMMARY_PATH") { self.summary_path = PathBuf::from(v); }
        if let Some(v) = lookup("CHATLOAD_THINK_TIME_MS") { self.think_time = Duration::from_millis(parse_num("CHATLOAD_THINK_TIME_MS", &v)?); }
        if let Some(v) = lookup("CHATLOAD_TIMEOUT_SECS") { self.request_timeout = Duration::from_secs(parse_num("CHATLOAD_TIMEOUT_SECS", &v)?); }
        if let Some(v) = lookup("CHATLOAD_TICK_MS") { self.scheduler_tick = Duration::from_millis(parse_num("CHATLOAD_TICK_MS", &v)?); }
        if let Some(v) = lookup("CHATLOAD_GRACEFUL_STOP_SECS") { self.graceful_stop = Duration::from_secs(parse_num("CHATLOAD_GRACEFUL_STOP_SECS", &v)?); }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(ChatloadError::Config("at least one stage is required".into()));
        }
        if self.scheduler_tick.is_zero() {
            return Err(ChatloadError::Config("scheduler_tick must be greater than zero".into()));
        }
        for (name, url) in [("base_url_oauth", &self.target.base_url_oauth), ("base_url_chat", &self.target.base_url_chat)] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ChatloadError::Config(format!("{name} must be an http(s) URL, got '{url}'")));
            }
        }
        Ok(())
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    pub fn max_vus(&self) -> usize {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0).max(self.start_vus)
    }
}

fn parse_num(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| ChatloadError::Config(format!("{key} must be a non-negative integer, got '{value}'")))
}
