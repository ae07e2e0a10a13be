//! Runtime configuration, read from `TOLL_*` environment variables.

use crate::application::retry::RetryPolicy;
use crate::domain::ledger::{Charge, DEFAULT_CHARGE};
use crate::domain::workflow::ActivityCategory;
use crate::error::{Result, TollError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Detections must be strictly above this percentage to be considered.
    pub min_confidence: u8,
    /// Charge applied to every toll event unless the event says otherwise.
    pub default_charge: Charge,
    pub operator_email: Option<String>,
    pub sender_email: Option<String>,
    /// Base of the resumption links, always ending in `/`.
    pub resume_base_url: String,
    /// Chance in `[0, 1]` that the decision stage injects a transient failure.
    pub random_failure_probability: f64,
    pub ledger_table: String,
    pub manual_review_queue: String,
    pub insufficient_credit_queue: String,
    pub secret_id: String,
    /// Reload the plate pattern after this many runs; `None` keeps it until
    /// an explicit refresh.
    pub pattern_refresh_runs: Option<u32>,
    pub image_link_ttl: Duration,
    /// `None` lets task tokens live until consumed.
    pub task_token_ttl: Option<Duration>,
    pub task_lease: Duration,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_confidence: 90,
            default_charge: DEFAULT_CHARGE,
            operator_email: None,
            sender_email: None,
            resume_base_url: "http://localhost:8080/".to_string(),
            random_failure_probability: 0.0,
            ledger_table: "NumberPlates".to_string(),
            manual_review_queue: "ManualPlateInspection".to_string(),
            insufficient_credit_queue: "InsufficientCredit".to_string(),
            secret_id: "/Staging/tollgantry/Metadata".to_string(),
            pattern_refresh_runs: None,
            image_link_ttl: Duration::from_secs(3600),
            task_token_ttl: None,
            task_lease: Duration::from_secs(300),
            poll_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Builds a config from `(name, value)` pairs; unknown names are ignored.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(name, _)| name.starts_with("TOLL_"))
            .collect();
        let mut config = Config::default();

        if let Some(v) = parse::<u8>(&vars, "TOLL_MIN_CONFIDENCE")? {
            config.min_confidence = v;
        }
        if let Some(v) = parse::<u64>(&vars, "TOLL_CHARGE")? {
            config.default_charge = Charge::new(v)?;
        }
        if let Some(v) = text(&vars, "TOLL_OPERATOR_EMAIL") {
            config.operator_email = Some(v);
        }
        if let Some(v) = text(&vars, "TOLL_SENDER_EMAIL") {
            config.sender_email = Some(v);
        }
        if let Some(v) = text(&vars, "TOLL_RESUME_BASE_URL") {
            config.resume_base_url = v;
        }
        if let Some(v) = parse::<f64>(&vars, "TOLL_RANDOM_FAILURE_PROBABILITY")? {
            config.random_failure_probability = v;
        }
        if let Some(v) = text(&vars, "TOLL_LEDGER_TABLE") {
            config.ledger_table = v;
        }
        if let Some(v) = text(&vars, "TOLL_QUEUE_MANUAL_REVIEW") {
            config.manual_review_queue = v;
        }
        if let Some(v) = text(&vars, "TOLL_QUEUE_INSUFFICIENT_CREDIT") {
            config.insufficient_credit_queue = v;
        }
        if let Some(v) = text(&vars, "TOLL_SECRET_ID") {
            config.secret_id = v;
        }
        if let Some(v) = parse::<u32>(&vars, "TOLL_PATTERN_REFRESH_RUNS")? {
            config.pattern_refresh_runs = Some(v);
        }
        if let Some(v) = parse::<u64>(&vars, "TOLL_IMAGE_LINK_TTL_SECS")? {
            config.image_link_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u64>(&vars, "TOLL_TASK_TOKEN_TTL_SECS")? {
            config.task_token_ttl = Some(Duration::from_secs(v));
        }
        if let Some(v) = parse::<u64>(&vars, "TOLL_TASK_LEASE_SECS")? {
            config.task_lease = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u64>(&vars, "TOLL_POLL_INTERVAL_SECS")? {
            config.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u32>(&vars, "TOLL_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = parse::<u64>(&vars, "TOLL_RETRY_INTERVAL_MS")? {
            config.retry.interval = Duration::from_millis(v);
        }
        if let Some(v) = parse::<f64>(&vars, "TOLL_RETRY_BACKOFF_RATE")? {
            config.retry.backoff_rate = v;
        }

        config.validate()
    }

    /// Checks ranges and normalizes the resume base URL.
    pub fn validate(mut self) -> Result<Self> {
        if self.min_confidence > 100 {
            return Err(TollError::Config(format!(
                "TOLL_MIN_CONFIDENCE must be a percentage, got {}",
                self.min_confidence
            )));
        }
        if !(0.0..=1.0).contains(&self.random_failure_probability) {
            return Err(TollError::Config(format!(
                "TOLL_RANDOM_FAILURE_PROBABILITY must be within [0, 1], got {}",
                self.random_failure_probability
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(TollError::Config(
                "TOLL_RETRY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_rate < 1.0 {
            return Err(TollError::Config(format!(
                "TOLL_RETRY_BACKOFF_RATE must be >= 1.0, got {}",
                self.retry.backoff_rate
            )));
        }
        if self.manual_review_queue == self.insufficient_credit_queue {
            return Err(TollError::Config(
                "Activity queues must have distinct identifiers".to_string(),
            ));
        }
        if !self.resume_base_url.ends_with('/') {
            self.resume_base_url.push('/');
        }
        Ok(self)
    }

    pub fn queue_for(&self, category: ActivityCategory) -> &str {
        match category {
            ActivityCategory::ManualPlateInspection => &self.manual_review_queue,
            ActivityCategory::InsufficientCredit => &self.insufficient_credit_queue,
        }
    }
}

fn text(vars: &HashMap<String, String>, name: &str) -> Option<String> {
    vars.get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse<T>(vars: &HashMap<String, String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match text(vars, name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| TollError::Config(format!("{} = '{}': {}", name, raw, e))),
        None => Ok(None),
    }
}
