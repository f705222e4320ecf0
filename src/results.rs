//! Result aggregation and the serializable run report

use crate::error::{Result, XshError};
use crate::models::Outcome;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct Partition {
    successes: Vec<Outcome>,
    failures: Vec<Outcome>,
}

/// Append-only success/failure partition shared by all host tasks
#[derive(Debug, Default)]
pub struct ResultSet {
    inner: Mutex<Partition>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an outcome to successes or failures depending on its error
    pub fn record(&self, outcome: Outcome) {
        let mut partition = self.lock();
        if outcome.is_success() {
            partition.successes.push(outcome);
        } else {
            partition.failures.push(outcome);
        }
    }

    pub fn success_count(&self) -> usize {
        self.lock().successes.len()
    }

    pub fn failure_count(&self) -> usize {
        self.lock().failures.len()
    }

    pub fn len(&self) -> usize {
        let partition = self.lock();
        partition.successes.len() + partition.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializable copy of both sequences in arrival order
    pub fn snapshot(&self) -> Report {
        let partition = self.lock();
        Report {
            successes: partition.successes.iter().map(OutcomeRecord::from).collect(),
            failures: partition.failures.iter().map(OutcomeRecord::from).collect(),
        }
    }

    // Pushes never leave a half-written Vec, so a poisoned lock is still usable
    fn lock(&self) -> std::sync::MutexGuard<'_, Partition> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Serialized form of a run's results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub successes: Vec<OutcomeRecord>,
    #[serde(default)]
    pub failures: Vec<OutcomeRecord>,
}

impl Report {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(XshError::from)
    }
}

/// One host's entry in a [`Report`]. Empty fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub start_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub end_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub time_taken: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

impl From<&Outcome> for OutcomeRecord {
    fn from(outcome: &Outcome) -> Self {
        Self {
            error: outcome.error.clone().filter(|e| !e.is_empty()),
            host: outcome.host.clone(),
            start_time: format_timestamp(&outcome.start),
            end_time: format_timestamp(&outcome.end),
            time_taken: format_elapsed(outcome.elapsed),
            output: String::from_utf8_lossy(&outcome.output).into_owned(),
        }
    }
}

/// RFC 3339 with second precision, e.g. `2024-05-01T12:00:00Z`
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Seconds with microsecond precision, e.g. `1.250000s`
pub fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.6}s", elapsed.as_secs_f64())
}
