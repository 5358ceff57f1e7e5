//! Persisted job records and their statuses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Parameters of a job. Keys are unique and order is irrelevant.
pub type JobParameters = BTreeMap<String, String>;

/// Status of a persisted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    New,
    Processing,
    Finished, // terminal
    Error,
    MaxTriesExceeded, // terminal
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::New,
        JobStatus::Processing,
        JobStatus::Finished,
        JobStatus::Error,
        JobStatus::MaxTriesExceeded,
    ];

    /// Returns true if this is a terminal state (Finished or MaxTriesExceeded).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::MaxTriesExceeded)
    }

    /// Statuses under which an equal job counts as already queued.
    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobStatus::New => "NEW",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Error => "ERROR",
            JobStatus::MaxTriesExceeded => "MAX_TRIES_EXCEEDED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(JobStatus::New),
            "PROCESSING" => Some(JobStatus::Processing),
            "FINISHED" => Some(JobStatus::Finished),
            "ERROR" => Some(JobStatus::Error),
            "MAX_TRIES_EXCEEDED" => Some(JobStatus::MaxTriesExceeded),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(&s.to_ascii_uppercase())
            .ok_or_else(|| anyhow::anyhow!("Unknown job status: {}", s))
    }
}

/// A unit of background work, persisted so it survives restarts.
///
/// Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Assigned by the store when the job is first persisted.
    pub id: Option<i64>,
    /// Identifier of the [`JobAction`](super::JobAction) type that runs it.
    pub action: String,
    pub parameters: JobParameters,
    pub status: JobStatus,
    pub tries: u32,
    pub added_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub last_error: Option<String>,
    /// Earliest time a NEW job may be claimed again after a failed attempt.
    pub next_attempt_at: Option<i64>,
}

impl Job {
    pub fn new(action: impl Into<String>, parameters: JobParameters) -> Self {
        Self {
            id: None,
            action: action.into(),
            parameters,
            status: JobStatus::New,
            tries: 0,
            added_at: now_millis(),
            started_at: None,
            finished_at: None,
            last_error: None,
            next_attempt_at: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// True if every entry of `filter` is present with the same value.
    pub fn matches(&self, filter: &JobParameters) -> bool {
        filter
            .iter()
            .all(|(k, v)| self.parameters.get(k) == Some(v))
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Number of jobs per status for one action type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub new: usize,
    pub processing: usize,
    pub finished: usize,
    pub error: usize,
    pub max_tries_exceeded: usize,
}

impl JobCounts {
    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::New => self.new,
            JobStatus::Processing => self.processing,
            JobStatus::Finished => self.finished,
            JobStatus::Error => self.error,
            JobStatus::MaxTriesExceeded => self.max_tries_exceeded,
        }
    }

    pub(crate) fn set(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::New => self.new = count,
            JobStatus::Processing => self.processing = count,
            JobStatus::Finished => self.finished = count,
            JobStatus::Error => self.error = count,
            JobStatus::MaxTriesExceeded => self.max_tries_exceeded = count,
        }
    }

    pub fn total(&self) -> usize {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_db_strings() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::from_db_str(status.as_db_str()), Some(status));
        }
        assert_eq!(JobStatus::from_db_str("DONE"), None);
        assert_eq!(
            "max_tries_exceeded".parse::<JobStatus>().unwrap(),
            JobStatus::MaxTriesExceeded
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::MaxTriesExceeded.is_terminal());
        assert!(JobStatus::Error.is_pending());
        assert!(JobStatus::Processing.is_pending());
    }

    #[test]
    fn test_parameter_filter_is_subset_match() {
        let job = Job::new("index", JobParameters::new())
            .with_param("pid", "obj:1")
            .with_param("mode", "full");

        let mut filter = JobParameters::new();
        assert!(job.matches(&filter));
        filter.insert("pid".to_string(), "obj:1".to_string());
        assert!(job.matches(&filter));
        filter.insert("mode".to_string(), "delta".to_string());
        assert!(!job.matches(&filter));
    }

    #[test]
    fn test_serializes_status_in_screaming_case() {
        let json = serde_json::to_value(JobStatus::MaxTriesExceeded).unwrap();
        assert_eq!(json, serde_json::json!("MAX_TRIES_EXCEEDED"));
    }
}
