use std::fmt::Display;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque identifier of a job, unique within one queue namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh id: millisecond timestamp prefix plus a random
    /// suffix, so ids from concurrent producers sort roughly by enqueue time
    /// without colliding.
    pub(crate) fn generate() -> Self {
        let suffix: u32 = rand::thread_rng().gen_range(0..0x1000_0000);
        Self(format!("{:x}-{:07x}", now_ms(), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state persisted on the job record.
///
/// Collection membership, not this field, decides where a job currently
/// lives: a record may still read `Retrying` after its id has been promoted
/// back into a runnable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Retrying,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The canonical job record, stored under `queue:<name>:jobs` as JSON.
///
/// The broker never inspects `data`; it is carried verbatim to the
/// processor and `result` is carried back on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub data: serde_json::Value,
    pub priority: u32,
    pub attempts: u32,
    pub max_retries: u32,
    pub status: JobStatus,
    /// Epoch milliseconds, set once at enqueue.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Overwritten on each failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl Job {
    /// Serializes the record to its wire form. Pure, no I/O.
    pub(crate) fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a record from its wire form. Pure, no I/O.
    pub(crate) fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Recognized enqueue options; everything else is unrepresentable.
///
/// `priority` 0 is normal, higher is more urgent. A `delay` postpones the
/// first delivery. `max_retries` overrides the broker default and must be
/// positive.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOpts {
    pub job_id: Option<JobId>,
    pub priority: u32,
    pub delay: Option<std::time::Duration>,
    pub max_retries: Option<u32>,
}

impl EnqueueOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_id(self, job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..self
        }
    }

    pub fn with_priority(self, priority: u32) -> Self {
        Self { priority, ..self }
    }

    pub fn with_delay(self, delay: std::time::Duration) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..self
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let ids: std::collections::HashSet<_> =
            (0..1000).map(|_| JobId::generate().0).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn status_round_trips_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Retrying).unwrap(),
            "\"retrying\""
        );
        let status: JobStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(status, JobStatus::Failed);
    }

    #[test]
    fn decode_accepts_record_without_optional_fields() {
        let raw = r#"{
            "id": "17e0-abc",
            "data": {"task": "x"},
            "priority": 0,
            "attempts": 0,
            "max_retries": 3,
            "status": "pending",
            "created_at": 1700000000000
        }"#;
        let job = Job::decode(raw).unwrap();
        assert_eq!(job.id.as_str(), "17e0-abc");
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.result.is_none());
        assert!(job.last_error.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }
}
