//! Key layout for one queue namespace in the backing store.
//!
//! Everything a queue owns lives under the prefix `queue:<name>:`. The
//! collections are:
//!
//! - `jobs` — hash of job id to serialized record; the store of truth.
//! - `pending` — FIFO list of runnable ids at normal priority.
//! - `priority` — sorted set of runnable ids scored by negated priority,
//!   so the lowest score is the most urgent job.
//! - `delayed` — sorted set of ids scored by their earliest delivery time
//!   in epoch milliseconds.
//! - `processing` — hash of job id to dequeue timestamp; presence here is
//!   the worker's lease on the job.
//! - `completed`, `failed` — append-only audit lists of terminal ids.
//! - `stats` — hash of best-effort counters.

/// Counter fields kept under the `stats` hash.
pub(crate) const STAT_TOTAL: &str = "total";
pub(crate) const STAT_PENDING: &str = "pending";
pub(crate) const STAT_PROCESSING: &str = "processing";
pub(crate) const STAT_COMPLETED: &str = "completed";
pub(crate) const STAT_FAILED: &str = "failed";

/// Rendered keys for one queue, built once at broker construction.
#[derive(Debug, Clone)]
pub(crate) struct QueueKeys {
    pub jobs: String,
    pub pending: String,
    pub priority: String,
    pub delayed: String,
    pub processing: String,
    pub completed: String,
    pub failed: String,
    pub stats: String,
}

impl QueueKeys {
    pub fn new(name: &str) -> Self {
        Self {
            jobs: format!("queue:{name}:jobs"),
            pending: format!("queue:{name}:pending"),
            priority: format!("queue:{name}:priority"),
            delayed: format!("queue:{name}:delayed"),
            processing: format!("queue:{name}:processing"),
            completed: format!("queue:{name}:completed"),
            failed: format!("queue:{name}:failed"),
            stats: format!("queue:{name}:stats"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_share_the_queue_prefix() {
        let keys = QueueKeys::new("emails");
        assert_eq!(keys.jobs, "queue:emails:jobs");
        assert_eq!(keys.pending, "queue:emails:pending");
        assert_eq!(keys.stats, "queue:emails:stats");
    }
}
