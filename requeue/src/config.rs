use std::time::Duration;

/// Broker configuration.
///
/// The defaults match a small general-purpose queue: three attempts with a
/// doubling one-second backoff, a thirty-second lease, and a maintenance
/// sweep every minute.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Queue name; all store keys live under `queue:<name>:`.
    pub name: String,
    /// Default upper bound on attempts before a job fails permanently.
    /// Must be positive; overridable per job at enqueue.
    pub max_retries: u32,
    /// Base retry delay.
    pub retry_delay: Duration,
    /// Multiplicative backoff per recorded failure.
    pub retry_backoff: f64,
    /// A processing lease older than this is considered stalled.
    pub job_timeout: Duration,
    /// Cadence of the delayed-promotion and stalled-recovery sweep.
    pub cleanup_interval: Duration,
    /// Advisory upper bound for a worker pool sharing this broker.
    pub max_concurrency: usize,
    /// How long a worker sleeps when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            retry_backoff: 2.0,
            job_timeout: Duration::from_millis(30_000),
            cleanup_interval: Duration::from_millis(60_000),
            max_concurrency: 10,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

impl BrokerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    pub fn with_retry_delay(self, retry_delay: Duration) -> Self {
        Self {
            retry_delay,
            ..self
        }
    }

    pub fn with_retry_backoff(self, retry_backoff: f64) -> Self {
        Self {
            retry_backoff,
            ..self
        }
    }

    pub fn with_job_timeout(self, job_timeout: Duration) -> Self {
        Self {
            job_timeout,
            ..self
        }
    }

    pub fn with_cleanup_interval(self, cleanup_interval: Duration) -> Self {
        Self {
            cleanup_interval,
            ..self
        }
    }

    pub fn with_max_concurrency(self, max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..self
        }
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.name, "default");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert_eq!(config.retry_backoff, 2.0);
        assert_eq!(config.job_timeout, Duration::from_secs(30));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn builders_override_fields() {
        let config = BrokerConfig::new("emails")
            .with_max_retries(5)
            .with_retry_delay(Duration::from_millis(50))
            .with_job_timeout(Duration::from_millis(500));
        assert_eq!(config.name, "emails");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay, Duration::from_millis(50));
        assert_eq!(config.job_timeout, Duration::from_millis(500));
    }
}
