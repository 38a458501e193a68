//! The queue broker.
//!
//! A [`Broker`] owns one queue namespace in the backing store and implements
//! the brokerage protocol over it: enqueue with priority or delay, atomic
//! dequeue into a processing lease, terminal transitions, retry scheduling
//! with exponential backoff, promotion of due delayed jobs, and recovery of
//! jobs whose worker died mid-flight.
//!
//! Every runnable job lives in exactly one of the `pending` list, the
//! `priority` set or the `delayed` set, or holds a lease in `processing`.
//! The job record itself always stays in the `jobs` hash; the collections
//! only carry ids.

use std::sync::Arc;

use chrono::TimeDelta;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::backoff::{BackoffStrategy, Exponential, Strategy};
use crate::config::BrokerConfig;
use crate::events::{EventBus, QueueEvent};
use crate::job::{now_ms, EnqueueOpts, Job, JobId, JobStatus};
use crate::keys::{
    QueueKeys, STAT_COMPLETED, STAT_FAILED, STAT_PENDING, STAT_PROCESSING, STAT_TOTAL,
};
use crate::store::{Store, StoreError};

mod maintenance;

use maintenance::MaintenanceRunner;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("error encoding or decoding a job record")]
    Codec(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Point-in-time queue counts.
///
/// `pending`, `processing` and `delayed` are read from the collection sizes
/// and are exact; `total`, `completed` and `failed` come from the
/// best-effort stats counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

/// A handle to one named queue.
///
/// Cheap to clone; all clones share the same store connection, event bus
/// and maintenance loop. Dropping every clone without calling
/// [`Broker::close`] leaves the maintenance task running.
pub struct Broker<S> {
    inner: Arc<BrokerInner<S>>,
}

impl<S> Clone for Broker<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct BrokerInner<S> {
    store: S,
    config: BrokerConfig,
    keys: QueueKeys,
    events: EventBus,
    backoff: BackoffStrategy<Exponential>,
    shutdown: CancellationToken,
}

impl<S> Broker<S>
where
    S: Store + 'static,
{
    /// Creates a broker over `store` and starts its maintenance loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: S, config: BrokerConfig) -> Self {
        let keys = QueueKeys::new(&config.name);
        let backoff = BackoffStrategy::exponential(
            TimeDelta::milliseconds(config.retry_delay.as_millis() as i64),
            config.retry_backoff,
        );
        let shutdown = CancellationToken::new();
        let broker = Self {
            inner: Arc::new(BrokerInner {
                store,
                keys,
                events: EventBus::default(),
                backoff,
                shutdown: shutdown.clone(),
                config,
            }),
        };
        MaintenanceRunner::new(broker.clone()).spawn(shutdown);
        broker
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Taps into the lifecycle event stream of this queue.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn publish(&self, event: QueueEvent) {
        self.inner.events.publish(event);
    }

    /// Enqueues a job and returns its id.
    ///
    /// The record lands in the `jobs` hash and the id is routed to exactly
    /// one queue: `delayed` when a delay is set, `priority` when the
    /// priority is above normal, the `pending` list otherwise.
    #[instrument(skip_all, fields(queue = %self.inner.config.name))]
    pub async fn add_job(
        &self,
        data: serde_json::Value,
        opts: EnqueueOpts,
    ) -> BrokerResult<JobId> {
        if opts.max_retries == Some(0) {
            return Err(BrokerError::InvalidArgument("max_retries must be positive"));
        }
        let store = &self.inner.store;
        let keys = &self.inner.keys;

        let id = opts.job_id.unwrap_or_else(JobId::generate);
        let now = now_ms();
        let job = Job {
            id: id.clone(),
            data,
            priority: opts.priority,
            attempts: 0,
            max_retries: opts.max_retries.unwrap_or(self.inner.config.max_retries),
            status: JobStatus::Pending,
            created_at: now,
            completed_at: None,
            failed_at: None,
            last_error: None,
            result: None,
        };
        store.hset(&keys.jobs, id.as_str(), &job.encode()?).await?;

        let delay_ms = opts
            .delay
            .map(|delay| delay.as_millis() as i64)
            .filter(|ms| *ms > 0);
        match delay_ms {
            Some(ms) => store.zadd(&keys.delayed, now + ms, id.as_str()).await?,
            None if job.priority > 0 => {
                store
                    .zadd(&keys.priority, -(job.priority as i64), id.as_str())
                    .await?
            }
            None => {
                store.rpush(&keys.pending, id.as_str()).await?;
            }
        }
        store.hincrby(&keys.stats, STAT_TOTAL, 1).await?;
        store.hincrby(&keys.stats, STAT_PENDING, 1).await?;

        tracing::debug!(%id, "Enqueued job {id}");
        self.publish(QueueEvent::JobAdded { id: id.clone() });
        Ok(id)
    }

    /// Takes the next runnable job, or `None` when both runnable queues are
    /// empty. Never blocks; idle waiting belongs to the worker.
    ///
    /// The pop out of `priority` (highest priority first) or `pending`
    /// (FIFO) and the lease insert into `processing` are one atomic store
    /// operation; the priority set is always drained before the pending
    /// list is examined.
    #[instrument(skip_all, fields(queue = %self.inner.config.name))]
    pub async fn next_job(&self) -> BrokerResult<Option<Job>> {
        let store = &self.inner.store;
        let keys = &self.inner.keys;

        let now = now_ms();
        let popped = match store
            .zpopmin_to_hash(&keys.priority, &keys.processing, now)
            .await?
        {
            Some(id) => Some(id),
            None => {
                store
                    .lpop_to_hash(&keys.pending, &keys.processing, now)
                    .await?
            }
        };
        let Some(raw_id) = popped else {
            return Ok(None);
        };
        store.hincrby(&keys.stats, STAT_PENDING, -1).await?;
        store.hincrby(&keys.stats, STAT_PROCESSING, 1).await?;

        let id = JobId::from(raw_id);
        let Some(raw) = store.hget(&keys.jobs, id.as_str()).await? else {
            tracing::warn!(%id, "Dequeued id {id} without a job record, dropping the lease");
            store.hdel(&keys.processing, id.as_str()).await?;
            store.hincrby(&keys.stats, STAT_PROCESSING, -1).await?;
            return Ok(None);
        };
        let mut job = Job::decode(&raw)?;
        job.status = JobStatus::Processing;
        store.hset(&keys.jobs, id.as_str(), &job.encode()?).await?;

        tracing::debug!(%id, "Dequeued job {id}");
        Ok(Some(job))
    }

    /// Records a successful run.
    ///
    /// Returns false without side effects when the record is missing,
    /// already terminal, or no longer leased; a late report from a worker
    /// whose lease was reclaimed is benign.
    pub async fn complete_job(
        &self,
        id: &JobId,
        result: serde_json::Value,
    ) -> BrokerResult<bool> {
        let store = &self.inner.store;
        let keys = &self.inner.keys;

        let Some(raw) = store.hget(&keys.jobs, id.as_str()).await? else {
            return Ok(false);
        };
        let mut job = Job::decode(&raw)?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        if !store.hdel(&keys.processing, id.as_str()).await? {
            tracing::debug!(%id, "Ignoring completion report for job {id} with no active lease");
            return Ok(false);
        }

        job.status = JobStatus::Completed;
        job.completed_at = Some(now_ms());
        job.result = Some(result);
        store.hset(&keys.jobs, id.as_str(), &job.encode()?).await?;
        store.rpush(&keys.completed, id.as_str()).await?;
        store.hincrby(&keys.stats, STAT_PROCESSING, -1).await?;
        store.hincrby(&keys.stats, STAT_COMPLETED, 1).await?;

        tracing::debug!(%id, "Job {id} completed");
        self.publish(QueueEvent::JobCompleted { id: id.clone() });
        Ok(true)
    }

    /// Records a failed run.
    ///
    /// While attempts remain the job is rescheduled with backoff and the
    /// call returns true; once attempts are exhausted the job fails
    /// permanently and the call returns false. The same benign-report rules
    /// as [`Broker::complete_job`] apply.
    pub async fn fail_job(&self, id: &JobId, error: &str) -> BrokerResult<bool> {
        let store = &self.inner.store;
        let keys = &self.inner.keys;

        let Some(raw) = store.hget(&keys.jobs, id.as_str()).await? else {
            return Ok(false);
        };
        let mut job = Job::decode(&raw)?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        if !store.hdel(&keys.processing, id.as_str()).await? {
            tracing::debug!(%id, "Ignoring failure report for job {id} with no active lease");
            return Ok(false);
        }

        job.attempts += 1;
        job.last_error = Some(error.to_owned());
        job.failed_at = Some(now_ms());

        if job.attempts < job.max_retries {
            self.retry_job(job).await?;
            return Ok(true);
        }

        job.status = JobStatus::Failed;
        let attempts = job.attempts;
        store.hset(&keys.jobs, id.as_str(), &job.encode()?).await?;
        store.rpush(&keys.failed, id.as_str()).await?;
        store.hincrby(&keys.stats, STAT_PROCESSING, -1).await?;
        store.hincrby(&keys.stats, STAT_FAILED, 1).await?;

        tracing::error!(%id, error, "Job {id} failed permanently after {attempts} attempts");
        self.publish(QueueEvent::JobFailed {
            id: id.clone(),
            error: error.to_owned(),
        });
        Ok(false)
    }

    /// Schedules the next attempt of a job that just failed. The lease has
    /// already been removed by the caller.
    async fn retry_job(&self, mut job: Job) -> BrokerResult<()> {
        let store = &self.inner.store;
        let keys = &self.inner.keys;

        let delay = self.inner.backoff.backoff(job.attempts);
        job.status = JobStatus::Retrying;
        let id = job.id.clone();
        let attempts = job.attempts;
        store.hset(&keys.jobs, id.as_str(), &job.encode()?).await?;
        store
            .zadd(
                &keys.delayed,
                now_ms() + delay.num_milliseconds(),
                id.as_str(),
            )
            .await?;
        store.hincrby(&keys.stats, STAT_PROCESSING, -1).await?;

        tracing::warn!(%id, attempts, "Job {id} failed and will be retried in {delay}");
        self.publish(QueueEvent::JobRetry { id, attempts });
        Ok(())
    }

    /// Promotes every delayed job whose delivery time has passed back to
    /// its runnable queue, earliest first. Returns the number promoted.
    ///
    /// Ids whose record has vanished are dropped from `delayed` and
    /// skipped.
    pub async fn process_delayed(&self) -> BrokerResult<usize> {
        let store = &self.inner.store;
        let keys = &self.inner.keys;

        let due = store
            .zrangebyscore(&keys.delayed, i64::MIN, now_ms())
            .await?;
        let mut promoted = 0;
        for raw_id in due {
            // Raced by another process promoting the same id.
            if !store.zrem(&keys.delayed, &raw_id).await? {
                continue;
            }
            let Some(raw) = store.hget(&keys.jobs, &raw_id).await? else {
                tracing::warn!(id = %raw_id, "Dropping delayed id {raw_id} without a job record");
                continue;
            };
            let job = Job::decode(&raw)?;
            if job.priority > 0 {
                store
                    .zadd(&keys.priority, -(job.priority as i64), &raw_id)
                    .await?;
            } else {
                store.rpush(&keys.pending, &raw_id).await?;
            }
            store.hincrby(&keys.stats, STAT_PENDING, 1).await?;
            promoted += 1;
        }
        if promoted > 0 {
            tracing::debug!(promoted, "Promoted {promoted} delayed jobs");
        }
        Ok(promoted)
    }

    /// Fails every processing lease older than the configured job timeout,
    /// sending the job through the usual retry path. Returns the number of
    /// leases reclaimed.
    ///
    /// This is the crash-recovery mechanism: a worker that died holding a
    /// lease has it reclaimed here, and the in-flight processor on the
    /// original worker is never interrupted; its late report is simply
    /// refused.
    pub async fn check_stalled(&self) -> BrokerResult<usize> {
        let store = &self.inner.store;
        let keys = &self.inner.keys;

        let leases = store.hgetall(&keys.processing).await?;
        let now = now_ms();
        let timeout_ms = self.inner.config.job_timeout.as_millis() as i64;
        let mut recovered = 0;
        for (raw_id, stamp) in leases {
            let Ok(started) = stamp.parse::<i64>() else {
                tracing::warn!(id = %raw_id, %stamp, "Skipping lease with an unreadable timestamp");
                continue;
            };
            if now - started > timeout_ms {
                let id = JobId::from(raw_id);
                tracing::warn!(%id, "Reclaiming stalled job {id}");
                if !self
                    .fail_job(&id, &format!("job stalled after {timeout_ms}ms"))
                    .await?
                {
                    // Terminal or vanished records keep no lease.
                    store.hdel(&keys.processing, id.as_str()).await?;
                }
                recovered += 1;
            }
        }
        if recovered > 0 {
            self.publish(QueueEvent::JobsRecovered { count: recovered });
        }
        Ok(recovered)
    }

    /// Fetches a job record by id.
    pub async fn job(&self, id: &JobId) -> BrokerResult<Option<Job>> {
        match self
            .inner
            .store
            .hget(&self.inner.keys.jobs, id.as_str())
            .await?
        {
            None => Ok(None),
            Some(raw) => Ok(Some(Job::decode(&raw)?)),
        }
    }

    /// Takes a stats snapshot. Collection sizes win over the counters
    /// wherever both exist.
    pub async fn stats(&self) -> BrokerResult<QueueStats> {
        let store = &self.inner.store;
        let keys = &self.inner.keys;

        let pending = store.llen(&keys.pending).await? + store.zcard(&keys.priority).await?;
        let processing = store.hlen(&keys.processing).await?;
        let delayed = store.zcard(&keys.delayed).await?;
        let counters = store.hgetall(&keys.stats).await?;
        let counter = |name: &str| {
            counters
                .get(name)
                .and_then(|raw| raw.parse::<i64>().ok())
                .unwrap_or(0)
                .max(0) as u64
        };
        Ok(QueueStats {
            total: counter(STAT_TOTAL),
            pending,
            processing,
            delayed,
            completed: counter(STAT_COMPLETED),
            failed: counter(STAT_FAILED),
        })
    }

    /// Stops the maintenance loop. Workers are not interrupted and stop
    /// independently; the store connection closes once the last clone of
    /// this broker is dropped.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }
}
