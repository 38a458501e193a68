//! The worker processing loop.
//!
//! A [`Worker`] binds a broker to a user-supplied [`Processor`] and runs a
//! sequential poll/execute/report loop: take the next job, run the
//! processor, report the outcome, sleep briefly when the queue is empty.
//! Scale out by running several workers over one broker, in-process or
//! across hosts; the atomic dequeue is the only coordination they need.
//!
//! The processor runs on its own task so a panic inside it is contained
//! and reported as an ordinary job failure. Broker errors never kill the
//! loop either; they are published on the event bus and the worker sleeps
//! one idle interval before polling again.

use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::broker::{Broker, BrokerError};
use crate::events::QueueEvent;
use crate::job::{Job, JobId};
use crate::metrics::QueueMetrics;
use crate::store::Store;

/// Opaque, caller-supplied identifier of one worker loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An error returned from a [`Processor`]; its message is recorded on the
/// job as `last_error`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProcessorError {
    pub message: String,
}

impl ProcessorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The user-supplied job body.
///
/// The broker treats `job.data` as opaque; whatever `process` returns is
/// stored as the job's `result`.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, job: &Job) -> Result<serde_json::Value, ProcessorError>;
}

#[async_trait]
impl<P> Processor for Arc<P>
where
    P: Processor + ?Sized,
{
    async fn process(&self, job: &Job) -> Result<serde_json::Value, ProcessorError> {
        (**self).process(job).await
    }
}

/// A single-threaded processing loop bound to one broker.
pub struct Worker<S, P> {
    id: WorkerId,
    broker: Broker<S>,
    processor: Arc<P>,
    metrics: Option<Arc<QueueMetrics>>,
    current_job: Mutex<Option<JobId>>,
    shutdown: CancellationToken,
}

impl<S, P> Worker<S, P>
where
    S: Store + 'static,
    P: Processor,
{
    pub fn new(id: impl Into<WorkerId>, broker: Broker<S>, processor: P) -> Self {
        Self {
            id: id.into(),
            broker,
            processor: Arc::new(processor),
            metrics: None,
            current_job: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Attaches a metrics accumulator fed on every settled job.
    pub fn with_metrics(self, metrics: Arc<QueueMetrics>) -> Self {
        Self {
            metrics: Some(metrics),
            ..self
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// The job currently being processed, if any.
    pub fn current_job(&self) -> Option<JobId> {
        self.current_job.lock().ok().and_then(|guard| guard.clone())
    }

    /// Asks the loop to stop. The current job, if any, runs to completion;
    /// the loop exits at its next top-of-loop check.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Runs the processing loop until [`Worker::stop`] is called.
    ///
    /// No error escapes this loop: processor failures become job failures
    /// and broker failures are published as [`QueueEvent::Error`] followed
    /// by an idle sleep.
    pub async fn run(&self) {
        tracing::info!(worker = %self.id, "Worker {} started", self.id);
        self.broker.publish(QueueEvent::WorkerStarted {
            worker: self.id.clone(),
        });
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let outcome = match self.broker.next_job().await {
                Ok(Some(job)) => self.run_job(job).await,
                Ok(None) => {
                    self.idle().await;
                    Ok(())
                }
                Err(err) => Err(err),
            };
            if let Err(err) = outcome {
                tracing::error!(worker = %self.id, ?err, "Broker call failed: {err}");
                self.broker.publish(QueueEvent::Error {
                    message: err.to_string(),
                });
                self.idle().await;
            }
        }
        self.broker.publish(QueueEvent::WorkerStopped {
            worker: self.id.clone(),
        });
        tracing::info!(worker = %self.id, "Worker {} stopped", self.id);
    }

    /// Spawns [`Worker::run`] on a new task and returns a stop handle.
    pub fn spawn(self) -> WorkerHandle {
        let id = self.id.clone();
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move { self.run().await });
        WorkerHandle {
            id,
            token,
            handle: Some(handle),
        }
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.broker.config().poll_interval) => {},
            _ = self.shutdown.cancelled() => {},
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id, worker = %self.id))]
    async fn run_job(&self, job: Job) -> Result<(), BrokerError> {
        let id = job.id.clone();
        if let Ok(mut current) = self.current_job.lock() {
            *current = Some(id.clone());
        }
        self.broker.publish(QueueEvent::JobStarted {
            id: id.clone(),
            worker: self.id.clone(),
        });
        tracing::debug!(%id, "Processing job {id}");

        let started = Instant::now();
        let outcome = tokio::spawn(
            {
                let processor = Arc::clone(&self.processor);
                async move { processor.process(&job).await }
            }
            .in_current_span(),
        )
        .await;

        let report = match outcome {
            Ok(Ok(result)) => self.report_success(&id, result, started).await,
            Ok(Err(error)) => self.report_failure(&id, error.message).await,
            Err(join_error) => self.report_failure(&id, panic_message(join_error)).await,
        };

        if let Ok(mut current) = self.current_job.lock() {
            *current = None;
        }
        report
    }

    async fn report_success(
        &self,
        id: &JobId,
        result: serde_json::Value,
        started: Instant,
    ) -> Result<(), BrokerError> {
        let acknowledged = self.broker.complete_job(id, result).await?;
        if acknowledged {
            if let Some(metrics) = &self.metrics {
                metrics.record_job_completed(started.elapsed().as_millis() as u64);
            }
        }
        Ok(())
    }

    async fn report_failure(&self, id: &JobId, message: String) -> Result<(), BrokerError> {
        self.broker.fail_job(id, &message).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_job_failed();
        }
        Ok(())
    }
}

/// Handle to a spawned worker task.
pub struct WorkerHandle {
    id: WorkerId,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Signals the worker to stop and waits for it to finish its current
    /// job and exit.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle
                .await
                .inspect_err(|err| tracing::error!(?err, "Worker task ended abnormally"));
        }
    }
}

fn panic_message(error: JoinError) -> String {
    let fallback = error.to_string();
    match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(fallback),
        Err(_) => fallback,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::config::BrokerConfig;
    use crate::job::{EnqueueOpts, JobStatus};
    use crate::store::{MemoryStore, MockStore, StoreError};

    struct OkProcessor;

    #[async_trait]
    impl Processor for OkProcessor {
        async fn process(&self, _job: &Job) -> Result<serde_json::Value, ProcessorError> {
            Ok(json!({"ok": 1}))
        }
    }

    struct FlakyProcessor {
        calls: AtomicU32,
        failures: u32,
    }

    impl FlakyProcessor {
        fn failing(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures,
            })
        }
    }

    #[async_trait]
    impl Processor for FlakyProcessor {
        async fn process(&self, _job: &Job) -> Result<serde_json::Value, ProcessorError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(ProcessorError::new("flaky"))
            } else {
                Ok(json!("recovered"))
            }
        }
    }

    struct PanickingProcessor;

    #[async_trait]
    impl Processor for PanickingProcessor {
        async fn process(&self, _job: &Job) -> Result<serde_json::Value, ProcessorError> {
            panic!("kaboom")
        }
    }

    fn fast_config(name: &str) -> BrokerConfig {
        BrokerConfig::new(name)
            .with_retry_delay(Duration::from_millis(40))
            .with_cleanup_interval(Duration::from_millis(15))
            .with_poll_interval(Duration::from_millis(10))
    }

    async fn wait_for<F>(
        events: &mut tokio::sync::mpsc::UnboundedReceiver<QueueEvent>,
        mut matches: F,
    ) -> QueueEvent
    where
        F: FnMut(&QueueEvent) -> bool,
    {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("timed out waiting for an event")
                .expect("event bus closed");
            if matches(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn completes_a_job_end_to_end() {
        let broker = Broker::new(MemoryStore::new(), fast_config("e2e-basic"));
        let mut events = broker.subscribe();
        let metrics = Arc::new(QueueMetrics::new());

        let id = broker
            .add_job(json!({"task": "x"}), EnqueueOpts::new())
            .await
            .unwrap();
        let handle = Worker::new("w-1", broker.clone(), OkProcessor)
            .with_metrics(Arc::clone(&metrics))
            .spawn();

        wait_for(&mut events, |event| {
            matches!(event, QueueEvent::JobCompleted { .. })
        })
        .await;

        let job = broker.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"ok": 1})));
        assert_eq!(job.attempts, 0);
        assert_eq!(broker.stats().await.unwrap().completed, 1);
        assert_eq!(metrics.snapshot().completed, 1);

        handle.stop().await;
        broker.close();
    }

    #[tokio::test]
    async fn started_and_stopped_events_bracket_the_loop() {
        let broker: Broker<MemoryStore> = Broker::new(MemoryStore::new(), fast_config("e2e-events"));
        let mut events = broker.subscribe();

        let handle = Worker::new("w-events", broker.clone(), OkProcessor).spawn();
        assert_matches!(
            wait_for(&mut events, |event| matches!(
                event,
                QueueEvent::WorkerStarted { .. }
            ))
            .await,
            QueueEvent::WorkerStarted { worker } if worker == WorkerId::from("w-events")
        );

        handle.stop().await;
        assert_matches!(
            wait_for(&mut events, |event| matches!(
                event,
                QueueEvent::WorkerStopped { .. }
            ))
            .await,
            QueueEvent::WorkerStopped { worker } if worker == WorkerId::from("w-events")
        );
        broker.close();
    }

    #[tokio::test]
    async fn retries_with_backoff_until_the_processor_recovers() {
        let broker = Broker::new(MemoryStore::new(), fast_config("e2e-retry"));
        let mut events = broker.subscribe();
        let processor = FlakyProcessor::failing(2);

        let enqueued_at = Instant::now();
        let id = broker.add_job(json!(1), EnqueueOpts::new()).await.unwrap();
        let handle = Worker::new("w-retry", broker.clone(), Arc::clone(&processor)).spawn();

        wait_for(&mut events, |event| {
            matches!(event, QueueEvent::JobCompleted { .. })
        })
        .await;

        let job = broker.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.result, Some(json!("recovered")));
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);

        // Two backoffs of at least 80ms and 160ms have to elapse first.
        assert!(enqueued_at.elapsed() >= Duration::from_millis(200));

        handle.stop().await;
        broker.close();
    }

    #[tokio::test]
    async fn exhausted_retries_end_in_the_failed_list() {
        let broker = Broker::new(
            MemoryStore::new(),
            fast_config("e2e-exhaust").with_retry_delay(Duration::from_millis(5)),
        );
        let mut events = broker.subscribe();
        let processor = FlakyProcessor::failing(u32::MAX);

        let id = broker
            .add_job(json!(1), EnqueueOpts::new().with_max_retries(2))
            .await
            .unwrap();
        let handle = Worker::new("w-exhaust", broker.clone(), processor).spawn();

        wait_for(&mut events, |event| {
            matches!(event, QueueEvent::JobFailed { .. })
        })
        .await;

        let job = broker.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("flaky"));
        assert_eq!(broker.stats().await.unwrap().failed, 1);

        handle.stop().await;
        broker.close();
    }

    #[tokio::test]
    async fn stalled_jobs_are_redelivered_to_a_healthy_worker() {
        let broker = Broker::new(
            MemoryStore::new(),
            fast_config("e2e-stalled")
                .with_job_timeout(Duration::from_millis(50))
                .with_retry_delay(Duration::from_millis(1)),
        );
        let mut events = broker.subscribe();

        let id = broker.add_job(json!(1), EnqueueOpts::new()).await.unwrap();
        // A worker takes the lease and dies without reporting.
        broker.next_job().await.unwrap().unwrap();

        let handle = Worker::new("w-2", broker.clone(), OkProcessor).spawn();
        wait_for(&mut events, |event| {
            matches!(event, QueueEvent::JobsRecovered { .. })
        })
        .await;
        wait_for(&mut events, |event| {
            matches!(event, QueueEvent::JobCompleted { .. })
        })
        .await;

        let job = broker.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);

        handle.stop().await;
        broker.close();
    }

    #[tokio::test]
    async fn delayed_jobs_stay_invisible_until_due() {
        let broker = Broker::new(MemoryStore::new(), fast_config("e2e-delayed"));
        let mut events = broker.subscribe();

        let enqueued_at = Instant::now();
        let id = broker
            .add_job(
                json!(1),
                EnqueueOpts::new().with_delay(Duration::from_millis(150)),
            )
            .await
            .unwrap();
        assert!(broker.next_job().await.unwrap().is_none());

        let handle = Worker::new("w-delayed", broker.clone(), OkProcessor).spawn();
        wait_for(&mut events, |event| {
            matches!(event, QueueEvent::JobCompleted { .. })
        })
        .await;

        assert!(enqueued_at.elapsed() >= Duration::from_millis(150));
        let job = broker.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        handle.stop().await;
        broker.close();
    }

    #[tokio::test]
    async fn a_panicking_processor_fails_the_job() {
        let broker = Broker::new(MemoryStore::new(), fast_config("e2e-panic"));
        let mut events = broker.subscribe();

        let id = broker
            .add_job(json!(1), EnqueueOpts::new().with_max_retries(1))
            .await
            .unwrap();
        let handle = Worker::new("w-panic", broker.clone(), PanickingProcessor).spawn();

        wait_for(&mut events, |event| {
            matches!(event, QueueEvent::JobFailed { .. })
        })
        .await;

        let job = broker.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().contains("kaboom"));

        handle.stop().await;
        broker.close();
    }

    #[tokio::test]
    async fn the_loop_survives_broker_errors() {
        let mut store = MockStore::new();
        store
            .expect_zpopmin_to_hash()
            .times(1)
            .returning(|_, _, _| Err(StoreError::Unavailable("connection reset".to_owned())));
        store
            .expect_zpopmin_to_hash()
            .returning(|_, _, _| Ok(None));
        store.expect_lpop_to_hash().returning(|_, _, _| Ok(None));

        // Default sixty-second cleanup keeps the maintenance loop quiet.
        let broker = Broker::new(
            store,
            BrokerConfig::new("mock").with_poll_interval(Duration::from_millis(5)),
        );
        let mut events = broker.subscribe();
        let handle = Worker::new("w-mock", broker.clone(), OkProcessor).spawn();

        assert_matches!(
            wait_for(&mut events, |event| matches!(event, QueueEvent::Error { .. })).await,
            QueueEvent::Error { message } if message.contains("connection reset")
        );

        // An orderly stop proves the loop outlived the error.
        handle.stop().await;
        wait_for(&mut events, |event| {
            matches!(event, QueueEvent::WorkerStopped { .. })
        })
        .await;
        broker.close();
    }

    #[tokio::test]
    async fn stop_lets_the_current_job_finish() {
        struct SlowProcessor;

        #[async_trait]
        impl Processor for SlowProcessor {
            async fn process(&self, _job: &Job) -> Result<serde_json::Value, ProcessorError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!("slow"))
            }
        }

        let broker = Broker::new(MemoryStore::new(), fast_config("e2e-stop"));
        let mut events = broker.subscribe();
        let id = broker.add_job(json!(1), EnqueueOpts::new()).await.unwrap();

        let handle = Worker::new("w-slow", broker.clone(), SlowProcessor).spawn();
        wait_for(&mut events, |event| {
            matches!(event, QueueEvent::JobStarted { .. })
        })
        .await;

        // Stop while the job is mid-flight; it must still complete.
        handle.stop().await;
        let job = broker.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        broker.close();
    }

    #[tokio::test]
    async fn report_failure_records_metrics() {
        let broker = Broker::new(
            MemoryStore::new(),
            fast_config("metrics").with_retry_delay(Duration::from_millis(5)),
        );
        let metrics = Arc::new(QueueMetrics::new());
        let mut events = broker.subscribe();

        broker
            .add_job(json!(1), EnqueueOpts::new().with_max_retries(1))
            .await
            .unwrap();
        let handle = Worker::new("w-metrics", broker.clone(), FlakyProcessor::failing(u32::MAX))
            .with_metrics(Arc::clone(&metrics))
            .spawn();

        wait_for(&mut events, |event| {
            matches!(event, QueueEvent::JobFailed { .. })
        })
        .await;
        assert_eq!(metrics.snapshot().failed, 1);

        handle.stop().await;
        broker.close();
    }
}
