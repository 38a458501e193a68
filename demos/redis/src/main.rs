use std::time::Duration;

use requeue::prelude::*;
use requeue_redis::RedisStore;
use serde_json::json;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1";
const REDIS_URL: &str = "REDIS_URL";

#[tokio::main]
pub async fn main() {
    let redis_url = std::env::var(REDIS_URL).unwrap_or_else(|_| DEFAULT_REDIS_URL.to_owned());
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let store = RedisStore::from_url(&redis_url).await.unwrap();
    let config = BrokerConfig::new("demo")
        .with_retry_delay(Duration::from_millis(500))
        .with_cleanup_interval(Duration::from_millis(1000))
        .with_poll_interval(Duration::from_millis(200));
    let broker = Broker::new(store, config);

    let mut events = broker.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("event: {event:?}");
        }
    });

    let job_id = broker
        .add_job(json!({"task": "send_email", "to": "ada@example.com"}), EnqueueOpts::new())
        .await
        .unwrap();
    println!("Enqueued job {job_id}");

    let job_id = broker
        .add_job(
            json!({"task": "page_oncall"}),
            EnqueueOpts::new().with_priority(10),
        )
        .await
        .unwrap();
    println!("Enqueued urgent job {job_id}");

    let job_id = broker
        .add_job(
            json!({"task": "send_reminder"}),
            EnqueueOpts::new().with_delay(Duration::from_secs(2)),
        )
        .await
        .unwrap();
    println!("Enqueued delayed job {job_id}");

    let job_id = broker
        .add_job(
            json!({"task": "flaky_export", "fail": true}),
            EnqueueOpts::new().with_max_retries(2),
        )
        .await
        .unwrap();
    println!("Enqueued flaky job {job_id}");

    let metrics = std::sync::Arc::new(QueueMetrics::new());
    let workers = vec![
        Worker::new("worker-1", broker.clone(), DemoProcessor)
            .with_metrics(std::sync::Arc::clone(&metrics))
            .spawn(),
        Worker::new("worker-2", broker.clone(), DemoProcessor)
            .with_metrics(std::sync::Arc::clone(&metrics))
            .spawn(),
    ];

    tokio::time::sleep(Duration::from_secs(6)).await;

    println!("stats: {:?}", broker.stats().await.unwrap());
    println!("metrics: {:?}", metrics.snapshot());

    futures::future::join_all(workers.into_iter().map(WorkerHandle::stop)).await;
    broker.close();
}

struct DemoProcessor;

#[async_trait::async_trait]
impl Processor for DemoProcessor {
    async fn process(&self, job: &Job) -> Result<serde_json::Value, ProcessorError> {
        println!("processing {} with {}", job.id, job.data);
        tokio::time::sleep(Duration::from_millis(100)).await;
        if job.data.get("fail").and_then(|fail| fail.as_bool()) == Some(true) {
            return Err(ProcessorError::new("export service unavailable"));
        }
        Ok(json!({"done": true}))
    }
}
