//! A task queue broker over a shared key/value store.
//!
//! Producers enqueue opaque jobs with optional priority and delay; workers
//! across any number of processes dequeue them, run a user-supplied
//! [`Processor`](worker::Processor) and report the outcome. The broker
//! guarantees at-least-once execution with bounded retries under
//! exponential backoff, strict priority-before-pending dispatch, scheduled
//! delivery, and recovery of jobs abandoned by crashed workers.
//!
//! The backing store is reached through the [`store::Store`] trait, which
//! names the atomic primitives the protocol needs. [`store::MemoryStore`]
//! ships in this crate; the `requeue-redis` crate implements the trait
//! over Redis for multi-process deployments.
//!
//! # Example
//!
//! ```
//! use async_trait::async_trait;
//! use requeue::prelude::*;
//! use requeue::store::MemoryStore;
//! use serde_json::json;
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl Processor for Greeter {
//!     async fn process(&self, job: &Job) -> Result<serde_json::Value, ProcessorError> {
//!         Ok(json!({ "greeted": job.data["name"] }))
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let broker = Broker::new(MemoryStore::new(), BrokerConfig::new("greetings"));
//! let mut events = broker.subscribe();
//!
//! broker
//!     .add_job(json!({ "name": "ada" }), EnqueueOpts::new().with_priority(1))
//!     .await
//!     .unwrap();
//!
//! let worker = Worker::new("worker-1", broker.clone(), Greeter).spawn();
//! while let Some(event) = events.recv().await {
//!     if matches!(event, QueueEvent::JobCompleted { .. }) {
//!         break;
//!     }
//! }
//! worker.stop().await;
//! broker.close();
//! # });
//! ```

pub mod backoff;
pub mod broker;
pub mod config;
pub mod events;
pub mod job;
pub(crate) mod keys;
pub mod metrics;
pub mod prelude;
pub mod store;
pub mod worker;

pub use broker::{Broker, BrokerError, BrokerResult};
pub use config::BrokerConfig;
