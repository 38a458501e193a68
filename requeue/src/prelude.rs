//! The purpose of this module is to alleviate the need to import many of
//! the `requeue` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use requeue::prelude::*;
//! ```
pub use crate::backoff::{BackoffStrategy, Jitter, Strategy};
pub use crate::broker::{Broker, BrokerError, BrokerResult, QueueStats};
pub use crate::config::BrokerConfig;
pub use crate::events::QueueEvent;
pub use crate::job::{EnqueueOpts, Job, JobId, JobStatus};
pub use crate::metrics::{MetricsSnapshot, QueueMetrics};
pub use crate::store::{Store, StoreError};
pub use crate::worker::{Processor, ProcessorError, Worker, WorkerHandle, WorkerId};
