//! Lifecycle event surface shared by the broker and its workers.
//!
//! Events are delivered synchronously at the publishing call site: `publish`
//! walks the subscriber list and pushes onto each subscriber's unbounded
//! channel, dropping subscribers whose receiving end has gone away.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::job::JobId;
use crate::worker::WorkerId;

/// A lifecycle signal from the broker or a worker.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    JobAdded { id: JobId },
    JobStarted { id: JobId, worker: WorkerId },
    JobCompleted { id: JobId },
    JobFailed { id: JobId, error: String },
    JobRetry { id: JobId, attempts: u32 },
    JobsRecovered { count: usize },
    Error { message: String },
    WorkerStarted { worker: WorkerId },
    WorkerStopped { worker: WorkerId },
}

#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<QueueEvent>>>,
}

impl EventBus {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<QueueEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(sender);
        }
        receiver
    }

    pub fn publish(&self, event: QueueEvent) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        // Drop any dead subscribers while publishing.
        subscribers.retain(|sender| sender.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn every_subscriber_receives_published_events() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(QueueEvent::JobsRecovered { count: 2 });

        assert_matches!(
            first.recv().await,
            Some(QueueEvent::JobsRecovered { count: 2 })
        );
        assert_matches!(
            second.recv().await,
            Some(QueueEvent::JobsRecovered { count: 2 })
        );
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::default();
        let receiver = bus.subscribe();
        drop(receiver);

        bus.publish(QueueEvent::Error {
            message: "boom".to_owned(),
        });
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }
}
