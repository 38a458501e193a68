use tokio_util::sync::CancellationToken;

use crate::store::Store;

use super::Broker;

/// The broker's periodic sweep: promote due delayed jobs, then reclaim
/// stalled leases. Runs until its token is cancelled; a failing sweep is
/// logged and retried on the next tick.
pub(super) struct MaintenanceRunner<S> {
    broker: Broker<S>,
}

impl<S> MaintenanceRunner<S>
where
    S: Store + 'static,
{
    pub fn new(broker: Broker<S>) -> Self {
        Self { broker }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) {
        let interval = self.broker.config().cleanup_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => self.sweep().await,
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the queue maintenance loop");
                        break;
                    },
                }
            }
        });
    }

    async fn sweep(&self) {
        let _ = self
            .broker
            .process_delayed()
            .await
            .inspect_err(|err| tracing::error!(?err, "Failed to promote delayed jobs: {err}"));
        let _ = self
            .broker
            .check_stalled()
            .await
            .inspect_err(|err| tracing::error!(?err, "Failed to reclaim stalled jobs: {err}"));
    }
}
