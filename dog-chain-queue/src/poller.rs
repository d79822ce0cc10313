use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::{processor::Processor, QueueEngine, QueueError, QueueResult};

/// Handle for a running poll loop
pub struct PollerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl PollerHandle {
    /// Stop polling. A pass that is already running finishes first.
    pub async fn shutdown(self) -> QueueResult<()> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| QueueError::Internal(format!("Poller join error: {}", e)))
    }
}

/// Drive `engine.process_jobs` on a fixed interval until shut down.
///
/// Hosts with their own scheduler can call `process_jobs` directly instead.
pub fn spawn_poller<P>(engine: Arc<QueueEngine>, processor: Arc<P>, interval: Duration) -> PollerHandle
where
    P: Processor + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let period = interval.max(Duration::from_millis(1));

    let join_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = period.as_millis() as u64, "Queue poller started");

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Queue poller shutdown requested");
                    break;
                }

                _ = ticker.tick() => {
                    let summary = engine.process_jobs(processor.as_ref()).await;
                    if summary.selected > 0 {
                        debug!(
                            selected = summary.selected,
                            completed = summary.completed,
                            retried = summary.retried,
                            dead = summary.dead,
                            "Poll pass finished"
                        );
                    }
                }
            }
        }

        info!("Queue poller stopped");
    });

    PollerHandle {
        shutdown_tx,
        join_handle,
    }
}
