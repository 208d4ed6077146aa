//! Poller: periodically discovers pending orders and feeds the work queue.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::queue::{Offer, QueueProducer};
use super::ShutdownListener;
use crate::storage::{LedgerError, LedgerStore};

/// What one discovery pass found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Pending orders returned by the store.
    pub discovered: usize,
    /// Numbers pushed to the queue.
    pub enqueued: usize,
    /// Numbers already queued or in flight.
    pub skipped: usize,
}

pub struct Poller {
    store: Arc<dyn LedgerStore>,
    interval: Duration,
}

impl Poller {
    pub fn new(store: Arc<dyn LedgerStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Tick until shutdown. A failed tick is logged and retried on the next
    /// one; the first tick fires immediately.
    pub async fn run(&self, producer: QueueProducer, mut shutdown: ShutdownListener) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs_f64(), "Poller started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.tick(&producer, &mut shutdown).await {
                Ok(report) if report.discovered > 0 => {
                    debug!(
                        discovered = report.discovered,
                        enqueued = report.enqueued,
                        skipped = report.skipped,
                        "Poll tick"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Failed to list pending orders"),
            }
        }

        info!("Poller stopped");
    }

    /// One discovery pass. Stops early if shutdown fires while the queue is
    /// full.
    pub async fn tick(
        &self,
        producer: &QueueProducer,
        shutdown: &mut ShutdownListener,
    ) -> Result<TickReport, LedgerError> {
        let pending = self.store.list_pending().await?;
        let mut report = TickReport {
            discovered: pending.len(),
            ..TickReport::default()
        };

        for number in pending {
            match producer.offer(number, shutdown).await {
                Offer::Enqueued => report.enqueued += 1,
                Offer::AlreadyClaimed => report.skipped += 1,
                Offer::Closed => break,
            }
        }

        Ok(report)
    }
}
