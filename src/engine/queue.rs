//! Work queue between the poller and the dispatch pool.
//!
//! A bounded tokio mpsc channel whose receiver is shared by all workers
//! behind an async mutex. A set of claimed order numbers keeps the poller
//! from enqueueing an order that is still queued or being processed.

use dashmap::DashSet;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::ShutdownListener;
use crate::types::OrderNumber;

/// Result of offering an order number to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Enqueued,
    /// The order is already queued or in flight.
    AlreadyClaimed,
    /// Shutdown fired or the queue was closed before the number was admitted.
    Closed,
}

/// Create a queue with room for `capacity` numbers.
pub fn work_queue(capacity: usize) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let claimed = Arc::new(DashSet::new());
    (
        QueueProducer {
            tx,
            claimed: Arc::clone(&claimed),
        },
        QueueConsumer {
            rx: Arc::new(Mutex::new(rx)),
            claimed,
        },
    )
}

/// Sending half, owned by the poller.
#[derive(Debug)]
pub struct QueueProducer {
    tx: mpsc::Sender<OrderNumber>,
    claimed: Arc<DashSet<OrderNumber>>,
}

impl QueueProducer {
    /// Claim `number` and push it, waiting for room unless shutdown fires.
    pub async fn offer(&self, number: OrderNumber, shutdown: &mut ShutdownListener) -> Offer {
        if !self.claimed.insert(number.clone()) {
            return Offer::AlreadyClaimed;
        }

        let sent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            res = self.tx.send(number.clone()) => res.is_ok(),
        };

        if sent {
            Offer::Enqueued
        } else {
            self.claimed.remove(&number);
            Offer::Closed
        }
    }
}

/// Receiving half, cloned into every worker.
#[derive(Debug, Clone)]
pub struct QueueConsumer {
    rx: Arc<Mutex<mpsc::Receiver<OrderNumber>>>,
    claimed: Arc<DashSet<OrderNumber>>,
}

impl QueueConsumer {
    /// Next queued number; `None` once the queue is closed and empty. The
    /// number stays claimed until the returned [`Claim`] is dropped.
    pub async fn next(&self) -> Option<Claim> {
        let number = self.rx.lock().await.recv().await?;
        Some(Claim {
            number,
            claimed: Arc::clone(&self.claimed),
        })
    }

    /// Number of orders currently queued or in flight.
    pub fn claimed(&self) -> usize {
        self.claimed.len()
    }

    /// Stop admitting numbers and drop whatever is still buffered.
    /// Returns how many numbers were dropped.
    pub async fn close(&self) -> usize {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut dropped = 0;
        while let Ok(number) = rx.try_recv() {
            self.claimed.remove(&number);
            dropped += 1;
        }
        dropped
    }
}

/// A dequeued order number. Dropping it releases the claim, whatever path
/// the worker leaves by.
#[derive(Debug)]
pub struct Claim {
    number: OrderNumber,
    claimed: Arc<DashSet<OrderNumber>>,
}

impl Deref for Claim {
    type Target = str;

    fn deref(&self) -> &str {
        &self.number
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.claimed.remove(&self.number);
    }
}
