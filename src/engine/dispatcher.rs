//! Dispatch pool: a fixed set of workers turning queued order numbers into
//! ledger updates.
//!
//! Each worker loops `Idle → Fetching → Updating → Idle` and leaves via
//! `Draining → Terminated` once shutdown fires. Rate limiting is handled by
//! a pool-wide [`RateGate`]: when any worker is told to back off, every
//! worker stops issuing requests until the gate reopens.

use futures::FutureExt;
use rust_decimal::Decimal;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::queue::QueueConsumer;
use super::ShutdownListener;
use crate::accrual::{translate_status, AccrualReply, AccrualSource, FetchOutcome};
use crate::storage::{LedgerError, LedgerStore};
use crate::types::UpdateOutcome;

// ---------------------------------------------------------------------------
// Worker phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Fetching,
    Updating,
    Draining,
    Terminated,
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerPhase::Idle => "idle",
            WorkerPhase::Fetching => "fetching",
            WorkerPhase::Updating => "updating",
            WorkerPhase::Draining => "draining",
            WorkerPhase::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Rate gate
// ---------------------------------------------------------------------------

/// Pool-wide pause shared by all workers.
#[derive(Debug)]
pub struct RateGate {
    paused_until: watch::Sender<Option<Instant>>,
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RateGate {
    pub fn new() -> Self {
        let (paused_until, _) = watch::channel(None);
        Self { paused_until }
    }

    /// Close the gate for `wait` from now. An existing, longer pause is
    /// kept. Returns the instant the gate reopens.
    pub fn pause_for(&self, wait: Duration) -> Instant {
        let until = Instant::now() + wait;
        self.paused_until.send_modify(|current| {
            if (*current).map_or(true, |existing| existing < until) {
                *current = Some(until);
            }
        });
        self.reopens_at().unwrap_or(until)
    }

    /// When the gate reopens, or `None` if it is open.
    pub fn reopens_at(&self) -> Option<Instant> {
        let until = *self.paused_until.borrow();
        until.filter(|t| *t > Instant::now())
    }

    /// Wait until the gate is open. Re-checks after each sleep because
    /// another worker may have extended the pause.
    pub async fn wait_open(&self) {
        while let Some(until) = self.reopens_at() {
            tokio::time::sleep_until(until).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Counters shared by all workers.
#[derive(Debug, Default)]
pub struct DispatchStats {
    fetched: AtomicU64,
    applied: AtomicU64,
    credited: AtomicU64,
    not_registered: AtomicU64,
    rate_limited: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    /// Requests sent to the accrual service.
    pub fetched: u64,
    /// Ledger updates that changed an order.
    pub applied: u64,
    /// Updates that credited a balance.
    pub credited: u64,
    pub not_registered: u64,
    pub rate_limited: u64,
    /// Transport errors, unknown statuses and store errors.
    pub failed: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            fetched: self.fetched.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            credited: self.credited.load(Ordering::Relaxed),
            not_registered: self.not_registered.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Fixed-size worker pool.
pub struct DispatchPool {
    store: Arc<dyn LedgerStore>,
    source: Arc<dyn AccrualSource>,
    gate: Arc<RateGate>,
    stats: Arc<DispatchStats>,
    size: usize,
}

impl DispatchPool {
    pub fn new(store: Arc<dyn LedgerStore>, source: Arc<dyn AccrualSource>, size: usize) -> Self {
        Self {
            store,
            source,
            gate: Arc::new(RateGate::new()),
            stats: Arc::new(DispatchStats::default()),
            size: size.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Spawn the workers on the current runtime.
    pub fn spawn(&self, queue: QueueConsumer, shutdown: ShutdownListener) -> Vec<JoinHandle<()>> {
        (0..self.size)
            .map(|id| {
                let worker = Worker {
                    id,
                    store: Arc::clone(&self.store),
                    source: Arc::clone(&self.source),
                    gate: Arc::clone(&self.gate),
                    stats: Arc::clone(&self.stats),
                    queue: queue.clone(),
                };
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect()
    }
}

/// How one dequeued order ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Applied,
    Unchanged,
    /// Left pending for a later tick.
    Deferred,
    /// Shutdown fired while the order waited on the rate gate.
    Abandoned,
}

struct Worker {
    id: usize,
    store: Arc<dyn LedgerStore>,
    source: Arc<dyn AccrualSource>,
    gate: Arc<RateGate>,
    stats: Arc<DispatchStats>,
    queue: QueueConsumer,
}

impl Worker {
    async fn run(self, mut shutdown: ShutdownListener) {
        debug!(worker = self.id, phase = %WorkerPhase::Idle, "Worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                next = async {
                    self.gate.wait_open().await;
                    self.queue.next().await
                } => next,
            };

            let Some(claim) = next else { break };
            let number: &str = &claim;

            // A panic while handling one order must not take the worker out
            // of the pool. The claim is released when `claim` drops.
            match AssertUnwindSafe(self.process(number, &mut shutdown))
                .catch_unwind()
                .await
            {
                Ok(outcome) => trace!(worker = self.id, order = number, ?outcome, "Order handled"),
                Err(_) => {
                    DispatchStats::bump(&self.stats.failed);
                    error!(worker = self.id, order = number, "Order handling panicked");
                }
            }
        }

        debug!(worker = self.id, phase = %WorkerPhase::Draining, "Worker draining");
        debug!(worker = self.id, phase = %WorkerPhase::Terminated, "Worker stopped");
    }

    /// Fetch and apply one order. A rate-limited order is retried by this
    /// worker once the gate reopens.
    async fn process(&self, number: &str, shutdown: &mut ShutdownListener) -> ItemOutcome {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return ItemOutcome::Abandoned,
                _ = self.gate.wait_open() => {}
            }

            trace!(worker = self.id, order = number, phase = %WorkerPhase::Fetching);
            let fetched = self.source.fetch(number).await;
            DispatchStats::bump(&self.stats.fetched);

            match fetched {
                Ok(FetchOutcome::Ready(reply)) => return self.apply(number, reply).await,
                Ok(FetchOutcome::NotRegistered) => {
                    DispatchStats::bump(&self.stats.not_registered);
                    debug!(worker = self.id, order = number, "Order not registered yet");
                    return ItemOutcome::Deferred;
                }
                Ok(FetchOutcome::RateLimited(wait)) => {
                    DispatchStats::bump(&self.stats.rate_limited);
                    self.gate.pause_for(wait);
                    warn!(
                        worker = self.id,
                        order = number,
                        wait_secs = wait.as_secs(),
                        "Rate limited, pausing all workers"
                    );
                }
                Err(e) => {
                    DispatchStats::bump(&self.stats.failed);
                    warn!(worker = self.id, order = number, error = %e, "Accrual lookup failed, will retry next tick");
                    return ItemOutcome::Deferred;
                }
            }
        }
    }

    async fn apply(&self, number: &str, reply: AccrualReply) -> ItemOutcome {
        let status = match translate_status(&reply.status) {
            Ok(status) => status,
            Err(e) => {
                DispatchStats::bump(&self.stats.failed);
                warn!(worker = self.id, order = number, error = %e, "Skipping order");
                return ItemOutcome::Deferred;
            }
        };

        if reply.order != number {
            warn!(order = number, reported = %reply.order, "Accrual service echoed a different order number");
        }

        trace!(worker = self.id, order = number, phase = %WorkerPhase::Updating, %status);
        match self.store.apply_accrual_update(number, status, reply.accrual).await {
            Ok(UpdateOutcome::Applied { credited }) => {
                DispatchStats::bump(&self.stats.applied);
                if credited > Decimal::ZERO {
                    DispatchStats::bump(&self.stats.credited);
                }
                info!(order = number, %status, %credited, "Order updated");
                ItemOutcome::Applied
            }
            Ok(outcome) => {
                debug!(order = number, %status, ?outcome, "Order left unchanged");
                ItemOutcome::Unchanged
            }
            Err(LedgerError::OrderNotFound(_)) => {
                DispatchStats::bump(&self.stats.failed);
                warn!(order = number, "Order disappeared from the ledger");
                ItemOutcome::Deferred
            }
            Err(LedgerError::InvalidAmount(amount)) => {
                DispatchStats::bump(&self.stats.failed);
                warn!(order = number, %amount, "Accrual amount rejected by the ledger");
                ItemOutcome::Deferred
            }
            Err(e) => {
                DispatchStats::bump(&self.stats.failed);
                error!(order = number, error = %e, "Ledger update failed");
                ItemOutcome::Deferred
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
