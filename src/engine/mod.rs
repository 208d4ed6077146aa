//! Reconciliation engine. Discovers pending orders, queries the accrual
//! service and applies the result to the ledger.
//!
//! `Reconciler::start` is the only entry point the host process needs: it
//! runs the poller and the dispatch pool until the shutdown signal fires.

pub mod dispatcher;
pub mod poller;
pub mod queue;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use crate::accrual::AccrualSource;
use crate::config::EngineSettings;
use crate::storage::LedgerStore;
use dispatcher::{DispatchPool, DispatchSnapshot};
use poller::Poller;
use queue::work_queue;

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Owner side of the cancellation signal.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable listener handed to every task. Dropping the `ShutdownSignal`
/// counts as cancellation.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    /// 0 sizes the pool from available parallelism.
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            workers: settings.workers,
            queue_capacity: settings.queue_capacity,
        }
    }

    /// Effective pool size: the configured count, or one less than the
    /// available parallelism (at least one).
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1)
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Poller + dispatch pool over one ledger store and one accrual source.
pub struct Reconciler {
    store: Arc<dyn LedgerStore>,
    pool: DispatchPool,
    config: EngineConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        source: Arc<dyn AccrualSource>,
        config: EngineConfig,
    ) -> Self {
        let pool = DispatchPool::new(Arc::clone(&store), source, config.worker_count());
        Self { store, pool, config }
    }

    pub fn stats(&self) -> DispatchSnapshot {
        self.pool.stats().snapshot()
    }

    /// Run until `shutdown` fires. Workers finish their in-flight order;
    /// numbers still queued are dropped and rediscovered after a restart.
    pub async fn start(&self, shutdown: ShutdownListener) {
        let (producer, consumer) = work_queue(self.config.queue_capacity);

        info!(
            workers = self.pool.size(),
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            queue_capacity = self.config.queue_capacity,
            "Reconciler starting"
        );

        let workers = self.pool.spawn(consumer.clone(), shutdown.clone());

        Poller::new(Arc::clone(&self.store), self.config.poll_interval)
            .run(producer, shutdown)
            .await;

        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }

        let dropped = consumer.close().await;
        let stats = self.stats();
        info!(
            dropped,
            fetched = stats.fetched,
            applied = stats.applied,
            credited = stats.credited,
            "Reconciler stopped"
        );
    }
}
