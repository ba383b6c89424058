//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where log lines arrive endlessly..."
//! 🎬 "One supervisor dared to index them all."
//!
//! 📦 The Supervisor owns startup ordering and shutdown:
//!
//! 1. the resolved config and a connected sink come in (see [`crate::ElasticOutput`])
//! 2. the health worker is spawned, if the sink has nodes to watch
//! 3. the dispatch worker is spawned and starts accumulating
//!
//! ⚠️ Workers are the supervisor's private minions. They stay `pub(crate)`.
//! The host gets a [`RunningOutput`] handle: cancel it, read its counters, join it.

mod workers;

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backends::SinkBackend;
use crate::common::{DeliveryReport, Incoming};
use crate::resolver::ResolvedOutputConfig;
use workers::{DispatchWorker, HealthWorker, Worker};

/// 📦 Hovers over the workers asking "is it done yet?"
#[derive(Debug)]
pub struct Supervisor {
    config: ResolvedOutputConfig,
    sink: SinkBackend,
}

impl Supervisor {
    pub fn new(config: ResolvedOutputConfig, sink: SinkBackend) -> Self {
        Self { config, sink }
    }

    /// 🧵 Spawn the workers. Must be called inside a tokio runtime.
    pub fn start(self, events: Receiver<Incoming>, reports: Sender<DeliveryReport>) -> RunningOutput {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(DispatchStats::default());

        let health = self.sink.node_pool().map(|pool| {
            HealthWorker::new(pool, self.config.healthcheck_interval, shutdown_rx.clone()).start()
        });

        let dispatch = DispatchWorker::new(
            &self.config,
            Arc::new(self.sink),
            events,
            reports,
            shutdown_rx,
            Arc::clone(&stats),
        )
        .start();

        info!(
            "🚀 Output started: batches of up to {} action(s), {} bulk worker(s)",
            self.config.batch.max_actions, self.config.bulk_workers
        );
        RunningOutput {
            shutdown_tx: Arc::new(shutdown_tx),
            dispatch,
            health,
            stats,
        }
    }
}

/// 🎛️ The host's handle on a started output.
#[derive(Debug)]
pub struct RunningOutput {
    shutdown_tx: Arc<watch::Sender<bool>>,
    dispatch: JoinHandle<Result<()>>,
    health: Option<JoinHandle<Result<()>>>,
    stats: Arc<DispatchStats>,
}

impl RunningOutput {
    /// 🛑 Run-level cancellation. Intake stops, in-flight flushes are aborted, and every
    /// event not yet acknowledged gets a `Failed(Cancelled)` report.
    pub fn cancel(&self) {
        // 🔕 send_replace never fails, even with every receiver gone
        self.shutdown_tx.send_replace(true);
    }

    /// A detachable `cancel()`, for signal handlers and other tasks that can't own the output.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.shutdown_tx))
    }

    pub fn stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }

    /// 🏁 Wait for the dispatcher to finish (input closed or cancelled), then stop the
    /// health worker. Returns the final counters.
    pub async fn join(self) -> Result<DispatchSnapshot> {
        let dispatched = self
            .dispatch
            .await
            .context("💀 Dispatch worker panicked. The log lines saw things.")?;

        self.shutdown_tx.send_replace(true);
        if let Some(health) = self.health {
            health
                .await
                .context("💀 Health worker panicked")?
                .context("💀 Health worker failed")?;
        }
        let snapshot = self.stats.snapshot();
        debug!("🏁 Output joined: {:?}", snapshot);
        dispatched.context("💀 Dispatch worker failed")?;
        Ok(snapshot)
    }
}

/// 🛑 A clonable way to cancel a [`RunningOutput`] from somewhere else.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    /// Resolves once the output is cancelled, right away if it already was.
    pub async fn cancelled(&self) {
        let mut shutdown = self.0.subscribe();
        // 🔕 we hold the sender, so this only returns once the flag is up
        let _ = shutdown.wait_for(|stop| *stop).await;
    }
}

/// 📊 Live counters, bumped by the dispatcher.
#[derive(Debug, Default)]
pub(crate) struct DispatchStats {
    received: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
}

impl DispatchStats {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, report: &DeliveryReport) {
        let counter = match report {
            DeliveryReport::Acked { .. } => &self.acked,
            DeliveryReport::Rejected { .. } => &self.rejected,
            DeliveryReport::Failed { .. } => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }
}

/// 📸 A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    pub received: u64,
    pub acked: u64,
    pub rejected: u64,
    pub failed: u64,
    pub batches: u64,
}

impl DispatchSnapshot {
    /// Events with a verdict. Equals `received` once the dispatcher has finished.
    pub fn settled(&self) -> u64 {
        self.acked + self.rejected + self.failed
    }
}
