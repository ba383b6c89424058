//! 🩺 HealthWorker -- knocks on every node's door at a fixed interval.
//!
//! Down nodes that answer go back into rotation. Healthy nodes that stop answering go out.
//! No restart needed for either.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::{Worker, cancelled};
use crate::backends::NodePool;

#[derive(Debug)]
pub(crate) struct HealthWorker {
    pool: Arc<NodePool>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl HealthWorker {
    pub(crate) fn new(pool: Arc<NodePool>, interval: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            pool,
            interval,
            shutdown,
        }
    }
}

impl Worker for HealthWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("🩺 HealthWorker started, probing every {:?}", self.interval);
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // ⏰ the first tick is immediate and startup already probed everyone
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled(&mut self.shutdown) => break,
                    _ = ticker.tick() => {
                        self.pool.probe_all().await;
                        trace!("🩺 {}/{} node(s) healthy", self.pool.healthy_count(), self.pool.len());
                    }
                }
            }

            debug!("🏁 HealthWorker: shutdown received. Hanging up the stethoscope.");
            Ok(())
        })
    }
}
