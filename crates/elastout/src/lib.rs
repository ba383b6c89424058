//! 🚀 elastout -- the last stop for a log line before it becomes a search result.
//!
//! 🎬 *[a log line walks into a bar. the bartender asks "which index?" the log line says "%{+%Y.%m.%d}".]*
//!
//! This crate is an output adapter: the upstream pipeline hands us [`Incoming`] events
//! through a channel, we turn them into Elasticsearch documents, pack them into `_bulk`
//! requests, and hand back one [`DeliveryReport`] per event so the pipeline can do its
//! at-least-once bookkeeping. 🦆
//!
//! ```text
//!   pipeline ──Incoming──▶ DispatchWorker ──NDJSON──▶ SinkBackend ──POST /_bulk──▶ cluster
//!      ▲                        │                         ▲
//!      └────DeliveryReport──────┘                  HealthWorker (re-probes nodes)
//! ```
//!
//! Startup order is fixed: [`OutputConfig::resolve`] (env placeholders, templates, TLS policy)
//! then [`ElasticOutput::connect`] (at least one node must answer) then [`ElasticOutput::start`].
//! If `connect` fails you get [`InitError::ClientCreationFailed`] and nothing was spawned.

pub mod app_config;
pub mod backends;
pub mod common;
pub mod errors;
pub mod resolver;
pub mod supervisors;
pub mod templating;
pub mod transforms;

use async_channel::{Receiver, Sender};
use tracing::info;

pub use crate::backends::SinkBackend;
pub use crate::common::{DeliveryReport, Event, EventId, Incoming};
pub use crate::errors::{FlushError, InitError};
pub use crate::resolver::{OutputConfig, ResolvedOutputConfig};
pub use crate::supervisors::{CancelHandle, DispatchSnapshot, RunningOutput, Supervisor};
pub use crate::templating::{EnvLookup, Lookup, Missing, Template};

/// 📦 A resolved, connected output that has not started consuming yet.
///
/// Holding one of these means the cluster answered at least once. It does not mean
/// it will keep answering. That part is the health worker's problem.
#[derive(Debug)]
pub struct ElasticOutput {
    config: ResolvedOutputConfig,
    sink: SinkBackend,
}

impl ElasticOutput {
    /// 🔧 Resolve the raw config against `lookup` and connect to the cluster.
    ///
    /// Config errors come back as [`InitError::Config`], an unreachable cluster as
    /// [`InitError::ClientCreationFailed`]. Neither is retried here.
    pub async fn connect(raw: &OutputConfig, lookup: &dyn Lookup) -> Result<Self, InitError> {
        let config = raw.resolve(lookup)?;
        let sink = SinkBackend::connect_elasticsearch(&config).await?;
        info!(
            "✅ Output ready: {} node(s) configured, TLS verification {}",
            config.resolved_urls.len(),
            if config.tls_verify { "on" } else { "off" }
        );
        Ok(Self { config, sink })
    }

    /// 🧪 Same as `connect`, but every bulk request lands in memory. For dry runs and tests.
    pub fn in_memory(raw: &OutputConfig, lookup: &dyn Lookup) -> Result<Self, InitError> {
        let config = raw.resolve(lookup)?;
        Ok(Self {
            config,
            sink: SinkBackend::in_memory(),
        })
    }

    pub fn resolved(&self) -> &ResolvedOutputConfig {
        &self.config
    }

    pub fn sink(&self) -> &SinkBackend {
        &self.sink
    }

    /// 🚀 Start consuming `events` and reporting into `reports`. Enters the accumulating state.
    pub fn start(self, events: Receiver<Incoming>, reports: Sender<DeliveryReport>) -> RunningOutput {
        Supervisor::new(self.config, self.sink).start(events, reports)
    }
}
