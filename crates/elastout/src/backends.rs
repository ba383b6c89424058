//! 🔌 Backends -- where the real I/O happens.
//!
//! 🕳️ A sink receives a fully rendered NDJSON body and brings back the cluster's verdict.
//! It does not buffer. It does not transform. It does not retry. The dispatcher does the
//! thinking; sinks do the postage.
//!
//! 🦆 The duck is here because every file must have one. This is law.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::errors::{FlushError, InitError};
use crate::resolver::ResolvedOutputConfig;
use crate::transforms::BulkResponse;

pub mod elasticsearch;
pub mod in_mem;

pub use elasticsearch::{ElasticsearchSink, NodePool};
pub use in_mem::{InMemorySink, ScriptedReply};

/// 🕳️ A sink that sends pre-rendered bulk bodies.
///
/// # Contract 📜
/// - `send` takes `&self`: several flushes may be in flight through the same sink.
/// - `send` returns the parsed bulk response, or a [`FlushError`] for the batch as a whole.
///   Per-document verdicts live inside the response; picking them apart is the caller's job.
/// - `close` releases whatever the sink holds. Called once, after the last flush settled.
#[async_trait]
pub(crate) trait Sink: std::fmt::Debug + Send + Sync {
    async fn send(&self, payload: String) -> Result<BulkResponse, FlushError>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// 🎭 The many faces of a Sink.
///
/// The enum dispatches to the concrete type, keeping the dispatcher blissfully ignorant
/// of whether documents land in a cluster or in a `Vec`.
#[derive(Debug)]
pub enum SinkBackend {
    InMemory(InMemorySink),
    Elasticsearch(ElasticsearchSink),
}

impl SinkBackend {
    /// 🚀 Build the client, probe every configured node, keep the ones that answered healthy.
    pub async fn connect_elasticsearch(config: &ResolvedOutputConfig) -> Result<Self, InitError> {
        let pool = elasticsearch::client_factory::connect(config).await?;
        Ok(SinkBackend::Elasticsearch(ElasticsearchSink::new(
            Arc::new(pool),
            config.request_timeout,
        )))
    }

    /// 🧪 A sink that accepts everything and remembers it.
    pub fn in_memory() -> Self {
        SinkBackend::InMemory(InMemorySink::default())
    }

    /// The health gate's pool, if this backend has one. The in-memory sink is always healthy.
    pub fn node_pool(&self) -> Option<Arc<NodePool>> {
        match self {
            SinkBackend::InMemory(_) => None,
            SinkBackend::Elasticsearch(sink) => Some(sink.pool()),
        }
    }
}

#[async_trait]
impl Sink for SinkBackend {
    async fn send(&self, payload: String) -> Result<BulkResponse, FlushError> {
        match self {
            SinkBackend::InMemory(sink) => sink.send(payload).await,
            SinkBackend::Elasticsearch(sink) => sink.send(payload).await,
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        debug!("🗑️ Closing sink backend");
        match self {
            SinkBackend::InMemory(sink) => sink.close().await,
            SinkBackend::Elasticsearch(sink) => sink.close().await,
        }
    }
}
