//! 📡 The sink side of the Elasticsearch backend -- pure I/O, zero buffering.
//!
//! Accepts a fully rendered NDJSON body and POSTs it to `{node}/_bulk` on whichever healthy
//! node the pool picks. No retry. Retries are the pipeline's call, not ours.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::backends::{NodePool, Sink};
use crate::errors::{FlushError, error_chain};
use crate::transforms::BulkResponse;

#[derive(Debug)]
pub struct ElasticsearchSink {
    pool: Arc<NodePool>,
    request_timeout: Duration,
}

impl ElasticsearchSink {
    pub(crate) fn new(pool: Arc<NodePool>, request_timeout: Duration) -> Self {
        Self { pool, request_timeout }
    }

    pub fn pool(&self) -> Arc<NodePool> {
        Arc::clone(&self.pool)
    }

    /// 📡 Fires a `_bulk` POST with the given NDJSON body and reads the verdict.
    ///
    /// Transport trouble (refused, reset, TLS, timeout) takes the node out of rotation.
    /// A non-2xx answer does not: the node is up, it just didn't like us.
    async fn submit_bulk_request(&self, node: &str, request_body: String) -> Result<BulkResponse, FlushError> {
        let bulk_url = NodePool::endpoint(node, "_bulk");
        let request = self
            .pool
            .client()
            .post(&bulk_url)
            // ⚠️ application/x-ndjson, not application/json. The bulk API cares.
            .header(CONTENT_TYPE, "application/x-ndjson")
            .timeout(self.request_timeout)
            .body(request_body);
        let request = self.pool.credentials().apply(request);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Err(self.transport_failure(node, &e)),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FlushError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_failure(node, &e))?;
        let parsed: BulkResponse =
            serde_json::from_slice(&bytes).map_err(|e| FlushError::MalformedResponse(e.to_string()))?;
        trace!("🚀 Bulk request landed on {} (took {}ms, errors: {})", node, parsed.took, parsed.errors);
        Ok(parsed)
    }

    fn transport_failure(&self, node: &str, err: &reqwest::Error) -> FlushError {
        let failure = if err.is_timeout() {
            FlushError::Timeout {
                node: node.to_string(),
                timeout: self.request_timeout,
            }
        } else {
            FlushError::Transport {
                node: node.to_string(),
                reason: error_chain(err),
            }
        };
        self.pool.mark_down(node, &failure.to_string());
        failure
    }
}

#[async_trait]
impl Sink for ElasticsearchSink {
    async fn send(&self, payload: String) -> Result<BulkResponse, FlushError> {
        // 🚧 gate closed: fail fast, don't even dial
        let node = self.pool.next_healthy().ok_or(FlushError::NoHealthyNode)?;
        debug!("📡 Sending {} bytes to {}/_bulk", payload.len(), node);
        self.submit_bulk_request(node, payload).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        debug!("🗑️ Elasticsearch sink closing, no buffer to flush");
        Ok(())
    }
}
