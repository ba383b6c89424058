//! 🏗️ Client Factory -- one `reqwest::Client`, one TLS policy, at least one node that answers.
//!
//! Certificate verification is on unless the config explicitly turned it off. An untrusted
//! certificate with verification on shows up as a failed probe, same as a refused connection.

use tracing::{debug, info, warn};

use crate::backends::NodePool;
use crate::errors::{InitError, error_chain};
use crate::resolver::ResolvedOutputConfig;

/// 🔧 Build the HTTP client the way the config says.
pub(crate) fn build_client(config: &ResolvedOutputConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .danger_accept_invalid_certs(!config.tls_verify)
        .build()
}

/// 🚀 Build the pool and probe every node once. Zero answers: `ClientCreationFailed`.
///
/// Nodes that didn't answer stay in the pool, marked down, so the health worker can bring
/// them back later.
pub(crate) async fn connect(config: &ResolvedOutputConfig) -> Result<NodePool, InitError> {
    let attempted = config.resolved_urls.len();
    let client = build_client(config).map_err(|e| InitError::ClientCreationFailed {
        attempted,
        last_error: format!("the HTTP client refused to be born: {}", error_chain(&e)),
    })?;

    let pool = NodePool::new(&config.resolved_urls, client, config.credentials.clone());
    debug!("📡 Probing {} node(s)", attempted);
    let verdicts = pool.probe_all().await;

    let mut last_error = None;
    for verdict in verdicts {
        if let Err(reason) = verdict {
            warn!("⚠️ Node unreachable at startup: {}", reason);
            last_error = Some(reason);
        }
    }

    if pool.healthy_count() == 0 {
        return Err(InitError::ClientCreationFailed {
            attempted,
            last_error: last_error.unwrap_or_else(|| "no nodes configured".to_string()),
        });
    }

    info!("✅ Connected: {}/{} node(s) healthy", pool.healthy_count(), attempted);
    Ok(pool)
}
