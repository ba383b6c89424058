//! 💀 Errors with names.
//!
//! Most of this crate runs on `anyhow` and context strings. These two enums are the exception:
//! they cross the boundary to the host, and the host needs to tell "you typo'd the config"
//! from "the cluster is napping" from "this one batch didn't make it" without grepping strings.

use std::time::Duration;
use thiserror::Error;

/// 🚧 Why the output never started.
#[derive(Debug, Error)]
pub enum InitError {
    /// Bad template, empty URL list, URL that isn't http(s). Restarting won't fix it. Editing will.
    #[error("💀 invalid output configuration for '{key}': {reason}")]
    Config { key: String, reason: String },

    /// Not one configured node answered. Maybe later it will: restart with backoff.
    #[error("💀 client creation failed: none of the {attempted} configured node(s) answered. last error: {last_error}")]
    ClientCreationFailed { attempted: usize, last_error: String },
}

impl InitError {
    pub(crate) fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// 🔄 True when a supervising restart/backoff policy has a chance of succeeding.
    /// The adapter itself never loops on this.
    pub fn is_retryable_by_restart(&self) -> bool {
        matches!(self, Self::ClientCreationFailed { .. })
    }
}

/// 📡 Why a whole batch didn't land. Cloned into every event's `Failed` report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlushError {
    /// The health gate has every node marked down. We didn't even try.
    #[error("no healthy node in the pool")]
    NoHealthyNode,

    #[error("transport error talking to {node}: {reason}")]
    Transport { node: String, reason: String },

    #[error("bulk request to {node} timed out after {timeout:?}")]
    Timeout { node: String, timeout: Duration },

    /// The cluster answered, but not with a 2xx for the request as a whole.
    #[error("bulk request answered with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("bulk response could not be understood: {0}")]
    MalformedResponse(String),

    /// Run-level shutdown arrived before the batch was acknowledged.
    #[error("flush cancelled by shutdown")]
    Cancelled,
}

/// 🧅 Peel an error's `source()` chain into one line. reqwest hides the juicy part
/// (certificate errors, connection refused) two layers down.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut cause = err.source();
    while let Some(inner) = cause {
        let text = inner.to_string();
        if !rendered.contains(&text) {
            rendered.push_str(": ");
            rendered.push_str(&text);
        }
        cause = inner.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_only_connectivity_deserves_a_restart() {
        let config = InitError::config("index", "unterminated placeholder");
        let connectivity = InitError::ClientCreationFailed {
            attempted: 2,
            last_error: "connection refused".into(),
        };
        assert!(!config.is_retryable_by_restart());
        assert!(connectivity.is_retryable_by_restart());
        assert!(connectivity.to_string().contains("client creation failed"));
    }

    #[test]
    fn the_one_where_the_onion_is_peeled() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        let outer = std::io::Error::other(inner);
        let rendered = error_chain(&outer);
        assert!(rendered.contains("connection refused"));
    }
}
