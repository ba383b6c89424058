//! 📦 A sink that never forgets, and occasionally lies on purpose.
//!
//! Every payload is kept in an `Arc<Mutex<Vec<String>>>` so tests (and `--dry-run`) can peek
//! after the dispatcher took ownership. Replies come from a script: tests line up exactly
//! what the "cluster" says to each request, in order. An empty script means "accept everything".

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::trace;

use crate::backends::Sink;
use crate::errors::FlushError;
use crate::transforms::BulkResponse;
use crate::transforms::elasticsearch::BulkItem;

/// 🎬 What the pretend cluster says to the next request.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Every document created, ids echoed back.
    Accept,
    /// This exact bulk response body.
    Respond(Value),
    /// The whole request goes wrong.
    Fail(FlushError),
    /// Never answer. For cancellation tests and existential dread.
    Stall,
    /// Accept, but only once the gate is notified.
    Gated(Arc<Notify>),
}

#[derive(Debug, Default, Clone)]
pub struct InMemorySink {
    received: Arc<tokio::sync::Mutex<Vec<String>>>,
    script: Arc<std::sync::Mutex<VecDeque<ScriptedReply>>>,
}

impl InMemorySink {
    pub fn scripted(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            received: Arc::default(),
            script: Arc::new(std::sync::Mutex::new(replies.into_iter().collect())),
        }
    }

    /// 🔍 Every bulk body sent so far, in send order.
    pub async fn payloads(&self) -> Vec<String> {
        self.received.lock().await.clone()
    }

    fn next_reply(&self) -> ScriptedReply {
        // 🔒 poisoned only if a test panicked mid-pop; accepting is as good a fallback as any
        match self.script.lock() {
            Ok(mut script) => script.pop_front().unwrap_or(ScriptedReply::Accept),
            Err(_) => ScriptedReply::Accept,
        }
    }
}

#[async_trait]
impl Sink for InMemorySink {
    async fn send(&self, payload: String) -> Result<BulkResponse, FlushError> {
        trace!("📦 InMemorySink stashing {} bytes", payload.len());
        let reply = self.next_reply();
        let accepted = accept_everything(&payload);
        self.received.lock().await.push(payload);

        match reply {
            ScriptedReply::Accept => Ok(accepted),
            ScriptedReply::Respond(body) => {
                serde_json::from_value(body).map_err(|e| FlushError::MalformedResponse(e.to_string()))
            }
            ScriptedReply::Fail(err) => Err(err),
            ScriptedReply::Stall => std::future::pending().await,
            ScriptedReply::Gated(gate) => {
                gate.notified().await;
                Ok(accepted)
            }
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// ✅ Read the action lines back and say yes to each one.
fn accept_everything(payload: &str) -> BulkResponse {
    let items = payload
        .lines()
        .step_by(2)
        .enumerate()
        .map(|(n, action_line)| {
            let action: Value = serde_json::from_str(action_line).unwrap_or(Value::Null);
            let meta = &action["index"];
            let item = BulkItem {
                index: meta["_index"].as_str().map(String::from),
                id: meta["_id"]
                    .as_str()
                    .map(String::from)
                    .or_else(|| Some(format!("mem-{n}"))),
                status: 201,
                error: None,
            };
            HashMap::from([("index".to_string(), item)])
        })
        .collect();
    BulkResponse {
        took: 0,
        errors: false,
        items,
    }
}
