//! 📡 Elasticsearch Bulk codec -- formatting documents for the bulk API's peculiar tastes.
//!
//! Rule 1: Two lines per document. Action metadata, then document source. Always.
//! Rule 2: Newline-delimited. Not comma-separated. NEWLINES.
//! Rule 3: The trailing newline on the whole body matters. It MATTERS.
//!
//! And on the way back: the response has an `errors` flag and one item per action, in
//! request order. That order is the only thing tying a verdict to an event.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;

use crate::transforms::MappedDocument;

/// 📡 The format whisperer for ES bulk indexing.
pub(crate) struct ElasticsearchBulk;

impl ElasticsearchBulk {
    /// 🔄 One document as `{"index":{...}}\n{...source...}`, no trailing newline.
    ///
    /// Absent type/id are omitted, not nulled.
    pub(crate) fn transform_doc(doc: &MappedDocument) -> Result<String> {
        let mut the_action_metadata = Map::new();
        the_action_metadata.insert("_index".to_string(), Value::String(doc.index.clone()));
        if let Some(ref doc_type) = doc.doc_type {
            the_action_metadata.insert("_type".to_string(), Value::String(doc_type.clone()));
        }
        if let Some(ref doc_id) = doc.doc_id {
            the_action_metadata.insert("_id".to_string(), Value::String(doc_id.clone()));
        }

        let the_action_serialized = serde_json::to_string(&json!({ "index": the_action_metadata }))
            .context("💀 Failed to serialize bulk action metadata. The JSON that describes JSON has failed to become JSON.")?;

        Ok(format!("{}\n{}", the_action_serialized, doc.source_buf))
    }

    /// 📦 Join transformed pairs into a bulk body. Trailing newline included, as the API demands.
    pub(crate) fn compose_bulk_body(items: &[String]) -> String {
        let total: usize = items.iter().map(|i| i.len() + 1).sum();
        let mut body = String::with_capacity(total);
        for item in items {
            body.push_str(item);
            body.push('\n');
        }
        body
    }
}

/// 📬 What `POST /_bulk` answers with. We only read what we need.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub(crate) struct BulkResponse {
    #[serde(default)]
    pub(crate) took: u64,
    #[serde(default)]
    pub(crate) errors: bool,
    /// One entry per action, keyed by the op name (`index` for us).
    #[serde(default)]
    pub(crate) items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub(crate) struct BulkItem {
    #[serde(rename = "_index", default)]
    pub(crate) index: Option<String>,
    #[serde(rename = "_id", default)]
    pub(crate) id: Option<String>,
    pub(crate) status: u16,
    #[serde(default)]
    pub(crate) error: Option<BulkItemError>,
}

impl BulkItem {
    pub(crate) fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }
}

/// 💀 Per-item error. Sometimes an object, sometimes (older clusters) a bare string.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub(crate) enum BulkItemError {
    Detailed {
        #[serde(rename = "type", default)]
        kind: String,
        #[serde(default)]
        reason: Option<String>,
    },
    Plain(String),
}

impl BulkItemError {
    pub(crate) fn describe(&self) -> String {
        match self {
            BulkItemError::Detailed { kind, reason: Some(reason) } => format!("{kind}: {reason}"),
            BulkItemError::Detailed { kind, reason: None } => kind.clone(),
            BulkItemError::Plain(text) => text.clone(),
        }
    }
}

impl BulkResponse {
    /// Flatten `[{"index": {...}}, ...]` into the items, in order.
    pub(crate) fn into_items(self) -> Vec<BulkItem> {
        self.items
            .into_iter()
            .filter_map(|op| op.into_values().next())
            .collect()
    }
}
