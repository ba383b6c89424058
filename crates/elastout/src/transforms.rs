//! 🔄 Transforms -- from log line to bulk line.
//!
//! ```text
//!   Event ──DocumentMapper──▶ MappedDocument ──ElasticsearchBulk──▶ {"index":{..}}\n{..source..}
//!                                                                         │
//!   DeliveryReport ◀──────────────── BulkResponse ◀── POST /_bulk ◀──────┘
//! ```
//!
//! The mapper is pure and per-event: templates in, strings out, no I/O, no clock but the
//! event's own. The bulk codec knows the wire format and nothing about where it goes.

pub(crate) mod document_mapper;
pub(crate) mod elasticsearch;

pub(crate) use document_mapper::{DocumentMapper, MappedDocument};
pub(crate) use elasticsearch::{BulkResponse, ElasticsearchBulk};
