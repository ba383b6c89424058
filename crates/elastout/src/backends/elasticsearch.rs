//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! 🎬 COLD OPEN -- INT. SERVER ROOM -- 3:47 AM
//!
//! The monitoring dashboard glows amber in the dark. Two of three nodes are answering.
//! The third stopped caring around midnight. The bulk requests keep coming.
//!
//! Three pieces:
//! - [`client_factory`]: builds the one `reqwest::Client`, applies the TLS policy, probes
//!   every node once, and refuses to hand back a pool with nobody home.
//! - [`NodePool`]: the health gate. Which nodes are up, whose turn it is, who just fell over.
//! - [`ElasticsearchSink`]: `POST {node}/_bulk`, then reads the verdict.
//!
//! 🦆

pub(crate) mod client_factory;
mod elasticsearch_sink;
mod node_pool;

pub use elasticsearch_sink::ElasticsearchSink;
pub use node_pool::NodePool;
