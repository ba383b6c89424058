//! 🩺 NodePool -- the health gate.
//!
//! One `AtomicBool` per node. Flushes read it, transport failures clear it, the health
//! worker's probes set it back. Nobody holds a lock across an await because there is no lock.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{info, warn};

use crate::errors::error_chain;
use crate::resolver::Credentials;

#[derive(Debug)]
struct Node {
    url: String,
    healthy: AtomicBool,
}

/// 📡 The configured nodes, their health, and the client that talks to them.
#[derive(Debug)]
pub struct NodePool {
    nodes: Vec<Node>,
    cursor: AtomicUsize,
    client: reqwest::Client,
    credentials: Credentials,
}

impl NodePool {
    /// Every node starts down. A probe has to vouch for it first.
    pub(crate) fn new(urls: &[String], client: reqwest::Client, credentials: Credentials) -> Self {
        Self {
            nodes: urls
                .iter()
                .map(|url| Node {
                    url: url.clone(),
                    healthy: AtomicBool::new(false),
                })
                .collect(),
            cursor: AtomicUsize::new(0),
            client,
            credentials,
        }
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.healthy.load(Ordering::Acquire))
            .count()
    }

    pub fn is_healthy(&self, url: &str) -> bool {
        self.nodes
            .iter()
            .any(|n| n.url == url && n.healthy.load(Ordering::Acquire))
    }

    /// 🎯 Round-robin over the healthy nodes. `None` means the gate is closed.
    pub fn next_healthy(&self) -> Option<&str> {
        let count = self.nodes.len();
        if count == 0 {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..count)
            .map(|offset| &self.nodes[(start + offset) % count])
            .find(|node| node.healthy.load(Ordering::Acquire))
            .map(|node| node.url.as_str())
    }

    /// 💀 A flush couldn't reach this node. Out of rotation until a probe says otherwise.
    pub fn mark_down(&self, url: &str, reason: &str) {
        for node in self.nodes.iter().filter(|n| n.url == url) {
            if node.healthy.swap(false, Ordering::AcqRel) {
                warn!("💀 Node {} marked down: {}", node.url, reason);
            }
        }
    }

    /// 🔗 `{node}/{path}` with exactly one slash in between, however the node was written.
    pub(crate) fn endpoint(node: &str, path: &str) -> String {
        format!("{}/{}", node.trim_end_matches('/'), path)
    }

    /// 📡 `GET /` on every node, concurrently. Returns one verdict per node, in config order.
    pub async fn probe_all(&self) -> Vec<Result<(), String>> {
        join_all(self.nodes.iter().map(|node| self.probe(node))).await
    }

    async fn probe(&self, node: &Node) -> Result<(), String> {
        let request = self.credentials.apply(self.client.get(Self::endpoint(&node.url, "")));
        let verdict = match request.send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(format!("{} answered HTTP {}", node.url, response.status())),
            Err(e) if node.url.contains("%{") => Err(format!(
                "{}: {} (a placeholder was left unresolved; is the variable set?)",
                node.url,
                error_chain(&e)
            )),
            Err(e) => Err(format!("{}: {}", node.url, error_chain(&e))),
        };

        let was_healthy = node.healthy.swap(verdict.is_ok(), Ordering::AcqRel);
        match (&verdict, was_healthy) {
            (Ok(()), false) => info!("🩺 Node {} is answering", node.url),
            (Err(reason), true) => warn!("💀 Node {} stopped answering: {}", node.url, reason),
            _ => {}
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pool(urls: &[&str]) -> NodePool {
        let urls: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
        NodePool::new(&urls, reqwest::Client::new(), Credentials::Anonymous)
    }

    #[tokio::test]
    async fn the_one_where_nobody_is_healthy_until_proven_otherwise() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let pool = pool(&[&server.uri(), "http://127.0.0.1:1"]);
        assert_eq!(pool.healthy_count(), 0);
        assert_eq!(pool.next_healthy(), None);

        let verdicts = pool.probe_all().await;
        assert!(verdicts[0].is_ok());
        assert!(verdicts[1].is_err());
        assert_eq!(pool.healthy_count(), 1);
        assert_eq!(pool.next_healthy(), Some(server.uri().as_str()));
    }

    #[tokio::test]
    async fn the_one_where_healthy_nodes_take_turns() {
        let a = MockServer::start().await;
        let b = MockServer::start().await;
        for server in [&a, &b] {
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200))
                .mount(server)
                .await;
        }
        let pool = pool(&[&a.uri(), &b.uri()]);
        pool.probe_all().await;

        let picks: Vec<String> = (0..4)
            .filter_map(|_| pool.next_healthy().map(String::from))
            .collect();
        assert_eq!(picks, vec![a.uri(), b.uri(), a.uri(), b.uri()]);

        pool.mark_down(&a.uri(), "test says so");
        assert!(!pool.is_healthy(&a.uri()));
        assert_eq!(pool.next_healthy(), Some(b.uri().as_str()));
        assert_eq!(pool.next_healthy(), Some(b.uri().as_str()));
    }

    #[tokio::test]
    async fn the_one_where_a_500_on_the_root_is_not_a_heartbeat() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let pool = pool(&[&server.uri()]);
        let verdicts = pool.probe_all().await;
        assert!(verdicts[0].as_ref().is_err_and(|e| e.contains("503")));
        assert_eq!(pool.healthy_count(), 0);
    }
}
