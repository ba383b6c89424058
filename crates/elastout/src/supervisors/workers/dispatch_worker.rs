//! 🎬 *[a channel fills with log lines. somewhere, a cluster waits.]*
//!
//! 🗑️ The DispatchWorker: drains the events channel, maps each event, accumulates bulk
//! batches, flushes them, and turns every bulk response into one report per event.
//!
//! ```text
//!            push                      launch                 settle
//!   event ──────────▶ Accumulating ──────────────▶ Flushing ──────────▶ Acknowledged
//!                      │ full / timer              │ (JoinSet,            PartiallyFailed
//!                      │                           │  ≤ bulk_workers)     Failed
//!                      └─ intake pauses while a full batch waits for a free worker slot
//! ```
//!
//! Order is kept inside a batch and batches launch in accumulation order. Settling can
//! happen out of order; reports carry their `EventId` so nobody has to care.
//!
//! ⚠️ No retries here. A failed batch becomes `Failed` reports and the pipeline decides.

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{Worker, cancelled};
use crate::backends::{Sink, SinkBackend};
use crate::common::{DeliveryReport, EventId, Incoming};
use crate::errors::FlushError;
use crate::resolver::{BatchPolicy, ResolvedOutputConfig};
use crate::supervisors::DispatchStats;
use crate::transforms::{BulkResponse, DocumentMapper, ElasticsearchBulk};

/// 🏷️ Who a document in the batch belongs to, for when the verdict comes back.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BatchEntry {
    pub(crate) event_id: EventId,
    pub(crate) index: String,
    pub(crate) doc_id: Option<String>,
}

/// 📦 One bulk request in the making. Created empty, grows, gets flushed, gets discarded.
#[derive(Debug, Default)]
pub(crate) struct BulkBatch {
    entries: Vec<BatchEntry>,
    lines: Vec<String>,
    bytes: usize,
    opened_at: Option<Instant>,
}

impl BulkBatch {
    fn push(&mut self, entry: BatchEntry, line: String) {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        self.bytes += line.len() + 1;
        self.entries.push(entry);
        self.lines.push(line);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_full(&self, policy: &BatchPolicy) -> bool {
        self.len() >= policy.max_actions || self.bytes >= policy.max_bytes
    }

    /// ⏰ When the timer should force this batch out. `None` while empty.
    fn deadline(&self, policy: &BatchPolicy) -> Option<Instant> {
        self.opened_at.map(|opened| opened + policy.flush_interval)
    }

    fn seal(self) -> (Vec<BatchEntry>, String) {
        (self.entries, ElasticsearchBulk::compose_bulk_body(&self.lines))
    }
}

/// 🎯 How a flush ended, before it is fanned out into per-event reports.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BatchOutcome {
    Acknowledged(Vec<DeliveryReport>),
    PartiallyFailed(Vec<DeliveryReport>),
    Failed(FlushError),
}

impl BatchOutcome {
    pub(crate) fn into_reports(self, entries: &[BatchEntry]) -> Vec<DeliveryReport> {
        match self {
            BatchOutcome::Acknowledged(reports) | BatchOutcome::PartiallyFailed(reports) => reports,
            BatchOutcome::Failed(error) => fail_all(entries, &error),
        }
    }
}

fn fail_all(entries: &[BatchEntry], error: &FlushError) -> Vec<DeliveryReport> {
    entries
        .iter()
        .map(|entry| DeliveryReport::Failed {
            id: entry.event_id,
            error: error.clone(),
        })
        .collect()
}

/// 🔍 Match the bulk response to the batch, item by item, in request order.
///
/// Accepted items are acked right away, independent of their neighbours. Rejected items get
/// a `Rejected` report with whatever the cluster said. An item count that doesn't line up
/// means we can't tell who is who, so the whole batch is `Failed`.
pub(crate) fn classify(entries: &[BatchEntry], result: Result<BulkResponse, FlushError>) -> BatchOutcome {
    let response = match result {
        Ok(response) => response,
        Err(error) => return BatchOutcome::Failed(error),
    };

    let flagged_errors = response.errors;
    let items = response.into_items();
    if items.is_empty() && !flagged_errors {
        // 🤷 some proxies trim `items`; no errors flagged means everything made it
        return BatchOutcome::Acknowledged(
            entries
                .iter()
                .map(|entry| DeliveryReport::Acked { id: entry.event_id })
                .collect(),
        );
    }
    if items.len() != entries.len() {
        return BatchOutcome::Failed(FlushError::MalformedResponse(format!(
            "sent {} action(s) but the response has {} item(s)",
            entries.len(),
            items.len()
        )));
    }

    let mut any_rejected = false;
    let reports = entries
        .iter()
        .zip(items)
        .map(|(entry, item)| {
            if item.is_success() {
                return DeliveryReport::Acked { id: entry.event_id };
            }
            any_rejected = true;
            DeliveryReport::Rejected {
                id: entry.event_id,
                index: item.index.clone().unwrap_or_else(|| entry.index.clone()),
                doc_id: item.id.clone().or_else(|| entry.doc_id.clone()),
                status: item.status,
                reason: item
                    .error
                    .as_ref()
                    .map(|e| e.describe())
                    .unwrap_or_else(|| format!("bulk item answered HTTP {}", item.status)),
            }
        })
        .collect();

    if any_rejected {
        BatchOutcome::PartiallyFailed(reports)
    } else {
        BatchOutcome::Acknowledged(reports)
    }
}

/// 🗑️ The dispatcher. One per running output.
#[derive(Debug)]
pub(crate) struct DispatchWorker {
    events: Receiver<Incoming>,
    reports: Sender<DeliveryReport>,
    mapper: DocumentMapper,
    sink: Arc<SinkBackend>,
    policy: BatchPolicy,
    bulk_workers: usize,
    shutdown: watch::Receiver<bool>,
    stats: Arc<DispatchStats>,
}

impl DispatchWorker {
    pub(crate) fn new(
        config: &ResolvedOutputConfig,
        sink: Arc<SinkBackend>,
        events: Receiver<Incoming>,
        reports: Sender<DeliveryReport>,
        shutdown: watch::Receiver<bool>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            events,
            reports,
            mapper: DocumentMapper::new(config),
            sink,
            policy: config.batch,
            bulk_workers: config.bulk_workers.max(1),
            shutdown,
            stats,
        }
    }

    async fn run(self) -> Result<()> {
        let mut batch = BulkBatch::default();
        let mut in_flight: JoinSet<Vec<DeliveryReport>> = JoinSet::new();
        let mut flush_due = false;
        let mut shutdown = self.shutdown.clone();

        let cancelled_run = loop {
            let has_capacity = in_flight.len() < self.bulk_workers;
            if !batch.is_empty() && (flush_due || batch.is_full(&self.policy)) && has_capacity {
                self.launch(std::mem::take(&mut batch), &mut in_flight);
                flush_due = false;
                continue;
            }

            // ⏰ a far-future placeholder keeps the select arm well-typed while the batch is empty
            let deadline = batch
                .deadline(&self.policy)
                .unwrap_or_else(|| Instant::now() + self.policy.flush_interval);

            tokio::select! {
                biased;

                _ = cancelled(&mut shutdown) => break true,

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.settle(joined).await?;
                }

                incoming = self.events.recv(), if !batch.is_full(&self.policy) => match incoming {
                    Ok(incoming) => self.accept(incoming, &mut batch).await,
                    Err(_) => break false,
                },

                _ = tokio::time::sleep_until(deadline), if !batch.is_empty() && !flush_due => {
                    trace!("⏰ Flush interval elapsed with {} document(s) waiting", batch.len());
                    flush_due = true;
                }
            }
        };

        if cancelled_run {
            debug!("🛑 DispatchWorker: cancelled with {} unsent and {} in-flight batch(es)", batch.len(), in_flight.len());
            let (entries, _) = batch.seal();
            self.publish(fail_all(&entries, &FlushError::Cancelled)).await;
        } else {
            debug!("🏁 DispatchWorker: events channel closed. Final flush of {} document(s).", batch.len());
            if !batch.is_empty() {
                while in_flight.len() >= self.bulk_workers {
                    match in_flight.join_next().await {
                        Some(joined) => self.settle(joined).await?,
                        None => break,
                    }
                }
                self.launch(batch, &mut in_flight);
            }
        }

        // 🧹 in-flight flushes watch the shutdown flag themselves, so this drains either way
        while let Some(joined) = in_flight.join_next().await {
            self.settle(joined).await?;
        }

        self.sink
            .close()
            .await
            .context("💀 DispatchWorker failed to close the sink")?;
        Ok(())
    }

    /// 📥 Map one event and add it to the batch. Unmappable events are rejected on the spot.
    async fn accept(&self, incoming: Incoming, batch: &mut BulkBatch) {
        self.stats.record_received();
        let Incoming { id, event } = incoming;

        let mapped = match self.mapper.map(id, &event) {
            Ok(mapped) => mapped,
            Err(err) => {
                warn!("🚫 Event {} cannot be indexed: {}", id, err);
                self.publish(vec![DeliveryReport::Rejected {
                    id,
                    index: err.index,
                    doc_id: err.doc_id,
                    status: 0,
                    reason: err.reason,
                }])
                .await;
                return;
            }
        };

        match ElasticsearchBulk::transform_doc(&mapped) {
            Ok(line) => batch.push(
                BatchEntry {
                    event_id: mapped.event_id,
                    index: mapped.index,
                    doc_id: mapped.doc_id,
                },
                line,
            ),
            Err(err) => {
                self.publish(vec![DeliveryReport::Rejected {
                    id,
                    index: mapped.index,
                    doc_id: mapped.doc_id,
                    status: 0,
                    reason: format!("{err:#}"),
                }])
                .await;
            }
        }
    }

    /// 🚀 Seal the batch and hand it to a flush task.
    fn launch(&self, batch: BulkBatch, in_flight: &mut JoinSet<Vec<DeliveryReport>>) {
        let (entries, body) = batch.seal();
        debug!("📡 Flushing {} document(s), {} bytes", entries.len(), body.len());
        self.stats.record_batch();

        let sink = Arc::clone(&self.sink);
        let mut shutdown = self.shutdown.clone();
        in_flight.spawn(async move {
            let outcome = tokio::select! {
                result = sink.send(body) => classify(&entries, result),
                _ = cancelled(&mut shutdown) => BatchOutcome::Failed(FlushError::Cancelled),
            };
            if let BatchOutcome::Failed(ref error) = outcome {
                warn!("💀 Bulk flush of {} document(s) failed: {}", entries.len(), error);
            }
            outcome.into_reports(&entries)
        });
    }

    async fn settle(&self, joined: Result<Vec<DeliveryReport>, JoinError>) -> Result<()> {
        let reports = joined.context("💀 A flush task panicked. Its events have no verdict.")?;
        self.publish(reports).await;
        Ok(())
    }

    /// 📤 Count and send reports upstream. A closed reports channel is logged, not fatal.
    async fn publish(&self, reports: Vec<DeliveryReport>) {
        for report in reports {
            self.stats.record(&report);
            if self.reports.send(report).await.is_err() {
                warn!("⚠️ Reports channel closed; delivery verdicts are going nowhere");
            }
        }
    }
}

impl Worker for DispatchWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("📥 DispatchWorker started draining events...");
            self.run().await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InMemorySink, ScriptedReply};
    use crate::common::Event;
    use crate::resolver::OutputConfig;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    struct Harness {
        events: Sender<Incoming>,
        reports: Receiver<DeliveryReport>,
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<Result<()>>,
        sink: InMemorySink,
        stats: Arc<DispatchStats>,
    }

    fn harness(config: OutputConfig, sink: InMemorySink) -> Harness {
        let resolved = config
            .resolve(&HashMap::<String, String>::new())
            .expect("💀 test config resolves");
        let (events_tx, events_rx) = async_channel::bounded(64);
        let (reports_tx, reports_rx) = async_channel::bounded(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(DispatchStats::default());
        let handle = DispatchWorker::new(
            &resolved,
            Arc::new(SinkBackend::InMemory(sink.clone())),
            events_rx,
            reports_tx,
            shutdown_rx,
            Arc::clone(&stats),
        )
        .start();
        Harness {
            events: events_tx,
            reports: reports_rx,
            shutdown: shutdown_tx,
            handle,
            sink,
            stats,
        }
    }

    fn config(bulk_actions: i64) -> OutputConfig {
        OutputConfig {
            url: vec!["http://127.0.0.1:9200".into()],
            index: "logs".into(),
            document_id: "%{rid}".into(),
            bulk_actions,
            ..OutputConfig::default()
        }
    }

    fn event(rid: &str) -> Event {
        Event::new(Utc::now(), format!("event {rid}")).with_field("rid", rid)
    }

    async fn feed(h: &Harness, ids: &[u64]) {
        for id in ids {
            h.events
                .send(Incoming {
                    id: EventId(*id),
                    event: event(&format!("r{id}")),
                })
                .await
                .expect("events channel open");
        }
    }

    async fn finish(h: Harness) -> (Vec<DeliveryReport>, Vec<String>) {
        drop(h.events);
        tokio::time::timeout(Duration::from_secs(5), h.handle)
            .await
            .expect("💀 dispatcher should finish")
            .expect("no panic")
            .expect("clean exit");
        let mut reports = Vec::new();
        while let Ok(report) = h.reports.try_recv() {
            reports.push(report);
        }
        reports.sort_by_key(DeliveryReport::id);
        (reports, h.sink.payloads().await)
    }

    fn entries(n: u64) -> Vec<BatchEntry> {
        (0..n)
            .map(|i| BatchEntry {
                event_id: EventId(i),
                index: "logs".into(),
                doc_id: Some(format!("r{i}")),
            })
            .collect()
    }

    #[tokio::test]
    async fn the_one_where_zero_means_every_event_flies_alone() {
        let h = harness(config(0), InMemorySink::default());
        feed(&h, &[1, 2, 3]).await;
        let (reports, payloads) = finish(h).await;

        assert_eq!(payloads.len(), 3, "one bulk request per event");
        assert!(payloads.iter().all(|p| p.lines().count() == 2));
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(DeliveryReport::is_acked));
    }

    #[tokio::test]
    async fn the_one_where_a_count_threshold_packs_events_together() {
        let mut cfg = config(2);
        cfg.bulk_workers = 1;
        let h = harness(cfg, InMemorySink::default());
        feed(&h, &[1, 2, 3, 4, 5]).await;
        let stats = Arc::clone(&h.stats);
        let (reports, payloads) = finish(h).await;

        let sizes: Vec<usize> = payloads.iter().map(|p| p.lines().count() / 2).collect();
        assert_eq!(sizes, vec![2, 2, 1], "two full batches, then the leftover on close");
        assert_eq!(reports.len(), 5);
        assert_eq!(stats.snapshot().batches, 3);
        assert_eq!(stats.snapshot().acked, 5);

        // 📜 order within a batch is accumulation order
        let first: Vec<serde_json::Value> = payloads[0]
            .lines()
            .step_by(2)
            .map(|l| serde_json::from_str(l).expect("action json"))
            .collect();
        assert_eq!(first[0]["index"]["_id"], "r1");
        assert_eq!(first[1]["index"]["_id"], "r2");
    }

    #[tokio::test]
    async fn the_one_where_the_timer_flushes_a_lonely_batch() {
        let mut cfg = config(100);
        cfg.bulk_flush_interval_ms = 50;
        let h = harness(cfg, InMemorySink::default());
        feed(&h, &[1]).await;

        let report = tokio::time::timeout(Duration::from_secs(5), h.reports.recv())
            .await
            .expect("💀 the timer should have flushed the batch")
            .expect("reports open");
        assert_eq!(report, DeliveryReport::Acked { id: EventId(1) });
        assert_eq!(h.sink.payloads().await.len(), 1);
        finish(h).await;
    }

    #[tokio::test]
    async fn the_one_where_the_byte_threshold_beats_the_count() {
        let mut cfg = config(100);
        cfg.bulk_size = 1;
        cfg.bulk_workers = 1;
        let h = harness(cfg, InMemorySink::default());
        feed(&h, &[1, 2]).await;
        let (_, payloads) = finish(h).await;
        assert_eq!(payloads.len(), 2, "every document overflows a one-byte budget on its own");
    }

    #[tokio::test]
    async fn the_one_where_half_the_batch_is_turned_away() {
        let sink = InMemorySink::scripted([ScriptedReply::Respond(json!({
            "took": 2,
            "errors": true,
            "items": [
                {"index": {"_index": "logs", "_id": "r1", "status": 201}},
                {"index": {"_index": "logs", "_id": "r2", "status": 400,
                    "error": {"type": "mapper_parsing_exception", "reason": "failed to parse"}}}
            ]
        }))]);
        let h = harness(config(2), sink);
        feed(&h, &[1, 2]).await;
        let (reports, _) = finish(h).await;

        assert_eq!(reports[0], DeliveryReport::Acked { id: EventId(1) });
        assert_eq!(
            reports[1],
            DeliveryReport::Rejected {
                id: EventId(2),
                index: "logs".into(),
                doc_id: Some("r2".into()),
                status: 400,
                reason: "mapper_parsing_exception: failed to parse".into(),
            }
        );
    }

    #[tokio::test]
    async fn the_one_where_the_whole_batch_goes_down_together() {
        let failure = FlushError::Status {
            status: 503,
            body: "cluster is having a day".into(),
        };
        let sink = InMemorySink::scripted([ScriptedReply::Fail(failure.clone())]);
        let h = harness(config(3), sink);
        feed(&h, &[1, 2, 3]).await;
        let (reports, _) = finish(h).await;

        assert_eq!(reports.len(), 3, "no silent drops");
        for (n, report) in reports.iter().enumerate() {
            assert_eq!(
                *report,
                DeliveryReport::Failed {
                    id: EventId(n as u64 + 1),
                    error: failure.clone()
                }
            );
        }
    }

    #[tokio::test]
    async fn the_one_where_cancellation_aborts_the_flush_and_fails_the_leftovers() {
        let mut cfg = config(0);
        cfg.bulk_workers = 1;
        let h = harness(cfg, InMemorySink::scripted([ScriptedReply::Stall]));
        feed(&h, &[1]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.shutdown.send_replace(true);
        let (reports, payloads) = finish(h).await;

        assert_eq!(payloads.len(), 1, "the stalled flush did go out");
        assert_eq!(
            reports,
            vec![DeliveryReport::Failed {
                id: EventId(1),
                error: FlushError::Cancelled
            }]
        );
    }

    #[tokio::test]
    async fn the_one_where_two_stuck_flushes_stop_the_intake() {
        let mut cfg = config(0);
        cfg.bulk_workers = 2;
        let h = harness(cfg, InMemorySink::scripted([ScriptedReply::Stall, ScriptedReply::Stall]));
        feed(&h, &[0, 1, 2, 3, 4]).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.sink.payloads().await.len(), 2, "only bulk_workers flushes in flight");
        assert_eq!(h.stats.snapshot().received, 3, "two in flight, one waiting in the batch");
        assert_eq!(h.events.len(), 2, "the rest stay upstream");

        h.shutdown.send_replace(true);
        let (reports, payloads) = finish(h).await;
        assert_eq!(payloads.len(), 2);
        assert_eq!(
            reports,
            (0..3)
                .map(|id| DeliveryReport::Failed {
                    id: EventId(id),
                    error: FlushError::Cancelled
                })
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn the_one_where_the_second_batch_lands_first_and_nobody_gets_confused() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let mut cfg = config(0);
        cfg.bulk_workers = 2;
        let h = harness(cfg, InMemorySink::scripted([ScriptedReply::Gated(Arc::clone(&gate))]));

        feed(&h, &[1]).await;
        // 🚧 let the first flush pick up the gated reply before the second one exists
        tokio::time::sleep(Duration::from_millis(50)).await;
        feed(&h, &[2]).await;

        let first = tokio::time::timeout(Duration::from_secs(5), h.reports.recv())
            .await
            .expect("💀 the ungated batch should report")
            .expect("reports open");
        assert_eq!(first, DeliveryReport::Acked { id: EventId(2) });
        assert!(h.reports.is_empty(), "batch one is still behind the gate");

        gate.notify_one();
        let second = tokio::time::timeout(Duration::from_secs(5), h.reports.recv())
            .await
            .expect("💀 the gated batch should report once released")
            .expect("reports open");
        assert_eq!(second, DeliveryReport::Acked { id: EventId(1) });

        let (rest, payloads) = finish(h).await;
        assert!(rest.is_empty());
        assert_eq!(payloads.len(), 2);
        assert!(payloads[0].contains("\"_id\":\"r1\""), "batch one went out first: {}", payloads[0]);
    }

    #[tokio::test]
    async fn the_one_where_an_unaddressable_event_is_rejected_without_a_round_trip() {
        let mut cfg = config(0);
        cfg.index = "%{tenant}".into();
        let h = harness(cfg, InMemorySink::default());
        feed(&h, &[1]).await;
        let (reports, payloads) = finish(h).await;

        assert!(payloads.is_empty());
        assert!(matches!(
            &reports[0],
            DeliveryReport::Rejected { id: EventId(1), status: 0, reason, .. } if reason.contains("empty index")
        ));
    }

    #[test]
    fn the_one_where_a_short_response_cannot_be_trusted() {
        let response: BulkResponse = serde_json::from_value(json!({
            "errors": true,
            "items": [{"index": {"_index": "logs", "status": 201}}]
        }))
        .expect("deserializes");
        let outcome = classify(&entries(2), Ok(response));
        assert!(matches!(outcome, BatchOutcome::Failed(FlushError::MalformedResponse(_))));
        assert_eq!(outcome.into_reports(&entries(2)).len(), 2);
    }

    #[test]
    fn the_one_where_a_clean_response_is_acknowledged() {
        let response: BulkResponse = serde_json::from_value(json!({
            "errors": false,
            "items": [
                {"index": {"_index": "logs", "_id": "r0", "status": 201}},
                {"index": {"_index": "logs", "_id": "r1", "status": 200}}
            ]
        }))
        .expect("deserializes");
        assert_eq!(
            classify(&entries(2), Ok(response)),
            BatchOutcome::Acknowledged(vec![
                DeliveryReport::Acked { id: EventId(0) },
                DeliveryReport::Acked { id: EventId(1) },
            ])
        );
    }
}
