//! 🚀 elastout-cli -- the front door, the bouncer, the maitre d' of elastout.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 Loads config, sets up logging, reads newline-delimited JSON events from stdin (or a
//! file), pushes them through the output, and prints what became of them. It plays the part
//! of the upstream pipeline so the adapter can be driven end to end. 🦆

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use clap::Parser;
use comfy_table::{Cell, Table, presets::UTF8_FULL};
use elastout::app_config::load_config;
use elastout::{
    CancelHandle, DeliveryReport, DispatchSnapshot, ElasticOutput, EnvLookup, Event, EventId, Incoming, InitError,
    SinkBackend,
};
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 🔌 EX_TEMPFAIL: "try again later", for supervisors that restart with backoff.
const EXIT_RETRYABLE: i32 = 75;

#[derive(Debug, Parser)]
#[command(name = "elastout", about = "Ship newline-delimited JSON log events into Elasticsearch via _bulk")]
struct Args {
    /// Path to the TOML config. Missing file means env vars (ELASTOUT_*) only.
    #[arg(default_value = "elastout.toml")]
    config: PathBuf,

    /// Read events from this file instead of stdin.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Resolve and map everything, but keep the bulk bodies in memory and print them.
    #[arg(long)]
    dry_run: bool,
}

/// 📊 What the report consumer saw, for the summary table.
#[derive(Debug, Default)]
struct Tally {
    acked: u64,
    rejected: u64,
    failed: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(err) = run(args).await {
        error!("💀 error: {}", err);
        let mut the_vibes_are_giving_connection_issues = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("error sending request")
                || cause_str.contains("onnection refused")
                || cause_str.contains("tcp connect error")
                || cause_str.contains("dns error")
                || cause_str.contains("certificate")
            {
                the_vibes_are_giving_connection_issues = true;
            }
        }

        if the_vibes_are_giving_connection_issues {
            error!(
                "🔧 hint: looks like the cluster isn't reachable. Check that it is running, that the \
                 URL resolved to what you think it did, and, for HTTPS, that its certificate is trusted \
                 (or set ssl_certificate_validation = false if you really mean it). ☕"
            );
        }

        let retryable = err
            .downcast_ref::<InitError>()
            .is_some_and(InitError::is_retryable_by_restart);
        std::process::exit(if retryable { EXIT_RETRYABLE } else { 1 });
    }

    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config_file = args.config.as_path();
    let config_file = match config_file.try_exists().context(format!(
        "💀 Couldn't check whether the configuration file exists. Was checking here: '{}'",
        config_file.display()
    ))? {
        true => Some(config_file),
        false => {
            warn!("⚠️ No config file at '{}', using ELASTOUT_* env vars only", config_file.display());
            None
        }
    };
    let app_config = load_config(config_file)
        .context("💀 Couldn't load the config. Take a look at the file and the ELASTOUT_* env vars.")?;

    let output = if args.dry_run {
        ElasticOutput::in_memory(&app_config.output, &EnvLookup)?
    } else {
        ElasticOutput::connect(&app_config.output, &EnvLookup).await?
    };
    let dry_run_sink = match output.sink() {
        SinkBackend::InMemory(sink) => Some(sink.clone()),
        SinkBackend::Elasticsearch(_) => None,
    };

    let (events_tx, events_rx) = async_channel::bounded(app_config.runtime.queue_capacity.max(1));
    let (reports_tx, reports_rx) = async_channel::bounded(app_config.runtime.report_capacity.max(1));
    let running = output.start(events_rx, reports_tx);

    let canceller = running.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Ctrl-C: cancelling. Anything not yet acknowledged will be reported failed.");
            canceller.cancel();
        }
    });

    let consumer = tokio::spawn(consume_reports(reports_rx));

    let fed = match args.input {
        Some(ref path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("💀 Couldn't open input file '{}'", path.display()))?;
            feed_events(BufReader::new(file), events_tx, running.cancel_handle()).await
        }
        None => feed_events(BufReader::new(tokio::io::stdin()), events_tx, running.cancel_handle()).await,
    };

    let snapshot = running.join().await?;
    let tally = consumer.await.context("💀 Report consumer panicked")?;
    let fed = fed?;

    if let Some(sink) = dry_run_sink {
        for payload in sink.payloads().await {
            print!("{payload}");
        }
    }
    eprintln!("{}", summary_table(fed, &tally, &snapshot));

    if tally.failed > 0 {
        anyhow::bail!("💀 {} event(s) were not delivered", tally.failed);
    }
    Ok(())
}

/// 📥 One JSON object per line. Blank lines are skipped, unparseable ones are logged and skipped.
/// Stops at end of input or on cancellation, whichever comes first.
async fn feed_events<R>(reader: R, events: Sender<Incoming>, stop: CancelHandle) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut next_id = 0u64;
    let mut line_no = 0u64;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("💀 Failed to read input")?,
            _ = stop.cancelled() => {
                info!("🛑 Cancelled, no longer reading input");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("⚠️ Skipping line {}: not a JSON event ({})", line_no, e);
                continue;
            }
        };
        if events
            .send(Incoming {
                id: EventId(next_id),
                event,
            })
            .await
            .is_err()
        {
            // 🛑 the dispatcher stopped listening, most likely cancelled
            break;
        }
        next_id += 1;
    }
    info!("📥 Input exhausted after {} line(s), {} event(s) handed over", line_no, next_id);
    Ok(next_id)
}

async fn consume_reports(reports: Receiver<DeliveryReport>) -> Tally {
    let mut tally = Tally::default();
    while let Ok(report) = reports.recv().await {
        match report {
            DeliveryReport::Acked { .. } => tally.acked += 1,
            DeliveryReport::Rejected {
                id,
                index,
                doc_id,
                status,
                reason,
            } => {
                tally.rejected += 1;
                warn!(
                    "🚫 Event {} rejected by '{}' (id {:?}, status {}): {}",
                    id, index, doc_id, status, reason
                );
            }
            DeliveryReport::Failed { id, error } => {
                tally.failed += 1;
                warn!("💀 Event {} not delivered: {}", id, error);
            }
        }
    }
    tally
}

fn summary_table(fed: u64, tally: &Tally, snapshot: &DispatchSnapshot) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Outcome", "Events"]);
    table.add_row(vec![Cell::new("📥 read"), Cell::new(fed)]);
    table.add_row(vec![Cell::new("✅ acked"), Cell::new(tally.acked)]);
    table.add_row(vec![Cell::new("🚫 rejected"), Cell::new(tally.rejected)]);
    table.add_row(vec![Cell::new("💀 failed"), Cell::new(tally.failed)]);
    table.add_row(vec![Cell::new("📦 bulk requests"), Cell::new(snapshot.batches)]);
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a_dry_run() -> (elastout::RunningOutput, Sender<Incoming>) {
        let config = elastout::OutputConfig {
            index: "logs".into(),
            ..elastout::OutputConfig::default()
        };
        let output = ElasticOutput::in_memory(&config, &EnvLookup).expect("💀 default config resolves");
        let (events_tx, events_rx) = async_channel::bounded(8);
        let (reports_tx, _reports_rx) = async_channel::bounded(8);
        (output.start(events_rx, reports_tx), events_tx)
    }

    #[tokio::test]
    async fn the_one_where_garbage_lines_are_stepped_over() {
        let input = b"{\"message\":\"one\"}\n\nnot json\n{\"@timestamp\":\"2017-04-18T19:53:01Z\",\"message\":\"two\",\"n\":1}\n";
        let (running, _unused) = a_dry_run();
        let (tx, rx) = async_channel::bounded(8);
        let fed = feed_events(BufReader::new(&input[..]), tx, running.cancel_handle())
            .await
            .expect("reads");

        assert_eq!(fed, 2);
        let first = rx.recv().await.expect("first");
        let second = rx.recv().await.expect("second");
        assert_eq!(first.id, EventId(0));
        assert_eq!(second.id, EventId(1));
        assert_eq!(second.event.message, "two");
        assert!(rx.recv().await.is_err(), "sender dropped after input ends");
    }

    #[tokio::test]
    async fn the_one_where_ctrl_c_does_not_wait_for_a_quiet_stdin() {
        let (running, events_tx) = a_dry_run();
        // 🤫 the writer half stays open and never says a word, like a terminal nobody types into
        let (_keyboard, terminal) = tokio::io::duplex(64);
        let feeder = tokio::spawn(feed_events(BufReader::new(terminal), events_tx, running.cancel_handle()));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!feeder.is_finished());
        running.cancel_handle().cancel();

        let fed = tokio::time::timeout(std::time::Duration::from_secs(5), feeder)
            .await
            .expect("💀 feeding should stop on cancel")
            .expect("no panic")
            .expect("reads");
        assert_eq!(fed, 0);
        running.join().await.expect("clean exit");
    }

    #[tokio::test]
    async fn the_one_where_the_tally_adds_up() {
        let (tx, rx) = async_channel::unbounded();
        tx.send(DeliveryReport::Acked { id: EventId(0) }).await.expect("open");
        tx.send(DeliveryReport::Failed {
            id: EventId(1),
            error: elastout::FlushError::NoHealthyNode,
        })
        .await
        .expect("open");
        drop(tx);

        let tally = consume_reports(rx).await;
        assert_eq!((tally.acked, tally.rejected, tally.failed), (1, 0, 1));
        let rendered = summary_table(2, &tally, &DispatchSnapshot::default()).to_string();
        assert!(rendered.contains("acked"));
    }
}
