//! Runtime wiring between listeners, aggregators, the merge coordinator and
//! the output sink.
//!
//! ```text
//! depth  ─► book task ─┐
//! trades ─► tape task ─┼─► coordinator task ─► RecordSink
//! quotes ─► quote task ┘
//! ```
//!
//! Shutdown cascades by channel closure: once a task's inputs are all
//! dropped it forwards whatever it still holds before exiting. The
//! coordinator drains every pending record before it returns.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::features::{
    BookFeatureAggregator, BookMetrics, IngestCounters, TapeFeatureAggregator, TapeMetrics,
};
use crate::listeners::ListenerStats;
use crate::merge::{CoordinatorStats, MergeCoordinator};
use crate::sink::{JsonlSink, RecordSink};
use crate::types::{BookSnapshot, ExternalQuote, TradeTick};

#[derive(Debug, Clone)]
pub enum CoordinatorCommand {
    Book(BookMetrics),
    Tape(TapeMetrics),
    Quote(ExternalQuote),
}

/// Counters shared with the stats reporter. Each field has a single writer.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub book: Mutex<IngestCounters>,
    pub tape: Mutex<IngestCounters>,
    pub quotes: Mutex<u64>,
    pub coordinator: Mutex<CoordinatorStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub book: IngestCounters,
    pub tape: IngestCounters,
    pub quotes: u64,
    pub coordinator: CoordinatorStats,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineReport {
        PipelineReport {
            book: *self.book.lock(),
            tape: *self.tape.lock(),
            quotes: *self.quotes.lock(),
            coordinator: *self.coordinator.lock(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub levels_used: usize,
    pub event_channel_capacity: usize,
    pub coordinator_channel_capacity: usize,
}

/// Optional per-source output streams.
#[derive(Default, Clone)]
pub struct SourceSinks {
    pub book: Option<JsonlSink<BookMetrics>>,
    pub tape: Option<JsonlSink<TapeMetrics>>,
    pub quotes: Option<JsonlSink<ExternalQuote>>,
}

/// Producer ends handed to the listeners. Dropping all of them shuts the
/// pipeline down.
pub struct PipelineInputs {
    pub book: mpsc::Sender<BookSnapshot>,
    pub trades: mpsc::Sender<TradeTick>,
    pub quotes: mpsc::Sender<ExternalQuote>,
}

pub struct Pipeline {
    book: JoinHandle<IngestCounters>,
    tape: JoinHandle<IngestCounters>,
    quotes: JoinHandle<u64>,
    coordinator: JoinHandle<CoordinatorStats>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn spawn(
        settings: PipelineSettings,
        sink: Arc<dyn RecordSink>,
        sources: SourceSinks,
    ) -> (Self, PipelineInputs) {
        let capacity = settings.event_channel_capacity.max(1);
        let (book_tx, book_rx) = mpsc::channel(capacity);
        let (trade_tx, trade_rx) = mpsc::channel(capacity);
        let (quote_tx, quote_rx) = mpsc::channel(capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(settings.coordinator_channel_capacity.max(1));

        let stats = Arc::new(PipelineStats::default());

        let book = tokio::spawn(run_book_task(
            book_rx,
            BookFeatureAggregator::new(settings.levels_used),
            cmd_tx.clone(),
            sources.book,
            stats.clone(),
        ));
        let tape = tokio::spawn(run_tape_task(
            trade_rx,
            TapeFeatureAggregator::new(),
            cmd_tx.clone(),
            sources.tape,
            stats.clone(),
        ));
        let quotes = tokio::spawn(run_quote_task(quote_rx, cmd_tx, sources.quotes, stats.clone()));
        let coordinator = tokio::spawn(run_coordinator(cmd_rx, sink, stats.clone()));

        (
            Self {
                book,
                tape,
                quotes,
                coordinator,
                stats,
            },
            PipelineInputs {
                book: book_tx,
                trades: trade_tx,
                quotes: quote_tx,
            },
        )
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Wait for every task to finish. Only returns once all
    /// [`PipelineInputs`] senders are dropped.
    pub async fn join(self) -> Result<PipelineReport> {
        let book = self.book.await.context("book task panicked")?;
        let tape = self.tape.await.context("tape task panicked")?;
        let quotes = self.quotes.await.context("quote task panicked")?;
        let coordinator = self.coordinator.await.context("coordinator task panicked")?;
        Ok(PipelineReport {
            book,
            tape,
            quotes,
            coordinator,
        })
    }
}

async fn forward(out: &mpsc::Sender<CoordinatorCommand>, cmd: CoordinatorCommand) {
    if out.send(cmd).await.is_err() {
        warn!("coordinator gone; dropping finalized metrics");
    }
}

pub async fn run_book_task(
    mut rx: mpsc::Receiver<BookSnapshot>,
    mut agg: BookFeatureAggregator,
    out: mpsc::Sender<CoordinatorCommand>,
    source: Option<JsonlSink<BookMetrics>>,
    stats: Arc<PipelineStats>,
) -> IngestCounters {
    let emit = |metrics: BookMetrics| {
        if let Some(sink) = &source {
            sink.write(metrics.clone());
        }
        CoordinatorCommand::Book(metrics)
    };

    while let Some(snapshot) = rx.recv().await {
        let finalized = agg.ingest_snapshot(&snapshot);
        *stats.book.lock() = agg.counters();
        if let Some(metrics) = finalized {
            forward(&out, emit(metrics)).await;
        }
    }

    if let Some(metrics) = agg.force_finalize() {
        forward(&out, emit(metrics)).await;
    }
    let counters = agg.counters();
    *stats.book.lock() = counters;
    debug!(?counters, "book task stopped");
    counters
}

pub async fn run_tape_task(
    mut rx: mpsc::Receiver<TradeTick>,
    mut agg: TapeFeatureAggregator,
    out: mpsc::Sender<CoordinatorCommand>,
    source: Option<JsonlSink<TapeMetrics>>,
    stats: Arc<PipelineStats>,
) -> IngestCounters {
    let emit = |metrics: TapeMetrics| {
        if let Some(sink) = &source {
            sink.write(metrics.clone());
        }
        CoordinatorCommand::Tape(metrics)
    };

    while let Some(tick) = rx.recv().await {
        let finalized = agg.ingest_tick(&tick);
        *stats.tape.lock() = agg.counters();
        if let Some(metrics) = finalized {
            forward(&out, emit(metrics)).await;
        }
    }

    if let Some(metrics) = agg.force_finalize() {
        forward(&out, emit(metrics)).await;
    }
    let counters = agg.counters();
    *stats.tape.lock() = counters;
    debug!(?counters, "tape task stopped");
    counters
}

pub async fn run_quote_task(
    mut rx: mpsc::Receiver<ExternalQuote>,
    out: mpsc::Sender<CoordinatorCommand>,
    source: Option<JsonlSink<ExternalQuote>>,
    stats: Arc<PipelineStats>,
) -> u64 {
    let mut relayed = 0u64;
    while let Some(quote) = rx.recv().await {
        if let Some(sink) = &source {
            sink.write(quote.clone());
        }
        forward(&out, CoordinatorCommand::Quote(quote)).await;
        relayed += 1;
        *stats.quotes.lock() = relayed;
    }
    relayed
}

/// Owns the merge state. Exits after every command sender is gone, draining
/// whatever is still pending into the sink.
pub async fn run_coordinator(
    mut rx: mpsc::Receiver<CoordinatorCommand>,
    sink: Arc<dyn RecordSink>,
    stats: Arc<PipelineStats>,
) -> CoordinatorStats {
    let mut coordinator = MergeCoordinator::new();

    while let Some(cmd) = rx.recv().await {
        let flushed = match cmd {
            CoordinatorCommand::Book(m) => coordinator.accept_metrics(&m),
            CoordinatorCommand::Tape(m) => coordinator.accept_metrics(&m),
            CoordinatorCommand::Quote(q) => {
                coordinator.accept_external(q.ts, q.fields);
                None
            }
        };
        if let Some(record) = flushed {
            sink.submit(record);
        }
        *stats.coordinator.lock() = coordinator.stats();
    }

    let remaining = coordinator.drain();
    info!(records = remaining.len(), "draining pending merge records");
    for record in remaining {
        sink.submit(record);
    }

    let final_stats = coordinator.stats();
    *stats.coordinator.lock() = final_stats;
    final_stats
}

/// Everything the stats reporter samples.
pub struct StatsSources {
    pub pipeline: Arc<PipelineStats>,
    pub depth: Arc<ListenerStats>,
    pub trades: Arc<ListenerStats>,
    pub quotes: Arc<ListenerStats>,
    pub combined: JsonlSink<crate::merge::MergeRecord>,
}

/// Periodic stats log until shutdown.
pub async fn run_stats_reporter(
    sources: StatsSources,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // first tick is immediate
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let report = sources.pipeline.snapshot();
        let depth = sources.depth.snapshot();
        let trades = sources.trades.snapshot();
        let quotes = sources.quotes.snapshot();
        info!(
            book_events = report.book.events,
            book_late = report.book.late_dropped,
            book_malformed = report.book.malformed,
            tape_events = report.tape.events,
            tape_late = report.tape.late_dropped,
            tape_malformed = report.tape.malformed,
            quotes = report.quotes,
            flushed = report.coordinator.flushed,
            pending = report.coordinator.pending,
            late_primary = report.coordinator.late_primary,
            late_external = report.coordinator.late_external,
            orphaned = report.coordinator.orphaned,
            queue_depth = sources.combined.queue_depth(),
            "📊 collector stats"
        );
        debug!(?depth, ?trades, ?quotes, "listener stats");
        if depth.gaps_total > 0 {
            debug!(gaps = depth.gaps_total, "depth stream has update id gaps");
        }
    }
}
