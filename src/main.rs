//! BTC feature collector
//!
//! Streams Binance depth and trades plus Polymarket best bid/ask, and writes
//! one merged JSON line per second until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::{path::Path, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{error, info, warn};

use btc_feature_collector::{
    config::CollectorConfig,
    listeners::{self, DepthDecoder, ListenerStats, PolymarketSettings, TradeDecoder},
    logging::init_tracing,
    merge::MergeRecord,
    pipeline::{run_stats_reporter, Pipeline, PipelineSettings, SourceSinks, StatsSources},
    sink::{JsonlSink, RecordSink, SinkTask},
};

#[derive(Parser, Debug)]
#[command(name = "collector")]
#[command(about = "Collect per-second BTC order book, tape and Polymarket features")]
struct Args {
    /// TOML config file
    #[arg(short, long, env = "COLLECTOR_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Output root directory
    #[arg(short, long, env = "COLLECTOR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Binance symbol (e.g. btcusdt)
    #[arg(short, long, env = "COLLECTOR_SYMBOL")]
    symbol: Option<String>,

    /// Skip the Polymarket listener
    #[arg(long)]
    no_polymarket: bool,
}

fn load_env() {
    let _ = dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

fn load_config(args: &Args) -> Result<CollectorConfig> {
    let mut config = match &args.config {
        Some(path) => CollectorConfig::load(path)?,
        None => CollectorConfig::from_env(),
    };
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(symbol) = &args.symbol {
        config.symbol = symbol.to_lowercase();
    }
    if args.no_polymarket {
        config.polymarket_enabled = false;
    }
    config.validate().context("invalid collector config")?;
    Ok(config)
}

fn join_sink(task: SinkTask) {
    match task.join() {
        Ok(report) => info!(?report, "sink closed"),
        Err(e) => error!(error = %format!("{e:#}"), "sink join failed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let args = Args::parse();
    let config = load_config(&args)?;

    if let Some(path) = init_tracing(config.log_dir.as_deref())? {
        info!(path = %path.display(), "session log");
    }
    info!(
        symbol = %config.symbol,
        levels_used = config.levels_used,
        data_dir = %config.data_dir.display(),
        polymarket = config.polymarket_enabled,
        "🚀 starting collector"
    );

    let (combined, combined_task) = JsonlSink::<MergeRecord>::spawn(
        &config.data_dir,
        &config.combined_file,
        config.rotation_minutes,
        config.sink_high_water,
    )?;

    let mut source_tasks = Vec::new();
    let mut sources = SourceSinks::default();
    if config.write_source_streams {
        let (book, t) = JsonlSink::spawn(
            &config.data_dir,
            "l2.jsonl",
            config.rotation_minutes,
            config.sink_high_water,
        )?;
        sources.book = Some(book);
        source_tasks.push(t);
        let (tape, t) = JsonlSink::spawn(
            &config.data_dir,
            "tape.jsonl",
            config.rotation_minutes,
            config.sink_high_water,
        )?;
        sources.tape = Some(tape);
        source_tasks.push(t);
        if config.polymarket_enabled {
            let (quotes, t) = JsonlSink::spawn(
                &config.data_dir,
                "polymarket.jsonl",
                config.rotation_minutes,
                config.sink_high_water,
            )?;
            sources.quotes = Some(quotes);
            source_tasks.push(t);
        }
    }

    let sink: Arc<dyn RecordSink> = Arc::new(combined.clone());
    let (pipeline, inputs) = Pipeline::spawn(
        PipelineSettings {
            levels_used: config.levels_used,
            event_channel_capacity: config.event_channel_capacity,
            coordinator_channel_capacity: config.coordinator_channel_capacity,
        },
        sink,
        sources,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let depth_stats = ListenerStats::new();
    let trade_stats = ListenerStats::new();
    let quote_stats = ListenerStats::new();

    let mut listener_handles = Vec::new();
    listener_handles.push(tokio::spawn(listeners::run_stream(
        "depth",
        config.depth_stream_url(),
        DepthDecoder::new(config.levels_used),
        inputs.book,
        depth_stats.clone(),
        shutdown_rx.clone(),
    )));
    listener_handles.push(tokio::spawn(listeners::run_stream(
        "trades",
        config.trade_stream_url(),
        TradeDecoder,
        inputs.trades,
        trade_stats.clone(),
        shutdown_rx.clone(),
    )));
    if config.polymarket_enabled {
        listener_handles.push(tokio::spawn(listeners::run_polymarket(
            PolymarketSettings {
                ws_url: config.polymarket_ws_url.clone(),
                gamma_markets_url: config.gamma_markets_url.clone(),
                slug_prefix: config.market_slug_prefix.clone(),
                rotation_minutes: config.rotation_minutes,
            },
            inputs.quotes,
            quote_stats.clone(),
            shutdown_rx.clone(),
        )));
    } else {
        drop(inputs.quotes);
    }

    let reporter = tokio::spawn(run_stats_reporter(
        StatsSources {
            pipeline: pipeline.stats(),
            depth: depth_stats,
            trades: trade_stats,
            quotes: quote_stats,
            combined: combined.clone(),
        },
        Duration::from_secs(config.stats_interval_secs),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    info!("🛑 shutdown requested; draining");
    let _ = shutdown_tx.send(true);

    for handle in listener_handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %format!("{e:#}"), "listener failed"),
            Err(e) => warn!(error = %e, "listener task panicked"),
        }
    }
    let _ = reporter.await;

    let report = pipeline.join().await?;
    info!(
        flushed = report.coordinator.flushed,
        late_primary = report.coordinator.late_primary,
        late_external = report.coordinator.late_external,
        orphaned = report.coordinator.orphaned,
        book_malformed = report.book.malformed,
        tape_malformed = report.tape.malformed,
        "pipeline stopped"
    );

    // Writer threads exit once every producer handle is gone.
    drop(combined);
    tokio::task::spawn_blocking(move || {
        join_sink(combined_task);
        for task in source_tasks {
            join_sink(task);
        }
    })
    .await
    .context("join sinks")?;

    info!("👋 collector stopped");
    Ok(())
}
