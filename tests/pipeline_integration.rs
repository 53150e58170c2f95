//! End-to-end check of aggregation, merge and rotated JSONL output without
//! any network sources.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use btc_feature_collector::features::{BookFeatureAggregator, TapeFeatureAggregator};
use btc_feature_collector::merge::{MergeCoordinator, MergeRecord};
use btc_feature_collector::pipeline::{Pipeline, PipelineSettings, SourceSinks};
use btc_feature_collector::sink::{rotated_path, JsonlSink, RecordSink};
use btc_feature_collector::types::{
    BookSnapshot, ExternalQuote, Fields, PriceLevel, Side, TradeTick,
};

const NAME: &str = "combined_data.jsonl";

fn book(ts: i64) -> BookSnapshot {
    BookSnapshot {
        ts,
        bids: vec![PriceLevel::new(100.0, 2.0 + ts as f64 % 3.0), PriceLevel::new(99.5, 1.0)],
        asks: vec![PriceLevel::new(100.5, 1.5), PriceLevel::new(101.0, 1.0)],
    }
}

fn trade(ts: i64) -> TradeTick {
    TradeTick {
        ts,
        price: 100.25,
        size: 0.5,
        side: if ts % 2 == 0 { Side::Buy } else { Side::Sell },
    }
}

fn quote(ts: i64) -> ExternalQuote {
    let mut fields = Fields::new();
    fields.insert("up_best_bid".to_string(), 0.53);
    fields.insert("up_best_ask".to_string(), 0.54);
    ExternalQuote { ts, fields }
}

fn read_lines(path: &Path) -> Vec<serde_json::Value> {
    fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn test_merged_seconds_across_rotation_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let (sink, task) = JsonlSink::<MergeRecord>::spawn(dir.path(), NAME, 15, 1000).unwrap();

    let mut book_agg = BookFeatureAggregator::new(10);
    let mut tape_agg = TapeFeatureAggregator::new();
    let mut coordinator = MergeCoordinator::new();

    for ts in 895..=905 {
        if let Some(m) = book_agg.ingest_snapshot(&book(ts)) {
            if let Some(rec) = coordinator.accept_metrics(&m) {
                sink.submit(rec);
            }
        }
        if let Some(m) = tape_agg.ingest_tick(&trade(ts)) {
            if let Some(rec) = coordinator.accept_metrics(&m) {
                sink.submit(rec);
            }
        }
        let q = quote(ts);
        coordinator.accept_external(q.ts, q.fields);
    }

    if let Some(m) = book_agg.force_finalize() {
        if let Some(rec) = coordinator.accept_metrics(&m) {
            sink.submit(rec);
        }
    }
    if let Some(m) = tape_agg.force_finalize() {
        if let Some(rec) = coordinator.accept_metrics(&m) {
            sink.submit(rec);
        }
    }
    for rec in coordinator.drain() {
        sink.submit(rec);
    }

    let stats = coordinator.stats();
    assert_eq!(stats.flushed, 11);
    assert_eq!(stats.late_primary + stats.late_external + stats.orphaned, 0);

    drop(sink);
    let report = task.join().unwrap();
    assert_eq!(report.lines_written, 11);
    assert_eq!(report.files_opened, 2);

    let before = read_lines(&rotated_path(dir.path(), NAME, 895, 15));
    let after = read_lines(&rotated_path(dir.path(), NAME, 900, 15));
    assert_eq!(before.len(), 5, "895..=899 land in the first candle");
    assert_eq!(after.len(), 6, "900..=905 land in the second candle");

    let timestamps: Vec<i64> = before
        .iter()
        .chain(after.iter())
        .map(|v| v["timestamp"].as_i64().unwrap())
        .collect();
    assert_eq!(timestamps, (895..=905).collect::<Vec<_>>());

    for row in before.iter().chain(after.iter()) {
        for field in ["obi", "weighted_obi", "afi", "cvd", "up_best_bid", "up_best_ask"] {
            assert!(row.get(field).is_some(), "missing {field} in {row}");
        }
        assert!(row.get("ts").is_none());
    }
}

#[tokio::test]
async fn test_async_pipeline_writes_every_book_second() {
    let dir = tempfile::tempdir().unwrap();
    let (sink, task) = JsonlSink::<MergeRecord>::spawn(dir.path(), NAME, 15, 1000).unwrap();

    let (pipeline, inputs) = Pipeline::spawn(
        PipelineSettings {
            levels_used: 10,
            event_channel_capacity: 16,
            coordinator_channel_capacity: 16,
        },
        Arc::new(sink.clone()),
        SourceSinks::default(),
    );

    for ts in 0..30 {
        inputs.book.send(book(ts)).await.unwrap();
    }
    drop(inputs);

    let report = pipeline.join().await.unwrap();
    assert_eq!(report.book.finalized, 30);
    assert_eq!(report.coordinator.flushed, 30);
    assert_eq!(report.coordinator.late_primary, 0);

    drop(sink);
    let written = tokio::task::spawn_blocking(move || task.join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(written.lines_written, 30);

    let rows = read_lines(&rotated_path(dir.path(), NAME, 0, 15));
    assert_eq!(rows.len(), 30);
    assert!(rows[0].get("z_bid_liq").is_none(), "z-scores are absent during warm-up");
    assert!(rows[29].get("z_bid_liq").is_some());
}
