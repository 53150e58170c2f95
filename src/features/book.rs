//! Order book feature aggregation.
//!
//! Each second keeps only the latest depth snapshot observed in it. On
//! rollover the bucket is turned into imbalance, liquidity-change and
//! distance-weighted imbalance features, plus their rolling ratios and
//! z-scores.

use serde::Serialize;

use super::{
    guarded_ratio, route, BucketRoute, IngestCounters, RatioWindow, RollingNormalizer, Smoother,
};
use crate::types::{BookSnapshot, Fields, MetricSet, PriceLevel};

/// Levels per side used when the caller does not choose.
pub const DEFAULT_LEVELS_USED: usize = 10;

/// Smoothing factor for `ew_obi`.
const EW_OBI_ALPHA: f64 = 0.2;

/// Floor on the distance-to-mid used for weighting, as a fraction of mid.
/// Keeps the touch levels from dominating through a near-zero distance.
const MIN_MID_DISTANCE_FRAC: f64 = 1e-4;

const Z_WINDOWS: &[(&str, usize)] = &[
    ("bid_liq", 300),
    ("ask_liq", 300),
    ("weighted_obi", 300),
    ("bid_liq_delta", 180),
    ("ask_liq_delta", 180),
];

/// Mutable accumulator for one second of depth snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BookBucket {
    pub ts: i64,
    pub bid_liq: f64,
    pub ask_liq: f64,
    pub weighted_bid_liq: f64,
    pub weighted_ask_liq: f64,
}

impl BookBucket {
    fn open(ts: i64) -> Self {
        Self {
            ts,
            ..Default::default()
        }
    }

    /// Overwrite the bucket with the figures of one snapshot.
    fn apply(&mut self, bids: &[PriceLevel], asks: &[PriceLevel]) {
        let mid = (bids[0].price + asks[0].price) / 2.0;
        let floor = mid * MIN_MID_DISTANCE_FRAC;

        self.bid_liq = bids.iter().map(|l| l.size).sum();
        self.ask_liq = asks.iter().map(|l| l.size).sum();
        self.weighted_bid_liq = bids
            .iter()
            .map(|l| l.size / (mid - l.price).abs().max(floor))
            .sum();
        self.weighted_ask_liq = asks
            .iter()
            .map(|l| l.size / (l.price - mid).abs().max(floor))
            .sum();
    }
}

/// Finalized order book features for one second.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookMetrics {
    pub ts: i64,
    pub bid_liq: f64,
    pub ask_liq: f64,
    pub obi: f64,
    pub ew_obi: f64,
    pub bid_liq_delta: f64,
    pub ask_liq_delta: f64,
    pub weighted_obi: f64,
    pub obi_pos_ratio: f64,
    pub bid_liq_increasing_ratio: f64,
    pub ask_liq_decreasing_ratio: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_bid_liq: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_ask_liq: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_weighted_obi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_bid_liq_delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_ask_liq_delta: Option<f64>,
}

impl MetricSet for BookMetrics {
    fn second(&self) -> i64 {
        self.ts
    }

    fn fields(&self) -> Fields {
        let mut fields = Fields::new();
        for (name, value) in [
            ("bid_liq", self.bid_liq),
            ("ask_liq", self.ask_liq),
            ("obi", self.obi),
            ("ew_obi", self.ew_obi),
            ("bid_liq_delta", self.bid_liq_delta),
            ("ask_liq_delta", self.ask_liq_delta),
            ("weighted_obi", self.weighted_obi),
            ("obi_pos_ratio", self.obi_pos_ratio),
            ("bid_liq_increasing_ratio", self.bid_liq_increasing_ratio),
            ("ask_liq_decreasing_ratio", self.ask_liq_decreasing_ratio),
        ] {
            fields.insert(name.to_string(), value);
        }
        for (name, value) in [
            ("z_bid_liq", self.z_bid_liq),
            ("z_ask_liq", self.z_ask_liq),
            ("z_weighted_obi", self.z_weighted_obi),
            ("z_bid_liq_delta", self.z_bid_liq_delta),
            ("z_ask_liq_delta", self.z_ask_liq_delta),
        ] {
            if let Some(v) = value {
                fields.insert(name.to_string(), v);
            }
        }
        fields
    }
}

/// Turns a stream of depth snapshots into one [`BookMetrics`] per second.
#[derive(Debug, Clone)]
pub struct BookFeatureAggregator {
    levels_used: usize,
    current: Option<BookBucket>,
    last_finalized: Option<i64>,

    prev_bid_liq: Option<f64>,
    prev_ask_liq: Option<f64>,
    ew_obi: Smoother,

    obi_pos: RatioWindow,
    bid_liq_increasing: RatioWindow,
    ask_liq_decreasing: RatioWindow,
    normalizer: RollingNormalizer,

    counters: IngestCounters,
}

impl Default for BookFeatureAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_LEVELS_USED)
    }
}

impl BookFeatureAggregator {
    pub fn new(levels_used: usize) -> Self {
        Self {
            levels_used: levels_used.max(1),
            current: None,
            last_finalized: None,
            prev_bid_liq: None,
            prev_ask_liq: None,
            ew_obi: Smoother::with_alpha(EW_OBI_ALPHA),
            obi_pos: RatioWindow::default(),
            bid_liq_increasing: RatioWindow::default(),
            ask_liq_decreasing: RatioWindow::default(),
            normalizer: RollingNormalizer::new(Z_WINDOWS),
            counters: IngestCounters::default(),
        }
    }

    pub fn ingest_snapshot(&mut self, snapshot: &BookSnapshot) -> Option<BookMetrics> {
        self.ingest(&snapshot.bids, &snapshot.asks, snapshot.ts)
    }

    /// Feed one snapshot. Returns the previous second's metrics when `ts`
    /// rolls the bucket over.
    ///
    /// `bids` must be sorted descending and `asks` ascending. An empty or
    /// malformed side still rolls the bucket but leaves its figures alone.
    pub fn ingest(
        &mut self,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        ts: i64,
    ) -> Option<BookMetrics> {
        self.counters.events += 1;

        let finalized = match route(ts, self.current.map(|b| b.ts), self.last_finalized) {
            BucketRoute::Late => {
                self.counters.late_dropped += 1;
                return None;
            }
            BucketRoute::Current => None,
            BucketRoute::Rollover => {
                let finalized = self.current.take().map(|b| self.finalize(b));
                self.current = Some(BookBucket::open(ts));
                finalized
            }
        };

        let bids = &bids[..bids.len().min(self.levels_used)];
        let asks = &asks[..asks.len().min(self.levels_used)];

        if bids.is_empty()
            || asks.is_empty()
            || !bids.iter().chain(asks.iter()).all(PriceLevel::is_valid)
        {
            self.counters.malformed += 1;
            return finalized;
        }

        if let Some(bucket) = self.current.as_mut() {
            bucket.apply(bids, asks);
        }

        finalized
    }

    /// Close the open bucket without waiting for a later second.
    pub fn force_finalize(&mut self) -> Option<BookMetrics> {
        let bucket = self.current.take()?;
        Some(self.finalize(bucket))
    }

    pub fn current_bucket(&self) -> Option<&BookBucket> {
        self.current.as_ref()
    }

    pub fn counters(&self) -> IngestCounters {
        self.counters
    }

    fn finalize(&mut self, b: BookBucket) -> BookMetrics {
        let bid = b.bid_liq;
        let ask = b.ask_liq;

        let obi = guarded_ratio(bid - ask, bid + ask);
        let ew_obi = self.ew_obi.update(obi);

        let bid_liq_delta = self
            .prev_bid_liq
            .map_or(0.0, |prev| guarded_ratio(bid - prev, prev));
        let ask_liq_delta = self
            .prev_ask_liq
            .map_or(0.0, |prev| guarded_ratio(ask - prev, prev));
        self.prev_bid_liq = Some(bid);
        self.prev_ask_liq = Some(ask);

        let weighted_obi = guarded_ratio(
            b.weighted_bid_liq - b.weighted_ask_liq,
            b.weighted_bid_liq + b.weighted_ask_liq,
        );

        let obi_pos_ratio = self.obi_pos.push(obi > 0.0);
        let bid_liq_increasing_ratio = self.bid_liq_increasing.push(bid_liq_delta > 0.0);
        let ask_liq_decreasing_ratio = self.ask_liq_decreasing.push(ask_liq_delta < 0.0);

        let z_bid_liq = self.normalizer.observe("bid_liq", bid);
        let z_ask_liq = self.normalizer.observe("ask_liq", ask);
        let z_weighted_obi = self.normalizer.observe("weighted_obi", weighted_obi);
        let z_bid_liq_delta = self.normalizer.observe("bid_liq_delta", bid_liq_delta);
        let z_ask_liq_delta = self.normalizer.observe("ask_liq_delta", ask_liq_delta);

        self.last_finalized = Some(b.ts);
        self.counters.finalized += 1;

        BookMetrics {
            ts: b.ts,
            bid_liq: bid,
            ask_liq: ask,
            obi,
            ew_obi,
            bid_liq_delta,
            ask_liq_delta,
            weighted_obi,
            obi_pos_ratio,
            bid_liq_increasing_ratio,
            ask_liq_decreasing_ratio,
            z_bid_liq,
            z_ask_liq,
            z_weighted_obi,
            z_bid_liq_delta,
            z_ask_liq_delta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(raw: &[(f64, f64)]) -> Vec<PriceLevel> {
        raw.iter().copied().map(PriceLevel::from).collect()
    }

    #[test]
    fn test_book_scenario() {
        let mut agg = BookFeatureAggregator::default();
        let bids = levels(&[(100.0, 2.0), (99.0, 3.0)]);
        let asks = levels(&[(101.0, 1.0), (102.0, 4.0)]);

        assert!(agg.ingest(&bids, &asks, 10).is_none());
        let m = agg
            .ingest(&levels(&[(100.0, 1.0)]), &levels(&[(101.0, 1.0)]), 11)
            .expect("rollover should finalize second 10");

        assert_eq!(m.ts, 10);
        assert_eq!(m.bid_liq, 5.0);
        assert_eq!(m.ask_liq, 5.0);
        assert_eq!(m.obi, 0.0);
        assert_eq!(m.ew_obi, 0.0);
        assert_eq!(m.bid_liq_delta, 0.0);
        assert_eq!(m.ask_liq_delta, 0.0);
        assert_eq!(m.obi_pos_ratio, 0.0);
        assert!(m.z_bid_liq.is_none());
    }

    #[test]
    fn test_last_snapshot_in_second_wins() {
        let mut agg = BookFeatureAggregator::default();
        agg.ingest(&levels(&[(100.0, 50.0)]), &levels(&[(101.0, 50.0)]), 1);
        agg.ingest(&levels(&[(100.0, 3.0)]), &levels(&[(101.0, 1.0)]), 1);
        let m = agg.ingest(&[], &[], 2).unwrap();

        assert_eq!(m.bid_liq, 3.0, "liquidity must be overwritten, not accumulated");
        assert_eq!(m.ask_liq, 1.0);
        assert!((m.obi - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_liquidity_guards_touch() {
        let mut agg = BookFeatureAggregator::default();
        // mid = 100.5; touch distances 0.5, floor = 0.01005
        agg.ingest(&levels(&[(100.0, 1.0)]), &levels(&[(101.0, 1.0)]), 1);
        let b = *agg.current_bucket().unwrap();
        assert!((b.weighted_bid_liq - 2.0).abs() < 1e-12);
        assert!((b.weighted_ask_liq - 2.0).abs() < 1e-12);

        // crossed book: bid at mid distance 0 uses the floor
        agg.ingest(&levels(&[(100.0, 1.0)]), &levels(&[(100.0, 1.0)]), 1);
        let b = *agg.current_bucket().unwrap();
        assert!((b.weighted_bid_liq - 1.0 / (100.0 * 1e-4)).abs() < 1e-6);
    }

    #[test]
    fn test_empty_snapshot_still_rolls_over() {
        let mut agg = BookFeatureAggregator::default();
        agg.ingest(&levels(&[(100.0, 2.0)]), &levels(&[(101.0, 1.0)]), 1);

        let m = agg.ingest(&[], &levels(&[(101.0, 1.0)]), 2).expect("rollover");
        assert_eq!(m.ts, 1);
        assert_eq!(agg.counters().malformed, 1);

        // second 2 received nothing usable
        let m = agg.ingest(&levels(&[(100.0, 2.0)]), &levels(&[(101.0, 1.0)]), 3).unwrap();
        assert_eq!(m.ts, 2);
        assert_eq!(m.bid_liq, 0.0);
        assert_eq!(m.obi, 0.0);
        assert_eq!(m.bid_liq_delta, -1.0);

        // previous liquidity of zero: guarded delta
        let m = agg.ingest(&levels(&[(100.0, 2.0)]), &levels(&[(101.0, 1.0)]), 4).unwrap();
        assert_eq!(m.bid_liq_delta, 0.0);
    }

    #[test]
    fn test_liquidity_delta_and_ratios() {
        let mut agg = BookFeatureAggregator::default();
        agg.ingest(&levels(&[(100.0, 2.0)]), &levels(&[(101.0, 4.0)]), 1);
        let first = agg
            .ingest(&levels(&[(100.0, 3.0)]), &levels(&[(101.0, 2.0)]), 2)
            .unwrap();
        assert_eq!(first.ts, 1);
        let second = agg.ingest(&[], &[], 3).unwrap();
        assert_eq!(second.ts, 2);

        assert!((second.bid_liq_delta - 0.5).abs() < 1e-12);
        assert!((second.ask_liq_delta + 0.5).abs() < 1e-12);
        assert_eq!(second.bid_liq_increasing_ratio, 0.5);
        assert_eq!(second.ask_liq_decreasing_ratio, 0.5);
        // obi: -1/3 then +0.2
        assert_eq!(second.obi_pos_ratio, 0.5);
        let expected_ew = 0.2 * 0.2 + 0.8 * (-1.0 / 3.0);
        assert!((second.ew_obi - expected_ew).abs() < 1e-12);
    }

    #[test]
    fn test_late_snapshot_dropped() {
        let mut agg = BookFeatureAggregator::default();
        agg.ingest(&levels(&[(100.0, 2.0)]), &levels(&[(101.0, 1.0)]), 5);
        agg.ingest(&levels(&[(100.0, 1.0)]), &levels(&[(101.0, 1.0)]), 6);

        assert!(agg.ingest(&levels(&[(100.0, 9.0)]), &levels(&[(101.0, 9.0)]), 5).is_none());
        assert_eq!(agg.counters().late_dropped, 1);
        assert_eq!(agg.current_bucket().unwrap().ts, 6);
        assert_eq!(agg.current_bucket().unwrap().bid_liq, 1.0);
    }

    #[test]
    fn test_force_finalize_then_late() {
        let mut agg = BookFeatureAggregator::default();
        agg.ingest(&levels(&[(100.0, 2.0)]), &levels(&[(101.0, 1.0)]), 5);
        let m = agg.force_finalize().unwrap();
        assert_eq!(m.ts, 5);
        assert!(agg.force_finalize().is_none());

        assert!(agg.ingest(&levels(&[(100.0, 2.0)]), &levels(&[(101.0, 1.0)]), 5).is_none());
        assert_eq!(agg.counters().late_dropped, 1);
        assert!(agg.current_bucket().is_none());
    }

    #[test]
    fn test_levels_truncated() {
        let mut agg = BookFeatureAggregator::new(1);
        agg.ingest(
            &levels(&[(100.0, 2.0), (99.0, 30.0)]),
            &levels(&[(101.0, 1.0), (102.0, 40.0)]),
            1,
        );
        let b = agg.current_bucket().unwrap();
        assert_eq!(b.bid_liq, 2.0);
        assert_eq!(b.ask_liq, 1.0);
    }

    #[test]
    fn test_zscores_appear_after_warmup() {
        let mut agg = BookFeatureAggregator::default();
        let mut outputs = Vec::new();
        // bid_liq/ask_liq/weighted_obi warm up at 30, deltas at 18
        for ts in 0..=31 {
            if let Some(m) = agg.ingest(&levels(&[(100.0, 2.0)]), &levels(&[(101.0, 2.0)]), ts) {
                outputs.push(m);
            }
        }
        assert_eq!(outputs.len(), 31);
        assert!(outputs[16].z_bid_liq_delta.is_none());
        assert_eq!(outputs[17].z_bid_liq_delta, Some(0.0));
        assert!(outputs[28].z_bid_liq.is_none());
        assert_eq!(outputs[29].z_bid_liq, Some(0.0));
        assert_eq!(outputs[29].z_weighted_obi, Some(0.0));

        let fields = outputs[28].fields();
        assert!(fields.contains_key("z_bid_liq_delta"));
        assert!(!fields.contains_key("z_bid_liq"));
        assert!(!fields.contains_key("ts"));
    }

    #[test]
    fn test_metrics_serialize_without_pending_zscores() {
        let mut agg = BookFeatureAggregator::default();
        agg.ingest(&levels(&[(100.0, 2.0)]), &levels(&[(101.0, 1.0)]), 1);
        let m = agg.force_finalize().unwrap();
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["ts"], 1);
        assert!(json.get("z_bid_liq").is_none());
        assert!(json.get("obi").is_some());
    }
}
