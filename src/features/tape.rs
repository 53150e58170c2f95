//! Trade tape feature aggregation.
//!
//! Buckets accumulate buy and sell volume per second and remember the last
//! traded price. Finalization derives flow imbalance, cumulative volume
//! delta, volume acceleration and price efficiency over a short trailing
//! window.

use serde::Serialize;

use super::{
    guarded_ratio, route, BucketRoute, IngestCounters, RatioWindow, RingBuffer,
    RollingNormalizer, Smoother,
};
use crate::types::{Fields, MetricSet, Side, TradeTick};

const EW_AFI_ALPHA: f64 = 0.2;
const EW_CVD_WINDOW: usize = 40;
const VOL_FAST_WINDOW: usize = 5;
const VOL_SLOW_WINDOW: usize = 20;

/// Trailing seconds used for the efficiency metrics.
pub const EFFICIENCY_WINDOW: usize = 10;

const Z_WINDOWS: &[(&str, usize)] = &[
    ("afi", 180),
    ("cvd_slope", 120),
    ("vol_accel", 120),
    ("vol_per_sec", 120),
    ("total_vol", 120),
    ("buy_vol", 120),
    ("sell_vol", 120),
    ("price_eff", 60),
    ("buy_eff", 60),
    ("sell_eff", 60),
];

/// Mutable accumulator for one second of trades.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TapeBucket {
    pub ts: i64,
    pub buy_vol: f64,
    pub sell_vol: f64,
    pub last_price: f64,
}

impl TapeBucket {
    /// A second with no valid trade reports `last_price` unchanged.
    fn open(ts: i64, last_price: f64) -> Self {
        Self {
            ts,
            last_price,
            ..Default::default()
        }
    }

    fn apply(&mut self, price: f64, size: f64, side: Side) {
        self.last_price = price;
        match side {
            Side::Buy => self.buy_vol += size,
            Side::Sell => self.sell_vol += size,
        }
    }
}

/// Finalized trade tape features for one second.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TapeMetrics {
    pub ts: i64,
    pub price: f64,
    pub buy_vol: f64,
    pub sell_vol: f64,
    pub total_vol: f64,
    pub vol_per_sec: f64,
    pub vol_accel: f64,
    pub afi: f64,
    pub ew_afi: f64,
    pub cvd: f64,
    pub cvd_slope: f64,
    pub price_eff: f64,
    pub buy_eff: f64,
    pub sell_eff: f64,
    pub afi_pos_ratio: f64,
    pub cvd_slope_pos_ratio: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_afi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_cvd_slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_vol_accel: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_vol_per_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_total_vol: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_buy_vol: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_sell_vol: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_price_eff: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_buy_eff: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_sell_eff: Option<f64>,
}

impl MetricSet for TapeMetrics {
    fn second(&self) -> i64 {
        self.ts
    }

    fn fields(&self) -> Fields {
        let mut fields = Fields::new();
        for (name, value) in [
            ("price", self.price),
            ("buy_vol", self.buy_vol),
            ("sell_vol", self.sell_vol),
            ("total_vol", self.total_vol),
            ("vol_per_sec", self.vol_per_sec),
            ("vol_accel", self.vol_accel),
            ("afi", self.afi),
            ("ew_afi", self.ew_afi),
            ("cvd", self.cvd),
            ("cvd_slope", self.cvd_slope),
            ("price_eff", self.price_eff),
            ("buy_eff", self.buy_eff),
            ("sell_eff", self.sell_eff),
            ("afi_pos_ratio", self.afi_pos_ratio),
            ("cvd_slope_pos_ratio", self.cvd_slope_pos_ratio),
        ] {
            fields.insert(name.to_string(), value);
        }
        for (name, value) in [
            ("z_afi", self.z_afi),
            ("z_cvd_slope", self.z_cvd_slope),
            ("z_vol_accel", self.z_vol_accel),
            ("z_vol_per_sec", self.z_vol_per_sec),
            ("z_total_vol", self.z_total_vol),
            ("z_buy_vol", self.z_buy_vol),
            ("z_sell_vol", self.z_sell_vol),
            ("z_price_eff", self.z_price_eff),
            ("z_buy_eff", self.z_buy_eff),
            ("z_sell_eff", self.z_sell_eff),
        ] {
            if let Some(v) = value {
                fields.insert(name.to_string(), v);
            }
        }
        fields
    }
}

/// Price move per unit of volume over the trailing histories. All zero
/// until the histories are full.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Efficiency {
    price: f64,
    buy: f64,
    sell: f64,
}

/// Turns a stream of trades into one [`TapeMetrics`] per second.
#[derive(Debug, Clone)]
pub struct TapeFeatureAggregator {
    current: Option<TapeBucket>,
    last_finalized: Option<i64>,

    last_price: f64,
    cvd: f64,
    ew_afi: Option<f64>,
    ew_cvd: Smoother,
    prev_ew_cvd: Option<f64>,
    vol_fast: Smoother,
    vol_slow: Smoother,

    price_hist: RingBuffer<f64>,
    buy_hist: RingBuffer<f64>,
    sell_hist: RingBuffer<f64>,

    afi_pos: RatioWindow,
    cvd_slope_pos: RatioWindow,
    normalizer: RollingNormalizer,

    counters: IngestCounters,
}

impl Default for TapeFeatureAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl TapeFeatureAggregator {
    pub fn new() -> Self {
        Self {
            current: None,
            last_finalized: None,
            last_price: 0.0,
            cvd: 0.0,
            ew_afi: None,
            ew_cvd: Smoother::with_window(EW_CVD_WINDOW),
            prev_ew_cvd: None,
            vol_fast: Smoother::with_window(VOL_FAST_WINDOW),
            vol_slow: Smoother::with_window(VOL_SLOW_WINDOW),
            price_hist: RingBuffer::new(EFFICIENCY_WINDOW),
            buy_hist: RingBuffer::new(EFFICIENCY_WINDOW),
            sell_hist: RingBuffer::new(EFFICIENCY_WINDOW),
            afi_pos: RatioWindow::default(),
            cvd_slope_pos: RatioWindow::default(),
            normalizer: RollingNormalizer::new(Z_WINDOWS),
            counters: IngestCounters::default(),
        }
    }

    pub fn ingest_tick(&mut self, tick: &TradeTick) -> Option<TapeMetrics> {
        self.ingest(tick.price, tick.size, tick.side, tick.ts)
    }

    /// Feed one trade. Returns the previous second's metrics when `ts` rolls
    /// the bucket over. The triggering trade always lands in the new bucket.
    pub fn ingest(&mut self, price: f64, size: f64, side: Side, ts: i64) -> Option<TapeMetrics> {
        self.counters.events += 1;

        let finalized = match route(ts, self.current.map(|b| b.ts), self.last_finalized) {
            BucketRoute::Late => {
                self.counters.late_dropped += 1;
                return None;
            }
            BucketRoute::Current => None,
            BucketRoute::Rollover => {
                let finalized = self.current.take().map(|b| self.finalize(b));
                self.current = Some(TapeBucket::open(ts, self.last_price));
                finalized
            }
        };

        let valid = price.is_finite() && price > 0.0 && size.is_finite() && size >= 0.0;
        if !valid {
            self.counters.malformed += 1;
            return finalized;
        }

        if let Some(bucket) = self.current.as_mut() {
            bucket.apply(price, size, side);
            self.last_price = price;
        }

        finalized
    }

    /// Close the open bucket without waiting for a later second.
    pub fn force_finalize(&mut self) -> Option<TapeMetrics> {
        let bucket = self.current.take()?;
        Some(self.finalize(bucket))
    }

    pub fn current_bucket(&self) -> Option<&TapeBucket> {
        self.current.as_ref()
    }

    /// Running cumulative volume delta over every finalized bucket.
    pub fn cvd(&self) -> f64 {
        self.cvd
    }

    pub fn counters(&self) -> IngestCounters {
        self.counters
    }

    fn efficiency(&self) -> Efficiency {
        if !(self.price_hist.is_full() && self.buy_hist.is_full() && self.sell_hist.is_full()) {
            return Efficiency::default();
        }

        let (Some(oldest), Some(newest)) = (self.price_hist.front(), self.price_hist.back()) else {
            return Efficiency::default();
        };
        let dp = newest - oldest;
        let buy_sum = self.buy_hist.sum();
        let sell_sum = self.sell_hist.sum();

        Efficiency {
            price: guarded_ratio(dp, buy_sum + sell_sum),
            buy: guarded_ratio(dp.max(0.0), buy_sum),
            sell: guarded_ratio((-dp).max(0.0), sell_sum),
        }
    }

    fn finalize(&mut self, b: TapeBucket) -> TapeMetrics {
        let buy = b.buy_vol;
        let sell = b.sell_vol;
        let total = buy + sell;

        let afi = guarded_ratio(buy - sell, total);
        let ew_afi = match self.ew_afi {
            Some(prev) => EW_AFI_ALPHA * afi + (1.0 - EW_AFI_ALPHA) * prev,
            None => afi,
        };
        self.ew_afi = Some(ew_afi);

        self.cvd += buy - sell;
        let ew_cvd = self.ew_cvd.update(self.cvd);
        let cvd_slope = self.prev_ew_cvd.map_or(0.0, |prev| ew_cvd - prev);
        self.prev_ew_cvd = Some(ew_cvd);

        let vol_per_sec = total;
        let vol_accel = self.vol_fast.update(vol_per_sec) - self.vol_slow.update(vol_per_sec);

        // no price to measure against before the first valid trade
        if b.last_price > 0.0 {
            self.price_hist.push(b.last_price);
            self.buy_hist.push(buy);
            self.sell_hist.push(sell);
        }
        let eff = self.efficiency();

        let afi_pos_ratio = self.afi_pos.push(afi > 0.0);
        let cvd_slope_pos_ratio = self.cvd_slope_pos.push(cvd_slope > 0.0);

        let n = &mut self.normalizer;
        let z_afi = n.observe("afi", afi);
        let z_cvd_slope = n.observe("cvd_slope", cvd_slope);
        let z_vol_accel = n.observe("vol_accel", vol_accel);
        let z_vol_per_sec = n.observe("vol_per_sec", vol_per_sec);
        let z_total_vol = n.observe("total_vol", total);
        let z_buy_vol = n.observe("buy_vol", buy);
        let z_sell_vol = n.observe("sell_vol", sell);
        let z_price_eff = n.observe("price_eff", eff.price);
        let z_buy_eff = n.observe("buy_eff", eff.buy);
        let z_sell_eff = n.observe("sell_eff", eff.sell);

        self.last_finalized = Some(b.ts);
        self.counters.finalized += 1;

        TapeMetrics {
            ts: b.ts,
            price: b.last_price,
            buy_vol: buy,
            sell_vol: sell,
            total_vol: total,
            vol_per_sec,
            vol_accel,
            afi,
            ew_afi,
            cvd: self.cvd,
            cvd_slope,
            price_eff: eff.price,
            buy_eff: eff.buy,
            sell_eff: eff.sell,
            afi_pos_ratio,
            cvd_slope_pos_ratio,
            z_afi,
            z_cvd_slope,
            z_vol_accel,
            z_vol_per_sec,
            z_total_vol,
            z_buy_vol,
            z_sell_vol,
            z_price_eff,
            z_buy_eff,
            z_sell_eff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tape_scenario() {
        let mut agg = TapeFeatureAggregator::new();
        assert!(agg.ingest(100.0, 1.0, Side::Buy, 5).is_none());
        assert!(agg.ingest(99.0, 2.0, Side::Sell, 5).is_none());
        let m = agg.ingest(101.0, 1.0, Side::Buy, 6).expect("rollover");

        assert_eq!(m.ts, 5);
        assert_eq!(m.buy_vol, 1.0);
        assert_eq!(m.sell_vol, 2.0);
        assert_eq!(m.total_vol, 3.0);
        assert!((m.afi + 1.0 / 3.0).abs() < 1e-12, "afi={}", m.afi);
        assert_eq!(m.cvd, -1.0);
        assert_eq!(m.cvd_slope, 0.0);
        // last trade of the second by arrival order
        assert_eq!(m.price, 99.0);
        assert_eq!(m.price_eff, 0.0);
        assert_eq!(m.afi_pos_ratio, 0.0);
        assert_eq!(m.vol_accel, 0.0);

        let bucket = agg.current_bucket().unwrap();
        assert_eq!(bucket.ts, 6);
        assert_eq!(bucket.buy_vol, 1.0);
        assert_eq!(bucket.last_price, 101.0);
    }

    #[test]
    fn test_cvd_is_running_sum() {
        let mut agg = TapeFeatureAggregator::new();
        let flows = [(3.0, 1.0), (0.5, 2.5), (4.0, 4.0), (0.0, 7.0), (2.0, 0.0)];
        let mut expected = 0.0;
        let mut seen = Vec::new();

        for (i, (buy, sell)) in flows.iter().enumerate() {
            let ts = i as i64;
            seen.extend(agg.ingest(100.0, *buy, Side::Buy, ts));
            seen.extend(agg.ingest(100.0, *sell, Side::Sell, ts));
        }
        seen.extend(agg.force_finalize());

        // every second contributes once
        let finalized: Vec<_> = seen.iter().map(|m| m.cvd).collect();
        assert_eq!(finalized.len(), flows.len());
        for (i, (buy, sell)) in flows.iter().enumerate() {
            expected += buy - sell;
            assert!((finalized[i] - expected).abs() < 1e-12);
        }
        assert!((agg.cvd() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_cvd_slope_tracks_smoothed_cvd() {
        let mut agg = TapeFeatureAggregator::new();
        agg.ingest(100.0, 10.0, Side::Buy, 1);
        let first = agg.ingest(100.0, 10.0, Side::Buy, 2).unwrap();
        let second = agg.force_finalize().unwrap();

        assert_eq!(first.cvd_slope, 0.0);
        let alpha = 2.0 / 41.0;
        let ew2 = alpha * 20.0 + (1.0 - alpha) * 10.0;
        assert!((second.cvd_slope - (ew2 - 10.0)).abs() < 1e-12);
        assert_eq!(second.cvd_slope_pos_ratio, 0.5);
    }

    #[test]
    fn test_efficiency_zero_until_history_full() {
        let mut agg = TapeFeatureAggregator::new();
        let mut out = Vec::new();
        // price climbs 1.0 per second, 1 buy + 1 sell each second
        for ts in 0..12 {
            let price = 100.0 + ts as f64;
            out.extend(agg.ingest(price, 1.0, Side::Buy, ts));
            out.extend(agg.ingest(price, 1.0, Side::Sell, ts));
        }
        out.extend(agg.force_finalize());
        assert_eq!(out.len(), 12);

        for m in &out[..EFFICIENCY_WINDOW - 1] {
            assert_eq!(m.price_eff, 0.0);
            assert_eq!(m.buy_eff, 0.0);
            assert_eq!(m.sell_eff, 0.0);
            assert!(m.fields().contains_key("price_eff"), "efficiency is emitted as 0.0");
        }

        let m = &out[EFFICIENCY_WINDOW - 1];
        // dp = 109 - 100 over 10 buys + 10 sells
        assert!((m.price_eff - 9.0 / 20.0).abs() < 1e-12);
        assert!((m.buy_eff - 9.0 / 10.0).abs() < 1e-12);
        assert_eq!(m.sell_eff, 0.0);
    }

    #[test]
    fn test_sell_efficiency_on_falling_price() {
        let mut agg = TapeFeatureAggregator::new();
        let mut last = None;
        for ts in 0..=EFFICIENCY_WINDOW as i64 {
            let price = 200.0 - 2.0 * ts as f64;
            if let Some(m) = agg.ingest(price, 4.0, Side::Sell, ts) {
                last = Some(m);
            }
        }
        let m = last.unwrap();
        // history 200..182, dp = -18, sell volume 40, no buys
        assert!((m.price_eff + 18.0 / 40.0).abs() < 1e-12);
        assert!((m.sell_eff - 18.0 / 40.0).abs() < 1e-12);
        assert_eq!(m.buy_eff, 0.0);
    }

    #[test]
    fn test_vol_accel_uses_fast_minus_slow() {
        let mut agg = TapeFeatureAggregator::new();
        agg.ingest(100.0, 1.0, Side::Buy, 1);
        agg.ingest(100.0, 11.0, Side::Buy, 2);
        let m = agg.force_finalize().unwrap();

        let fast = (2.0 / 6.0) * 11.0 + (1.0 - 2.0 / 6.0) * 1.0;
        let slow = (2.0 / 21.0) * 11.0 + (1.0 - 2.0 / 21.0) * 1.0;
        assert!((m.vol_accel - (fast - slow)).abs() < 1e-12);
    }

    #[test]
    fn test_malformed_trade_skipped_but_rolls() {
        let mut agg = TapeFeatureAggregator::new();
        agg.ingest(100.0, 1.0, Side::Buy, 1);
        let m = agg.ingest(0.0, 5.0, Side::Buy, 2).expect("rollover still happens");
        assert_eq!(m.ts, 1);
        assert_eq!(agg.counters().malformed, 1);

        agg.ingest(100.0, -1.0, Side::Sell, 2);
        agg.ingest(f64::NAN, 1.0, Side::Sell, 2);
        let bucket = agg.current_bucket().unwrap();
        assert_eq!(bucket.buy_vol, 0.0);
        assert_eq!(bucket.sell_vol, 0.0);
        assert_eq!(agg.counters().malformed, 3);
    }

    #[test]
    fn test_malformed_only_second_keeps_last_price() {
        let mut agg = TapeFeatureAggregator::new();
        let mut out = Vec::new();
        for ts in 0..=8 {
            out.extend(agg.ingest(100.0, 1.0, Side::Buy, ts));
        }
        out.extend(agg.ingest(f64::NAN, 1.0, Side::Buy, 9));
        out.extend(agg.ingest(100.0, 1.0, Side::Buy, 10));
        out.extend(agg.ingest(100.0, 1.0, Side::Buy, 11));
        out.extend(agg.force_finalize());
        assert_eq!(out.len(), 12);

        let quiet = &out[9];
        assert_eq!(quiet.ts, 9);
        assert_eq!(quiet.price, 100.0);
        assert_eq!(quiet.total_vol, 0.0);
        for m in &out {
            assert_eq!(m.price_eff, 0.0, "flat price at ts {}", m.ts);
            assert_eq!(m.buy_eff, 0.0);
            assert_eq!(m.sell_eff, 0.0);
        }
    }

    #[test]
    fn test_no_price_history_before_first_valid_trade() {
        let mut agg = TapeFeatureAggregator::new();
        agg.ingest(f64::NAN, 1.0, Side::Buy, 0);
        let m = agg.ingest(101.0, 1.0, Side::Buy, 1).unwrap();
        assert_eq!(m.ts, 0);
        assert_eq!(m.price, 0.0);

        let mut out = Vec::new();
        for ts in 2..=10 {
            out.extend(agg.ingest(100.0 + ts as f64, 1.0, Side::Buy, ts));
        }
        let m = agg.force_finalize().unwrap();
        // history holds 101..=110 from ts 1..=10, never the empty first second
        assert!(out.iter().all(|m| m.price_eff == 0.0));
        assert!((m.price_eff - 9.0 / 10.0).abs() < 1e-12, "price_eff={}", m.price_eff);
    }

    #[test]
    fn test_ew_afi_seeds_then_smooths() {
        let mut agg = TapeFeatureAggregator::new();
        agg.ingest(100.0, 3.0, Side::Buy, 1);
        agg.ingest(100.0, 1.0, Side::Sell, 1);
        let first = agg.ingest(100.0, 1.0, Side::Sell, 2).unwrap();
        let second = agg.force_finalize().unwrap();

        assert_eq!(first.afi, 0.5);
        assert_eq!(first.ew_afi, 0.5);
        assert_eq!(second.afi, -1.0);
        assert!((second.ew_afi - (0.2 * -1.0 + 0.8 * 0.5)).abs() < 1e-12);
    }

    #[test]
    fn test_late_trade_dropped() {
        let mut agg = TapeFeatureAggregator::new();
        agg.ingest(100.0, 1.0, Side::Buy, 10);
        agg.ingest(100.0, 1.0, Side::Buy, 11);
        assert!(agg.ingest(100.0, 50.0, Side::Sell, 10).is_none());
        assert_eq!(agg.counters().late_dropped, 1);
        assert_eq!(agg.current_bucket().unwrap().sell_vol, 0.0);
    }

    #[test]
    fn test_zscores_warm_up() {
        let mut agg = TapeFeatureAggregator::new();
        let mut out = Vec::new();
        for ts in 0..20 {
            if let Some(m) = agg.ingest(100.0, 1.0, Side::Buy, ts) {
                out.push(m);
            }
        }
        // efficiency windows (60) warm at 6, volume windows (120) at 12, afi (180) at 18
        assert!(out[4].z_price_eff.is_none());
        assert_eq!(out[5].z_price_eff, Some(0.0));
        assert!(out[10].z_buy_vol.is_none());
        assert_eq!(out[11].z_buy_vol, Some(0.0));
        assert!(out[16].z_afi.is_none());
        assert_eq!(out[17].z_afi, Some(0.0));
        assert!(!out[16].fields().contains_key("z_afi"));
        assert!(out[17].fields().contains_key("z_afi"));
    }
}
