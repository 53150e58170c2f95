//! Binance raw streams: `<symbol>@depth@100ms` diffs and `<symbol>@trade`.
//!
//! The depth stream carries only changed levels, so a local book is kept and
//! the top of it is re-emitted after every diff.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use tracing::debug;

use super::{ListenerStats, StreamDecoder};
use crate::types::{BookSnapshot, PriceLevel, Side, TradeTick};

/// Price keys are quantized to 1e-8 so float noise can't split a level.
const PRICE_SCALE: f64 = 1e8;

#[inline]
fn price_key(price: f64) -> i64 {
    (price * PRICE_SCALE).round() as i64
}

// Format: {"e":"depthUpdate","E":1769683032123,"s":"BTCUSDT","U":157,"u":160,
//          "b":[["97000.10","0.5"]],"a":[["97000.20","0"]]}
#[derive(Debug, Deserialize)]
struct RawDepthUpdate {
    #[serde(rename = "E")]
    event_time_ms: i64,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b", default)]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a", default)]
    asks: Vec<[String; 2]>,
}

// Format: {"e":"trade","E":1769683032123,"s":"BTCUSDT","t":12345,"p":"97000.10",
//          "q":"0.010","T":1769683032120,"m":true}
#[derive(Debug, Deserialize)]
struct RawTrade {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time_ms: i64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthUpdate {
    pub event_time_ms: i64,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl DepthUpdate {
    /// Event second, `E / 1000`.
    pub fn second(&self) -> i64 {
        self.event_time_ms.div_euclid(1000)
    }
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<PriceLevel>> {
    raw.iter()
        .map(|[p, q]| {
            let price: f64 = fast_float::parse(p).with_context(|| format!("price {p:?}"))?;
            let size: f64 = fast_float::parse(q).with_context(|| format!("size {q:?}"))?;
            Ok(PriceLevel::new(price, size))
        })
        .collect()
}

pub fn parse_depth_update(text: &str) -> Result<DepthUpdate> {
    let raw: RawDepthUpdate = serde_json::from_str(text).context("depth update json")?;
    Ok(DepthUpdate {
        event_time_ms: raw.event_time_ms,
        first_update_id: raw.first_update_id,
        final_update_id: raw.final_update_id,
        bids: parse_levels(&raw.bids)?,
        asks: parse_levels(&raw.asks)?,
    })
}

pub fn parse_trade(text: &str) -> Result<TradeTick> {
    let raw: RawTrade = serde_json::from_str(text).context("trade json")?;
    let price: f64 = fast_float::parse(&raw.price).context("trade price")?;
    let size: f64 = fast_float::parse(&raw.quantity).context("trade quantity")?;
    Ok(TradeTick {
        ts: raw.trade_time_ms.div_euclid(1000),
        price,
        size,
        side: Side::from_buyer_is_maker(raw.buyer_is_maker),
    })
}

/// Local L2 book rebuilt from depth diffs.
#[derive(Debug, Default)]
pub struct LocalBook {
    bids: BTreeMap<i64, PriceLevel>,
    asks: BTreeMap<i64, PriceLevel>,
    last_update_id: Option<u64>,
}

impl LocalBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one diff. Size 0 removes the level. Returns the number of
    /// update ids skipped since the previous diff.
    pub fn apply(&mut self, update: &DepthUpdate) -> u64 {
        let gap = match self.last_update_id {
            Some(last) if update.first_update_id > last + 1 => {
                update.first_update_id - last - 1
            }
            _ => 0,
        };
        self.last_update_id = Some(update.final_update_id);

        apply_side(&mut self.bids, &update.bids);
        apply_side(&mut self.asks, &update.asks);
        gap
    }

    /// Best `n` bids, highest price first.
    pub fn top_bids(&self, n: usize) -> Vec<PriceLevel> {
        self.bids.values().rev().take(n).copied().collect()
    }

    /// Best `n` asks, lowest price first.
    pub fn top_asks(&self, n: usize) -> Vec<PriceLevel> {
        self.asks.values().take(n).copied().collect()
    }

    pub fn snapshot(&self, ts: i64, levels: usize) -> BookSnapshot {
        BookSnapshot {
            ts,
            bids: self.top_bids(levels),
            asks: self.top_asks(levels),
        }
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.last_update_id = None;
    }
}

fn apply_side(side: &mut BTreeMap<i64, PriceLevel>, levels: &[PriceLevel]) {
    for level in levels {
        let key = price_key(level.price);
        if level.size == 0.0 {
            side.remove(&key);
        } else {
            side.insert(key, *level);
        }
    }
}

/// Depth diffs -> top-of-book snapshots.
#[derive(Debug)]
pub struct DepthDecoder {
    book: LocalBook,
    levels_used: usize,
}

impl DepthDecoder {
    pub fn new(levels_used: usize) -> Self {
        Self {
            book: LocalBook::new(),
            levels_used,
        }
    }

    pub fn book(&self) -> &LocalBook {
        &self.book
    }
}

impl StreamDecoder for DepthDecoder {
    type Item = BookSnapshot;

    fn reset(&mut self) {
        self.book.clear();
    }

    fn decode(&mut self, text: &str, stats: &ListenerStats) -> Vec<BookSnapshot> {
        let update = match parse_depth_update(text) {
            Ok(u) => u,
            Err(e) => {
                stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %format!("{e:#}"), "bad depth message");
                return Vec::new();
            }
        };

        let gap = self.book.apply(&update);
        if gap > 0 {
            stats.gaps_total.fetch_add(gap, Ordering::Relaxed);
            debug!(
                gap,
                first_update_id = update.first_update_id,
                "depth update id gap"
            );
        }

        vec![self.book.snapshot(update.second(), self.levels_used)]
    }
}

/// Trade messages -> ticks.
#[derive(Debug, Default)]
pub struct TradeDecoder;

impl StreamDecoder for TradeDecoder {
    type Item = TradeTick;

    fn decode(&mut self, text: &str, stats: &ListenerStats) -> Vec<TradeTick> {
        match parse_trade(text) {
            Ok(tick) => vec![tick],
            Err(e) => {
                stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %format!("{e:#}"), "bad trade message");
                Vec::new()
            }
        }
    }
}
