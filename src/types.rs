//! Shared market data types passed between listeners, aggregators and the
//! merge coordinator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flat name -> value mapping handed to the merge coordinator.
pub type Fields = BTreeMap<String, f64>;

/// A single book level. `size == 0.0` means "remove this level" on the wire;
/// levels handed to aggregators always carry a positive size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

impl PriceLevel {
    #[inline]
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0 && self.size.is_finite() && self.size >= 0.0
    }
}

impl From<(f64, f64)> for PriceLevel {
    fn from((price, size): (f64, f64)) -> Self {
        Self { price, size }
    }
}

/// Depth-limited book view: bids descending, asks ascending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub ts: i64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Binance reports `m = true` when the buyer is the maker, i.e. the
    /// aggressor sold.
    #[inline]
    pub fn from_buyer_is_maker(buyer_is_maker: bool) -> Self {
        if buyer_is_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeTick {
    pub ts: i64,
    pub price: f64,
    pub size: f64,
    pub side: Side,
}

impl TradeTick {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0 && self.size.is_finite() && self.size >= 0.0
    }
}

/// Quote update from the independently-clocked prediction market source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalQuote {
    pub ts: i64,
    pub fields: Fields,
}

/// A finalized per-second metric set from one primary aggregator.
pub trait MetricSet {
    /// Unix second the metrics describe.
    fn second(&self) -> i64;

    /// Every available field except the timestamp. z-scores that are not yet
    /// warmed up are absent.
    fn fields(&self) -> Fields;
}
