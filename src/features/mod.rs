//! Per-second feature aggregation for the book and tape streams.
//!
//! Each aggregator owns exactly one open bucket. A bucket is finalized only
//! when a strictly later second shows up on the same stream; events for an
//! earlier second are dropped and counted.

pub mod book;
pub mod smoother;
pub mod tape;
pub mod window;

pub use book::{BookBucket, BookFeatureAggregator, BookMetrics};
pub use smoother::Smoother;
pub use tape::{TapeBucket, TapeFeatureAggregator, TapeMetrics};
pub use window::{RatioWindow, RingBuffer, RollingNormalizer};

use serde::Serialize;

/// Quality counters kept by each aggregator. Single writer, read by the
/// stats reporter through snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestCounters {
    pub events: u64,
    pub finalized: u64,
    pub late_dropped: u64,
    pub malformed: u64,
}

/// Where an incoming event lands relative to the open bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BucketRoute {
    /// Same second as the open bucket.
    Current,
    /// Later second (or no bucket yet): finalize the open one, then open a new one.
    Rollover,
    /// Earlier than the open or last finalized second.
    Late,
}

/// Decide how an event at `ts` is routed given the open bucket second and
/// the last finalized second.
#[inline]
pub(crate) fn route(ts: i64, open: Option<i64>, last_finalized: Option<i64>) -> BucketRoute {
    match open {
        Some(b) if ts == b => BucketRoute::Current,
        Some(b) if ts < b => BucketRoute::Late,
        Some(_) => BucketRoute::Rollover,
        None => match last_finalized {
            Some(f) if ts <= f => BucketRoute::Late,
            _ => BucketRoute::Rollover,
        },
    }
}

/// `num / den`, or `0.0` when the denominator is zero.
#[inline]
pub(crate) fn guarded_ratio(num: f64, den: f64) -> f64 {
    if den != 0.0 {
        num / den
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route() {
        assert_eq!(route(10, None, None), BucketRoute::Rollover);
        assert_eq!(route(10, Some(10), None), BucketRoute::Current);
        assert_eq!(route(11, Some(10), None), BucketRoute::Rollover);
        assert_eq!(route(9, Some(10), Some(9)), BucketRoute::Late);
        assert_eq!(route(9, None, Some(9)), BucketRoute::Late);
        assert_eq!(route(10, None, Some(9)), BucketRoute::Rollover);
    }

    #[test]
    fn test_guarded_ratio() {
        assert_eq!(guarded_ratio(1.0, 0.0), 0.0);
        assert_eq!(guarded_ratio(1.0, 4.0), 0.25);
    }
}
