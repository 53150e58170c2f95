//! Bounded rolling windows used by the feature aggregators.
//!
//! Every window advances once per finalized bucket, never on wall-clock time,
//! so a quiet stream simply stops moving its windows.

use std::collections::VecDeque;

/// Default capacity for boolean ratio windows.
pub const DEFAULT_RATIO_WINDOW: usize = 20;

/// Minimum history before a z-score is reported, regardless of window size.
const MIN_ZSCORE_SAMPLES: usize = 5;

/// Fixed-capacity FIFO. Pushing into a full buffer evicts the oldest element.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `item`, returning the element it displaced (if the buffer was full).
    #[inline]
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.iter()
    }
}

impl RingBuffer<f64> {
    pub fn sum(&self) -> f64 {
        self.items.iter().sum()
    }
}

/// One named series inside a [`RollingNormalizer`].
#[derive(Debug, Clone)]
struct NormalizedSeries {
    name: &'static str,
    history: RingBuffer<f64>,
    min_samples: usize,
}

impl NormalizedSeries {
    fn new(name: &'static str, window: usize) -> Self {
        Self {
            name,
            history: RingBuffer::new(window),
            min_samples: MIN_ZSCORE_SAMPLES.max(window / 10),
        }
    }

    fn observe(&mut self, value: f64) -> Option<f64> {
        self.history.push(value);
        if self.history.len() < self.min_samples {
            return None;
        }

        let n = self.history.len() as f64;
        let mean = self.history.sum() / n;
        let variance = self
            .history
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / n;
        let std_dev = variance.sqrt();

        if std_dev > 0.0 {
            Some((value - mean) / std_dev)
        } else {
            Some(0.0)
        }
    }
}

/// Rolling z-score for a fixed set of named metrics.
///
/// A metric reports `None` until its history holds `max(5, window / 10)`
/// values; callers must keep that distinct from a computed `0.0`.
#[derive(Debug, Clone)]
pub struct RollingNormalizer {
    series: Vec<NormalizedSeries>,
}

impl RollingNormalizer {
    pub fn new(windows: &[(&'static str, usize)]) -> Self {
        Self {
            series: windows
                .iter()
                .map(|(name, window)| NormalizedSeries::new(name, *window))
                .collect(),
        }
    }

    /// Record the latest raw value for `name` and score it against its window.
    /// Unknown names are ignored.
    pub fn observe(&mut self, name: &str, value: f64) -> Option<f64> {
        self.series
            .iter_mut()
            .find(|s| s.name == name)
            .and_then(|s| s.observe(value))
    }

    /// Number of values currently held for `name`.
    pub fn history_len(&self, name: &str) -> usize {
        self.series
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.history.len())
            .unwrap_or(0)
    }
}

/// Fraction of recent finalizations for which a predicate held.
#[derive(Debug, Clone)]
pub struct RatioWindow {
    history: RingBuffer<bool>,
    true_count: usize,
}

impl Default for RatioWindow {
    fn default() -> Self {
        Self::new(DEFAULT_RATIO_WINDOW)
    }
}

impl RatioWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: RingBuffer::new(capacity),
            true_count: 0,
        }
    }

    /// Append one outcome and return the updated ratio. The window is never
    /// empty when the ratio is read.
    #[inline]
    pub fn push(&mut self, hit: bool) -> f64 {
        if hit {
            self.true_count += 1;
        }
        if let Some(true) = self.history.push(hit) {
            self.true_count -= 1;
        }
        self.true_count as f64 / self.history.len() as f64
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
