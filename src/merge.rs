//! Watermark-driven merge of the book, tape and external quote streams.
//!
//! The primary streams (book, tape) share one watermark: the highest second
//! either of them has finalized. When a strictly later second arrives on the
//! primary path, the record at the old watermark is considered complete and
//! is flushed. The external stream only writes into records; its clock never
//! moves the watermark.
//!
//! There is no grace period: an external quote landing after its second was
//! flushed is dropped and counted.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::types::{Fields, MetricSet};

/// One merged, flushed second.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRecord {
    pub timestamp: i64,
    pub fields: Fields,
}

impl MergeRecord {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }

    /// Number of keys in the serialized object. A field named `timestamp` is
    /// replaced by the record's own timestamp.
    fn serialized_len(&self) -> usize {
        self.fields.len() + usize::from(!self.fields.contains_key("timestamp"))
    }
}

impl Serialize for MergeRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.serialized_len()))?;
        for (k, v) in &self.fields {
            if k != "timestamp" {
                map.serialize_entry(k, v)?;
            }
        }
        map.serialize_entry("timestamp", &self.timestamp)?;
        map.end()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub flushed: u64,
    pub late_primary: u64,
    pub late_external: u64,
    pub orphaned: u64,
    pub pending: usize,
}

/// Partial record for a second that has not been flushed yet.
#[derive(Debug, Default)]
struct Partial {
    fields: Fields,
    has_primary: bool,
}

#[derive(Debug, Default)]
pub struct MergeCoordinator {
    partials: BTreeMap<i64, Partial>,
    watermark: Option<i64>,
    drained: bool,
    stats: CoordinatorStats,
}

impl MergeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            pending: self.partials.len(),
            ..self.stats
        }
    }

    /// Merge fields from the independently-clocked source. Never flushes.
    pub fn accept_external(&mut self, second: i64, fields: Fields) {
        if matches!(self.watermark, Some(w) if second < w) {
            self.stats.late_external += 1;
            trace!(second, watermark = ?self.watermark, "dropping late external quote");
            return;
        }
        self.partials.entry(second).or_default().fields.extend(fields);
    }

    /// Merge fields from a primary aggregator. Returns the record completed by
    /// this call, if the watermark advanced.
    pub fn accept_primary(&mut self, second: i64, fields: Fields) -> Option<MergeRecord> {
        let mut flushed = None;

        match self.watermark {
            Some(w) if second < w => {
                self.stats.late_primary += 1;
                debug!(second, watermark = w, "dropping late primary metrics");
                return None;
            }
            Some(w) if second > w => {
                flushed = self.flush(w);
                self.prune_below(second);
                self.watermark = Some(second);
            }
            Some(_) => {}
            None => self.watermark = Some(second),
        }

        let partial = self.partials.entry(second).or_default();
        partial.fields.extend(fields);
        partial.has_primary = true;

        flushed
    }

    pub fn accept_metrics<M: MetricSet>(&mut self, metrics: &M) -> Option<MergeRecord> {
        self.accept_primary(metrics.second(), metrics.fields())
    }

    /// Remove every remaining partial record in ascending second order.
    pub fn drain(&mut self) -> Vec<MergeRecord> {
        self.drained = true;
        let partials = std::mem::take(&mut self.partials);
        let records: Vec<MergeRecord> = partials
            .into_iter()
            .map(|(timestamp, p)| MergeRecord {
                timestamp,
                fields: p.fields,
            })
            .collect();
        self.stats.flushed += records.len() as u64;
        records
    }

    fn flush(&mut self, second: i64) -> Option<MergeRecord> {
        // The watermark second always received a primary contribution, so its
        // record exists unless a drain already emptied the map.
        let partial = self.partials.remove(&second);
        debug_assert!(
            partial.is_some() || self.drained,
            "watermark {second} has no partial record"
        );
        let partial = partial?;
        self.stats.flushed += 1;
        Some(MergeRecord {
            timestamp: second,
            fields: partial.fields,
        })
    }

    /// Drop external-only records that the watermark has now passed.
    fn prune_below(&mut self, second: i64) {
        let keep = self.partials.split_off(&second);
        let stale = std::mem::replace(&mut self.partials, keep);
        for (ts, partial) in stale {
            debug_assert!(!partial.has_primary, "primary record {ts} pruned without flush");
            self.stats.orphaned += 1;
            trace!(second = ts, "dropping external-only record behind watermark");
        }
    }
}
