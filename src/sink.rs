//! JSONL output with time-bucketed file rotation.
//!
//! Producers hand items to an unbounded queue and return immediately; a
//! dedicated writer thread owns the file. Queue depth is tracked so a slow
//! disk shows up as a logged backpressure signal instead of dropped lines.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use serde::Serialize;
use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::JoinHandle,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::features::{BookMetrics, TapeMetrics};
use crate::merge::MergeRecord;
use crate::types::ExternalQuote;

/// Anything written to a rotating JSONL stream. The timestamp picks the file.
pub trait Timestamped {
    fn timestamp(&self) -> i64;
}

impl Timestamped for MergeRecord {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

impl Timestamped for BookMetrics {
    fn timestamp(&self) -> i64 {
        self.ts
    }
}

impl Timestamped for TapeMetrics {
    fn timestamp(&self) -> i64 {
        self.ts
    }
}

impl Timestamped for ExternalQuote {
    fn timestamp(&self) -> i64 {
        self.ts
    }
}

/// Destination for flushed merge records. Implementations must not block.
pub trait RecordSink: Send + Sync {
    fn submit(&self, record: MergeRecord);
}

impl RecordSink for mpsc::UnboundedSender<MergeRecord> {
    fn submit(&self, record: MergeRecord) {
        if let Err(mpsc::error::SendError(record)) = self.send(record) {
            warn!(timestamp = record.timestamp, "record receiver dropped; record lost");
        }
    }
}

/// Start second of the rotation candle containing `second`.
#[inline]
pub fn candle_start(second: i64, rotation_minutes: u32) -> i64 {
    let width = i64::from(rotation_minutes.max(1)) * 60;
    second - second.rem_euclid(width)
}

/// `base/YYYY/MM/DD/HH/MM_<name>` for the candle containing `second` (UTC).
pub fn rotated_path(base: &Path, name: &str, second: i64, rotation_minutes: u32) -> PathBuf {
    let start = candle_start(second, rotation_minutes);
    let dt = Utc
        .timestamp_opt(start, 0)
        .single()
        .unwrap_or_default();

    base.join(dt.format("%Y").to_string())
        .join(dt.format("%m").to_string())
        .join(dt.format("%d").to_string())
        .join(dt.format("%H").to_string())
        .join(format!("{}_{}", dt.format("%M"), name))
}

#[derive(Debug, Default)]
struct SinkShared {
    depth: AtomicUsize,
    high_water: usize,
    above_high_water: AtomicBool,
    submitted: AtomicU64,
}

/// Totals reported by the writer thread when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterReport {
    pub lines_written: u64,
    pub write_errors: u64,
    pub files_opened: u64,
}

/// Cloneable producer handle for one JSONL stream.
pub struct JsonlSink<T> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<T>,
    shared: Arc<SinkShared>,
}

impl<T> Clone for JsonlSink<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

/// Join handle for the writer thread. The thread exits once every
/// [`JsonlSink`] clone has been dropped and the queue is empty.
pub struct SinkTask {
    name: String,
    handle: JoinHandle<WriterReport>,
}

impl SinkTask {
    pub fn join(self) -> Result<WriterReport> {
        self.handle
            .join()
            .map_err(|_| anyhow::anyhow!("jsonl writer thread `{}` panicked", self.name))
    }
}

impl<T> JsonlSink<T>
where
    T: Serialize + Timestamped + Send + 'static,
{
    pub fn spawn(
        base_dir: impl Into<PathBuf>,
        name: &str,
        rotation_minutes: u32,
        high_water: usize,
    ) -> Result<(Self, SinkTask)> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("create data dir {}", base_dir.display()))?;

        let (tx, rx) = mpsc::unbounded_channel::<T>();
        let shared = Arc::new(SinkShared {
            high_water: high_water.max(1),
            ..Default::default()
        });

        let writer = RotatingWriter {
            base_dir,
            name: name.to_string(),
            rotation_minutes,
            current: None,
            report: WriterReport::default(),
        };
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("jsonl-{name}"))
            .spawn(move || writer.run(rx, thread_shared))
            .context("spawn jsonl writer thread")?;

        Ok((
            Self {
                name: Arc::from(name),
                tx,
                shared,
            },
            SinkTask {
                name: name.to_string(),
                handle,
            },
        ))
    }

    /// Queue one item. Never blocks; items are only lost if the writer
    /// thread has already exited.
    pub fn write(&self, item: T) {
        let depth = self.shared.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);

        if self.tx.send(item).is_err() {
            self.shared.depth.fetch_sub(1, Ordering::Relaxed);
            error!(sink = %self.name, "jsonl writer is gone; item lost");
            return;
        }

        if depth >= self.shared.high_water
            && !self.shared.above_high_water.swap(true, Ordering::Relaxed)
        {
            warn!(
                sink = %self.name,
                depth,
                high_water = self.shared.high_water,
                "output queue above high-water mark; writer is falling behind"
            );
        }
    }

    /// Items queued but not yet written.
    pub fn queue_depth(&self) -> usize {
        self.shared.depth.load(Ordering::Relaxed)
    }

    pub fn submitted(&self) -> u64 {
        self.shared.submitted.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl RecordSink for JsonlSink<MergeRecord> {
    fn submit(&self, record: MergeRecord) {
        self.write(record);
    }
}

struct OpenFile {
    candle: i64,
    path: PathBuf,
    out: BufWriter<File>,
}

struct RotatingWriter {
    base_dir: PathBuf,
    name: String,
    rotation_minutes: u32,
    current: Option<OpenFile>,
    report: WriterReport,
}

impl RotatingWriter {
    fn run<T: Serialize + Timestamped>(
        mut self,
        mut rx: mpsc::UnboundedReceiver<T>,
        shared: Arc<SinkShared>,
    ) -> WriterReport {
        while let Some(item) = rx.blocking_recv() {
            if let Err(e) = self.write_item(&item) {
                self.report.write_errors += 1;
                error!(sink = %self.name, error = %e, "jsonl write failed");
                // force a reopen on the next item
                self.current = None;
            }

            let depth = shared.depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
            if depth < shared.high_water / 2
                && shared.above_high_water.swap(false, Ordering::Relaxed)
            {
                info!(sink = %self.name, depth, "output queue back below high-water mark");
            }
        }

        if let Some(mut open) = self.current.take() {
            if let Err(e) = open.out.flush() {
                error!(sink = %self.name, error = %e, "final flush failed");
            }
        }
        debug!(sink = %self.name, report = ?self.report, "jsonl writer stopped");
        self.report
    }

    fn write_item<T: Serialize + Timestamped>(&mut self, item: &T) -> Result<()> {
        let second = item.timestamp();
        let candle = candle_start(second, self.rotation_minutes);

        let needs_open = self.current.as_ref().map_or(true, |f| f.candle != candle);
        if needs_open {
            self.open(second, candle)?;
        }

        let Some(open) = self.current.as_mut() else {
            anyhow::bail!("no open file for {}", self.name);
        };
        serde_json::to_writer(&mut open.out, item).context("serialize line")?;
        open.out.write_all(b"\n").context("write newline")?;
        open.out
            .flush()
            .with_context(|| format!("flush {}", open.path.display()))?;
        self.report.lines_written += 1;
        Ok(())
    }

    fn open(&mut self, second: i64, candle: i64) -> Result<()> {
        if let Some(mut old) = self.current.take() {
            old.out.flush().ok();
        }

        let path = rotated_path(&self.base_dir, &self.name, second, self.rotation_minutes);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;

        info!(sink = %self.name, path = %path.display(), "switched output file");
        self.report.files_opened += 1;
        self.current = Some(OpenFile {
            candle,
            path,
            out: BufWriter::new(file),
        });
        Ok(())
    }
}
