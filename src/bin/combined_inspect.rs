//! Combined Dataset Inspection Tool
//!
//! Scans rotated JSONL output and reports what the collector actually wrote:
//! row counts, time range, duplicate and missing seconds, out-of-order rows,
//! and how often each field is present.
//!
//! Usage:
//!   cargo run --release --bin combined_inspect -- --data-dir ./data
//!   cargo run --release --bin combined_inspect -- --data-dir ./data --name l2.jsonl --json

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Inspect rotated collector output
#[derive(Parser, Debug)]
#[command(name = "combined_inspect")]
#[command(about = "Verify and summarize collector JSONL output")]
struct Cli {
    /// Output root written by the collector
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// Stream file name (files are `<MM>_<name>`)
    #[arg(short, long, default_value = "combined_data.jsonl")]
    name: String,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Default, Serialize)]
struct InspectReport {
    files: usize,
    rows: u64,
    malformed_lines: u64,
    first_timestamp: Option<i64>,
    last_timestamp: Option<i64>,
    duplicate_timestamps: u64,
    out_of_order: u64,
    missing_seconds: u64,
    field_rows: BTreeMap<String, u64>,
    #[serde(skip)]
    seen: BTreeSet<i64>,
    #[serde(skip)]
    prev: Option<i64>,
}

impl InspectReport {
    fn observe_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) else {
            self.malformed_lines += 1;
            return;
        };
        let Some(ts) = obj.get("timestamp").or_else(|| obj.get("ts")).and_then(Value::as_i64) else {
            self.malformed_lines += 1;
            return;
        };

        self.rows += 1;
        if !self.seen.insert(ts) {
            self.duplicate_timestamps += 1;
        }
        if matches!(self.prev, Some(p) if ts < p) {
            self.out_of_order += 1;
        }
        self.prev = Some(ts);

        for key in obj.keys() {
            if key != "timestamp" && key != "ts" {
                *self.field_rows.entry(key.clone()).or_default() += 1;
            }
        }
    }

    fn finish(&mut self) {
        self.first_timestamp = self.seen.first().copied();
        self.last_timestamp = self.seen.last().copied();
        self.missing_seconds = match (self.first_timestamp, self.last_timestamp) {
            (Some(first), Some(last)) => (last - first + 1) as u64 - self.seen.len() as u64,
            _ => 0,
        };
    }

    fn coverage(&self, field: &str) -> f64 {
        if self.rows == 0 {
            return 0.0;
        }
        self.field_rows.get(field).copied().unwrap_or(0) as f64 / self.rows as f64
    }
}

fn collect_files(dir: &Path, suffix: &str, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, suffix, out)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(suffix))
        {
            out.push(path);
        }
    }
    Ok(())
}

fn inspect(data_dir: &Path, name: &str) -> Result<InspectReport> {
    let mut files = Vec::new();
    collect_files(data_dir, &format!("_{name}"), &mut files)?;
    // YYYY/MM/DD/HH/MM layout sorts chronologically
    files.sort();

    let mut report = InspectReport {
        files: files.len(),
        ..Default::default()
    };
    for path in &files {
        let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
        for line in BufReader::new(file).lines() {
            match line {
                Ok(line) => report.observe_line(&line),
                Err(_) => report.malformed_lines += 1,
            }
        }
    }
    report.finish();
    Ok(report)
}

fn print_report(report: &InspectReport, data_dir: &Path, name: &str) {
    println!("=== {} under {} ===\n", name, data_dir.display());
    println!("Files:                {}", report.files);
    println!("Rows:                 {}", report.rows);
    println!("Malformed lines:      {}", report.malformed_lines);
    match (report.first_timestamp, report.last_timestamp) {
        (Some(first), Some(last)) => {
            println!("First timestamp:      {} ({})", first, fmt_ts(first));
            println!("Last timestamp:       {} ({})", last, fmt_ts(last));
            println!("Span:                 {}s", last - first + 1);
        }
        _ => println!("Time range:           (empty)"),
    }
    println!("Duplicate timestamps: {}", report.duplicate_timestamps);
    println!("Out of order rows:    {}", report.out_of_order);
    println!("Missing seconds:      {}", report.missing_seconds);

    if !report.field_rows.is_empty() {
        println!("\n=== Field coverage ===\n");
        for field in report.field_rows.keys() {
            println!("{:<32} {:>6.1}%", field, report.coverage(field) * 100.0);
        }
    }
}

fn fmt_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "invalid".to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let report = inspect(&cli.data_dir, &cli.name)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, &cli.data_dir, &cli.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts_gaps_duplicates_and_coverage() {
        let mut r = InspectReport::default();
        r.observe_line(r#"{"obi":0.1,"timestamp":10}"#);
        r.observe_line(r#"{"obi":0.2,"z_bid_liq":1.0,"timestamp":11}"#);
        r.observe_line(r#"{"obi":0.3,"timestamp":14}"#);
        r.observe_line(r#"{"obi":0.3,"timestamp":14}"#);
        r.observe_line(r#"{"obi":0.3,"timestamp":12}"#);
        r.observe_line("garbage");
        r.observe_line(r#"{"obi":0.3}"#);
        r.observe_line("");
        r.finish();

        assert_eq!(r.rows, 5);
        assert_eq!(r.malformed_lines, 2);
        assert_eq!(r.first_timestamp, Some(10));
        assert_eq!(r.last_timestamp, Some(14));
        assert_eq!(r.duplicate_timestamps, 1);
        assert_eq!(r.out_of_order, 1);
        assert_eq!(r.missing_seconds, 1, "only 13 is absent");
        assert_eq!(r.coverage("obi"), 1.0);
        assert!((r.coverage("z_bid_liq") - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_inspect_walks_rotated_tree() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("2026/01/29/10");
        fs::create_dir_all(&a).unwrap();
        fs::write(a.join("30_combined_data.jsonl"), "{\"timestamp\":1}\n{\"timestamp\":2}\n").unwrap();
        fs::write(a.join("45_combined_data.jsonl"), "{\"timestamp\":3}\n").unwrap();
        fs::write(a.join("45_l2.jsonl"), "{\"ts\":3}\n").unwrap();

        let report = inspect(dir.path(), "combined_data.jsonl").unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.rows, 3);
        assert_eq!(report.missing_seconds, 0);
    }
}
