//! BTC feature collector library
//!
//! Per-second order book and trade tape features from Binance, merged with
//! Polymarket up/down quotes and written as rotating JSONL.

pub mod config;
pub mod features;
pub mod listeners;
pub mod logging;
pub mod merge;
pub mod pipeline;
pub mod sink;
pub mod types;

pub use config::CollectorConfig;
pub use merge::{MergeCoordinator, MergeRecord};
