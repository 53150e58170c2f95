//! Exchange stream adapters. Each listener holds one WebSocket session at a
//! time and reconnects with exponential backoff until shutdown. Decoding is
//! kept apart from the socket loop so it can run without a network.

pub mod binance;
pub mod polymarket;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

pub use binance::{DepthDecoder, LocalBook, TradeDecoder};
pub use polymarket::{run_polymarket, MarketAssets, PolymarketSettings, QuoteDecoder};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Lock-free listener counters, read by the stats reporter.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub messages_received: AtomicU64,
    pub parse_errors: AtomicU64,
    pub gaps_total: AtomicU64,
    pub reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerSnapshot {
    pub messages_received: u64,
    pub parse_errors: u64,
    pub gaps_total: u64,
    pub reconnects: u64,
}

impl ListenerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> ListenerSnapshot {
        ListenerSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            gaps_total: self.gaps_total.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Reconnect delay: doubles per failure up to 30 s, reset after a clean session.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            delay: INITIAL_BACKOFF,
        }
    }
}

impl Backoff {
    /// Delay to wait now; the next call waits twice as long.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        self.delay = (self.delay * 2).min(MAX_BACKOFF);
        current
    }

    pub fn reset(&mut self) {
        self.delay = INITIAL_BACKOFF;
    }
}

/// Sleep unless shutdown fires first. Returns `false` on shutdown.
pub(crate) async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

/// Turns text frames of one stream into domain events.
pub trait StreamDecoder: Send {
    type Item: Send;

    /// Called before every (re)connect.
    fn reset(&mut self) {}

    fn decode(&mut self, text: &str, stats: &ListenerStats) -> Vec<Self::Item>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Peer closed or the stream ended; reconnect.
    Closed,
    /// Shutdown signal or downstream receiver dropped; stop for good.
    Stop,
}

/// Connection loop for a plain subscribe-by-URL stream (Binance raw streams).
pub async fn run_stream<D: StreamDecoder>(
    name: &'static str,
    url: String,
    mut decoder: D,
    tx: mpsc::Sender<D::Item>,
    stats: Arc<ListenerStats>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut backoff = Backoff::default();

    loop {
        if *shutdown.borrow() {
            break;
        }
        decoder.reset();

        match stream_session(name, &url, &mut decoder, &tx, &stats, &mut shutdown).await {
            Ok(SessionEnd::Stop) => break,
            Ok(SessionEnd::Closed) => {
                backoff.reset();
                stats.reconnects.fetch_add(1, Ordering::Relaxed);
                info!(stream = name, "stream closed by peer; reconnecting");
            }
            Err(e) => {
                stats.reconnects.fetch_add(1, Ordering::Relaxed);
                let delay = backoff.next_delay();
                warn!(stream = name, error = %format!("{e:#}"), ?delay, "stream disconnected; reconnecting");
                if !sleep_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
            }
        }
    }

    info!(stream = name, "listener stopped");
    Ok(())
}

async fn stream_session<D: StreamDecoder>(
    name: &'static str,
    url: &str,
    decoder: &mut D,
    tx: &mpsc::Sender<D::Item>,
    stats: &ListenerStats,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionEnd> {
    info!(stream = name, url, "connecting");
    let (ws_stream, resp) = connect_async(url)
        .await
        .with_context(|| format!("connect {name}"))?;
    info!(stream = name, status = %resp.status(), "connected");

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionEnd::Stop);
            }
            ws_msg = read.next() => {
                let Some(ws_msg) = ws_msg else {
                    return Ok(SessionEnd::Closed);
                };
                let text = match ws_msg.with_context(|| format!("{name} read"))? {
                    Message::Text(text) => text,
                    Message::Binary(data) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    },
                    Message::Ping(payload) => {
                        let _ = write.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Message::Close(frame) => {
                        debug!(stream = name, ?frame, "close frame");
                        return Ok(SessionEnd::Closed);
                    }
                    _ => continue,
                };

                stats.messages_received.fetch_add(1, Ordering::Relaxed);
                for item in decoder.decode(&text, stats) {
                    if tx.send(item).await.is_err() {
                        return Ok(SessionEnd::Stop);
                    }
                }
            }
        }
    }
}

/// Parse a number that may arrive as a JSON string or a JSON number.
pub(crate) fn value_f64(value: Option<&serde_json::Value>) -> Option<f64> {
    match value? {
        serde_json::Value::String(s) => fast_float::parse(s.as_str()).ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
