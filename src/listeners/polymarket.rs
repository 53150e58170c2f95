//! Polymarket CLOB market channel: best bid/ask per outcome of the current
//! up/down candle market.
//!
//! The market rolls every candle, so the listener re-resolves token ids from
//! the Gamma API and reconnects one second after each candle boundary.

use anyhow::{ensure, Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{sleep_or_shutdown, value_f64, Backoff, ListenerStats};
use crate::sink::candle_start;
use crate::types::{ExternalQuote, Fields};

const PING_INTERVAL: Duration = Duration::from_secs(10);
const GAMMA_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Deserialize)]
pub struct GammaMarket {
    pub slug: String,
    #[serde(deserialize_with = "de_string_vec")]
    pub outcomes: Vec<String>,
    #[serde(rename = "clobTokenIds", deserialize_with = "de_string_vec")]
    pub clob_token_ids: Vec<String>,
}

fn de_string_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Array(arr) => Ok(arr
            .into_iter()
            .filter_map(|x| match x {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()),
        // Gamma usually returns these arrays JSON-encoded inside a string.
        Value::String(s) => serde_json::from_str::<Vec<String>>(&s).map_err(serde::de::Error::custom),
        _ => Ok(Vec::new()),
    }
}

pub fn market_slug(prefix: &str, candle_start: i64) -> String {
    format!("{prefix}-{candle_start}")
}

/// Token id -> lower-cased outcome for one candle market.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketAssets {
    pub slug: String,
    pub candle_start: i64,
    by_asset: HashMap<String, String>,
}

impl MarketAssets {
    pub fn from_market(market: &GammaMarket, candle_start: i64) -> Result<Self> {
        ensure!(
            market.outcomes.len() == market.clob_token_ids.len(),
            "market {} has {} outcomes but {} token ids",
            market.slug,
            market.outcomes.len(),
            market.clob_token_ids.len()
        );
        ensure!(!market.outcomes.is_empty(), "market {} has no outcomes", market.slug);

        let by_asset = market
            .clob_token_ids
            .iter()
            .zip(&market.outcomes)
            .map(|(token, outcome)| (token.clone(), outcome.to_lowercase()))
            .collect();

        Ok(Self {
            slug: market.slug.clone(),
            candle_start,
            by_asset,
        })
    }

    pub fn outcome(&self, asset_id: &str) -> Option<&str> {
        self.by_asset.get(asset_id).map(String::as_str)
    }

    pub fn asset_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.by_asset.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subscribe_message(&self) -> String {
        serde_json::json!({
            "type": "market",
            "assets_ids": self.asset_ids(),
            "custom_feature_enabled": true,
        })
        .to_string()
    }
}

pub async fn resolve_market(
    http: &reqwest::Client,
    gamma_markets_url: &str,
    slug: &str,
) -> Result<GammaMarket> {
    let url = format!("{}/{}", gamma_markets_url.trim_end_matches('/'), slug);
    let response = http
        .get(&url)
        .timeout(GAMMA_TIMEOUT)
        .send()
        .await
        .context("gamma market request failed")?
        .error_for_status()
        .context("gamma market status")?;

    let body = response.text().await.context("gamma market text")?;
    debug!(slug, body_len = body.len(), "gamma API response received");

    serde_json::from_str(&body)
        .map_err(|e| {
            warn!(slug, error = %e, body_preview = %body.chars().take(300).collect::<String>(), "gamma JSON parse failed");
            e
        })
        .context("gamma market json parse")
}

/// `best_bid_ask` events -> external quotes stamped with local receive time.
#[derive(Debug, Clone)]
pub struct QuoteDecoder {
    assets: MarketAssets,
}

impl QuoteDecoder {
    pub fn new(assets: MarketAssets) -> Self {
        Self { assets }
    }

    pub fn decode_at(&self, text: &str, now: i64, stats: &ListenerStats) -> Vec<ExternalQuote> {
        if text.eq_ignore_ascii_case("PONG") {
            return Vec::new();
        }
        let json: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                return Vec::new();
            }
        };

        // events arrive either singly or batched in an array
        match json {
            Value::Array(events) => events
                .iter()
                .filter_map(|e| self.decode_event(e, now))
                .collect(),
            event => self.decode_event(&event, now).into_iter().collect(),
        }
    }

    fn decode_event(&self, event: &Value, now: i64) -> Option<ExternalQuote> {
        if event.get("event_type").and_then(Value::as_str) != Some("best_bid_ask") {
            return None;
        }
        let asset_id = event.get("asset_id").and_then(Value::as_str)?;
        let Some(outcome) = self.assets.outcome(asset_id) else {
            debug!(asset_id, "best_bid_ask for unknown asset");
            return None;
        };
        let best_bid = value_f64(event.get("best_bid"))?;
        let best_ask = value_f64(event.get("best_ask"))?;

        let mut fields = Fields::new();
        fields.insert(format!("{outcome}_best_bid"), best_bid);
        fields.insert(format!("{outcome}_best_ask"), best_ask);
        Some(ExternalQuote { ts: now, fields })
    }
}

#[derive(Debug, Clone)]
pub struct PolymarketSettings {
    pub ws_url: String,
    pub gamma_markets_url: String,
    pub slug_prefix: String,
    pub rotation_minutes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarketSessionEnd {
    /// Candle boundary passed; resolve the next market.
    Rollover,
    Closed,
    Stop,
}

/// Follow the current candle market until shutdown.
pub async fn run_polymarket(
    settings: PolymarketSettings,
    tx: mpsc::Sender<ExternalQuote>,
    stats: Arc<ListenerStats>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("btc-feature-collector/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("build http client")?;
    let width = i64::from(settings.rotation_minutes.max(1)) * 60;
    let mut backoff = Backoff::default();

    'markets: loop {
        if *shutdown.borrow() {
            break;
        }

        let candle = candle_start(Utc::now().timestamp(), settings.rotation_minutes);
        let slug = market_slug(&settings.slug_prefix, candle);
        let assets = match resolve_market(&http, &settings.gamma_markets_url, &slug)
            .await
            .and_then(|m| MarketAssets::from_market(&m, candle))
        {
            Ok(assets) => assets,
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(slug = %slug, error = %format!("{e:#}"), ?delay, "polymarket market lookup failed");
                if !sleep_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };
        info!(slug = %assets.slug, assets = ?assets.by_asset, "polymarket market resolved");

        let reconnect_at = candle + width + 1;
        let decoder = QuoteDecoder::new(assets);

        loop {
            let remaining = reconnect_at - Utc::now().timestamp();
            if remaining <= 0 {
                continue 'markets;
            }
            let deadline = Instant::now() + Duration::from_secs(remaining as u64);

            match market_session(&settings.ws_url, &decoder, &tx, &stats, &mut shutdown, deadline).await {
                Ok(MarketSessionEnd::Stop) => break 'markets,
                Ok(MarketSessionEnd::Rollover) => {
                    backoff.reset();
                    info!(slug = %decoder.assets.slug, "polymarket candle rolled; reconnecting");
                    continue 'markets;
                }
                Ok(MarketSessionEnd::Closed) => {
                    backoff.reset();
                    stats.reconnects.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff.next_delay();
                    warn!(error = %format!("{e:#}"), ?delay, "polymarket WS disconnected; reconnecting");
                    if !sleep_or_shutdown(delay, &mut shutdown).await {
                        break 'markets;
                    }
                }
            }
        }
    }

    info!(stream = "polymarket", "listener stopped");
    Ok(())
}

async fn market_session(
    url: &str,
    decoder: &QuoteDecoder,
    tx: &mpsc::Sender<ExternalQuote>,
    stats: &ListenerStats,
    shutdown: &mut watch::Receiver<bool>,
    deadline: Instant,
) -> Result<MarketSessionEnd> {
    info!("🔌 Connecting to Polymarket market WS");
    let (ws_stream, resp) = connect_async(url)
        .await
        .context("connect polymarket market ws")?;
    info!(status = %resp.status(), "✅ Polymarket market WS connected");

    let (mut write, mut read) = ws_stream.split();
    write
        .send(Message::Text(decoder.assets.subscribe_message()))
        .await
        .context("send market subscription")?;

    let mut ping = interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let rollover = tokio::time::sleep_until(deadline);
    tokio::pin!(rollover);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(MarketSessionEnd::Stop);
            }
            _ = &mut rollover => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(MarketSessionEnd::Rollover);
            }
            _ = ping.tick() => {
                let _ = write.send(Message::Text("PING".to_string())).await;
            }
            ws_msg = read.next() => {
                let Some(ws_msg) = ws_msg else {
                    return Ok(MarketSessionEnd::Closed);
                };
                match ws_msg.context("market ws read")? {
                    Message::Text(text) => {
                        stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        for quote in decoder.decode_at(&text, Utc::now().timestamp(), stats) {
                            if tx.send(quote).await.is_err() {
                                return Ok(MarketSessionEnd::Stop);
                            }
                        }
                    }
                    Message::Ping(payload) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Message::Close(frame) => {
                        debug!(?frame, "market ws close");
                        return Ok(MarketSessionEnd::Closed);
                    }
                    _ => {}
                }
            }
        }
    }
}
