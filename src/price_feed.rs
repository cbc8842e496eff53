// =============================================================================
// Price Feed — mark price tracking with REST seed + streaming updates
// =============================================================================
//
// Grounded on the teacher's `market_data::trade_stream` (WebSocket read loop,
// reconnect-from-caller shape) and `binance::client` (signed/unsigned REST
// calls, `parse_str_f64`). Two differences from the teacher:
//   - reconnection backoff is exponential (250ms, doubling, capped at 30s)
//     rather than the teacher's flat 5s retry, per spec.md §4.1.
//   - the REST seed path retries up to 5 times with jitter before the feed
//     is allowed to come up, so `latest()` never serves a reading from
//     before the engine actually observed the market.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PriceTick {
    pub price: f64,
}

struct Reading {
    price: f64,
    updated_at: Instant,
}

/// Tracks the latest mark price per symbol and broadcasts updates to
/// subscribers (the Push Channel forwards these to WebSocket clients).
pub struct PriceFeed {
    symbols: Vec<String>,
    stale_after: Duration,
    readings: RwLock<HashMap<String, Reading>>,
    senders: RwLock<HashMap<String, broadcast::Sender<PriceTick>>>,
}

impl PriceFeed {
    pub fn new(symbols: Vec<String>, stale_after: Duration) -> Self {
        let mut senders = HashMap::new();
        for s in &symbols {
            senders.insert(s.clone(), broadcast::channel(256).0);
        }
        Self {
            symbols,
            stale_after,
            readings: RwLock::new(HashMap::new()),
            senders: RwLock::new(senders),
        }
    }

    pub fn tracked_symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Latest price for `symbol`, or `None` if unknown or stale
    /// (spec.md §4.1 `Latest(symbol)`).
    pub fn latest(&self, symbol: &str) -> Option<f64> {
        let readings = self.readings.read();
        let reading = readings.get(symbol)?;
        if reading.updated_at.elapsed() > self.stale_after {
            return None;
        }
        Some(reading.price)
    }

    pub fn subscribe(&self, symbol: &str) -> Option<broadcast::Receiver<PriceTick>> {
        self.senders.read().get(symbol).map(|tx| tx.subscribe())
    }

    /// Like [`Self::latest`], but never nulls out a reading for being stale —
    /// instead reports the staleness alongside it. The Risk Evaluator needs
    /// this to include a stale position's last known price in equity while
    /// still skipping its SL/TP triggers (spec.md §4.3 step 2).
    pub fn latest_with_staleness(&self, symbol: &str) -> Option<(f64, bool)> {
        let readings = self.readings.read();
        let reading = readings.get(symbol)?;
        Some((reading.price, reading.updated_at.elapsed() > self.stale_after))
    }

    fn update(&self, symbol: &str, price: f64) {
        self.readings.write().insert(
            symbol.to_string(),
            Reading {
                price,
                updated_at: Instant::now(),
            },
        );
        if let Some(tx) = self.senders.read().get(symbol) {
            let _ = tx.send(PriceTick { price });
        }
    }

    /// Seed every tracked symbol from a REST snapshot before streaming
    /// begins, retrying each symbol up to 5 times with jittered backoff.
    pub async fn seed_from_rest(&self, client: &reqwest::Client, base_url: &str) {
        for symbol in &self.symbols {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match fetch_ticker_price(client, base_url, symbol).await {
                    Ok(price) => {
                        self.update(symbol, price);
                        info!(symbol, price, "price feed seeded from REST");
                        break;
                    }
                    Err(e) if attempt >= 5 => {
                        error!(symbol, error = %e, attempt, "REST seed exhausted retries");
                        break;
                    }
                    Err(e) => {
                        let jitter_ms = rand::thread_rng().gen_range(50..200);
                        let backoff = Duration::from_millis(300 * attempt as u64 + jitter_ms);
                        warn!(symbol, error = %e, attempt, ?backoff, "REST seed failed, retrying");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
    }
}

async fn fetch_ticker_price(client: &reqwest::Client, base_url: &str, symbol: &str) -> Result<f64> {
    let url = format!("{base_url}/api/v3/ticker/price?symbol={symbol}");
    let resp = client
        .get(&url)
        .send()
        .await
        .context("GET /api/v3/ticker/price request failed")?;

    let status = resp.status();
    let body: serde_json::Value = resp
        .json()
        .await
        .context("failed to parse ticker/price response")?;

    if !status.is_success() {
        anyhow::bail!("Binance GET /api/v3/ticker/price returned {status}: {body}");
    }

    body["price"]
        .as_str()
        .context("missing field price")?
        .parse::<f64>()
        .context("failed to parse price")
}

/// Stream mark prices for `symbol` until the connection drops, then return
/// so the caller applies the reconnect backoff (spec.md §4.1).
pub async fn run_price_stream(symbol: &str, feed: &Arc<PriceFeed>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://stream.binance.com:9443/ws/{lower}@markPrice@1s");
    info!(url = %url, symbol, "connecting to mark price stream");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to mark price WebSocket")?;

    info!(symbol, "mark price WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_mark_price(&text) {
                        Ok(price) => feed.update(symbol, price),
                        Err(e) => warn!(error = %e, "failed to parse markPrice message"),
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol, error = %e, "mark price WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol, "mark price WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

fn parse_mark_price(text: &str) -> Result<f64> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse markPrice JSON")?;
    root["p"]
        .as_str()
        .context("missing field p")?
        .parse::<f64>()
        .context("failed to parse mark price")
}

/// Drives [`run_price_stream`] forever with exponential backoff capped at
/// 30 seconds, resetting to the floor after each successful connection.
pub async fn run_price_stream_forever(symbol: String, feed: Arc<PriceFeed>) {
    let floor = Duration::from_millis(250);
    let cap = Duration::from_secs(30);
    let mut backoff = floor;

    loop {
        let connected_at = Instant::now();
        if let Err(e) = run_price_stream(&symbol, &feed).await {
            error!(symbol = %symbol, error = %e, "price stream error");
        }

        if connected_at.elapsed() > Duration::from_secs(60) {
            backoff = floor;
        }

        warn!(symbol = %symbol, ?backoff, "reconnecting price stream");
        tokio::time::sleep(backoff).await;
        backoff = std::cmp::min(backoff * 2, cap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_returns_none_when_unknown() {
        let feed = PriceFeed::new(vec!["BTCUSDT".into()], Duration::from_millis(5000));
        assert_eq!(feed.latest("BTCUSDT"), None);
    }

    #[test]
    fn latest_returns_none_when_stale() {
        let feed = PriceFeed::new(vec!["BTCUSDT".into()], Duration::from_millis(0));
        feed.update("BTCUSDT", 100.0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(feed.latest("BTCUSDT"), None);
    }

    #[test]
    fn latest_returns_fresh_reading() {
        let feed = PriceFeed::new(vec!["BTCUSDT".into()], Duration::from_secs(5));
        feed.update("BTCUSDT", 42.0);
        assert_eq!(feed.latest("BTCUSDT"), Some(42.0));
    }

    #[test]
    fn subscribe_receives_updates() {
        let feed = PriceFeed::new(vec!["BTCUSDT".into()], Duration::from_secs(5));
        let mut rx = feed.subscribe("BTCUSDT").unwrap();
        feed.update("BTCUSDT", 10.0);
        let tick = rx.try_recv().unwrap();
        assert_eq!(tick.price, 10.0);
    }

    #[test]
    fn subscribe_unknown_symbol_returns_none() {
        let feed = PriceFeed::new(vec!["BTCUSDT".into()], Duration::from_secs(5));
        assert!(feed.subscribe("ETHUSDT").is_none());
    }
}
