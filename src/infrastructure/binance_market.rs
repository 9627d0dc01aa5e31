//! Binance USD-M futures market data
//!
//! REST bootstrap of the tradable symbol set with their prices, depth
//! snapshots for order book resynchronisation, and the combined WebSocket
//! stream carrying tickers, mark prices and depth diffs.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::domain::entities::order_book::{DepthSnapshot, DepthUpdate, PriceLevel};
use crate::domain::errors::MarketDataError;
use crate::domain::repositories::market_data::{DepthSnapshotSource, FeedEvent};
use crate::domain::services::exchange_info_store::{PriceTicker, SymbolInfo};

pub const BINANCE_FUTURES_REST_URL: &str = "https://fapi.binance.com";
pub const BINANCE_FUTURES_WS_URL: &str = "wss://fstream.binance.com/stream";

const REQUEST_TIMEOUT_SECS: u64 = 10;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const PING_INTERVAL_SECS: u64 = 30;
const MAX_RECONNECT_DELAY_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfoResponse {
    symbols: Vec<RawSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSymbol {
    symbol: String,
    status: String,
    #[serde(default)]
    contract_type: String,
    price_precision: u32,
    quantity_precision: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPremiumIndex {
    symbol: String,
    mark_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawTickerPrice {
    symbol: String,
    price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDepth {
    last_update_id: u64,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    stream: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
struct StreamTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    close: Decimal,
}

#[derive(Debug, Deserialize)]
struct StreamMarkPrice {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    mark_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct StreamDepth {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "pu", default)]
    previous_final_update_id: Option<u64>,
    #[serde(rename = "b")]
    bids: Vec<PriceLevel>,
    #[serde(rename = "a")]
    asks: Vec<PriceLevel>,
}

/// Decodes one combined-stream frame into feed events.
///
/// Frames from streams the feed does not consume decode to no events.
pub fn parse_stream_message(text: &str) -> Result<Vec<FeedEvent>, MarketDataError> {
    let envelope: StreamEnvelope = serde_json::from_str(text)?;
    let stream = envelope.stream.as_str();

    if stream == "!ticker@arr" {
        let tickers: Vec<StreamTicker> = serde_json::from_value(envelope.data)?;
        return Ok(tickers
            .into_iter()
            .map(|t| FeedEvent::Ticker {
                symbol: t.symbol,
                price: t.close,
            })
            .collect());
    }

    if stream.starts_with("!markPrice@arr") {
        let marks: Vec<StreamMarkPrice> = serde_json::from_value(envelope.data)?;
        return Ok(marks
            .into_iter()
            .map(|m| FeedEvent::MarkPrice {
                symbol: m.symbol,
                price: m.mark_price,
            })
            .collect());
    }

    if stream.contains("@depth") {
        let depth: StreamDepth = serde_json::from_value(envelope.data)?;
        return Ok(vec![FeedEvent::Depth {
            symbol: depth.symbol,
            update: DepthUpdate {
                first_update_id: depth.first_update_id,
                final_update_id: depth.final_update_id,
                previous_final_update_id: depth.previous_final_update_id,
                bids: depth.bids,
                asks: depth.asks,
            },
        }]);
    }

    debug!("Ignoring frame from stream {}", stream);
    Ok(Vec::new())
}

/// Stream names for the combined WebSocket
pub fn stream_names(depth_symbols: &[String]) -> Vec<String> {
    let mut streams = vec!["!ticker@arr".to_string(), "!markPrice@arr@1s".to_string()];
    streams.extend(
        depth_symbols
            .iter()
            .map(|s| format!("{}@depth@500ms", s.to_lowercase())),
    );
    streams
}

pub struct BinanceFuturesClient {
    client: Client,
    rest_url: String,
    ws_url: String,
}

impl BinanceFuturesClient {
    pub fn new() -> Result<Self, MarketDataError> {
        Self::with_endpoints(BINANCE_FUTURES_REST_URL, BINANCE_FUTURES_WS_URL)
    }

    pub fn with_endpoints(rest_url: &str, ws_url: &str) -> Result<Self, MarketDataError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            rest_url: rest_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.to_string(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, MarketDataError> {
        let response = self
            .client
            .get(format!("{}{}", self.rest_url, path))
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    /// Tradable perpetual symbols with their last and mark prices.
    ///
    /// Symbols without a positive price on both feeds are left out.
    pub async fn load_exchange_info(&self) -> Result<Vec<SymbolInfo>, MarketDataError> {
        let info: ExchangeInfoResponse = self.get("/fapi/v1/exchangeInfo", &[]).await?;
        let marks: Vec<RawPremiumIndex> = self.get("/fapi/v1/premiumIndex", &[]).await?;
        let lasts: Vec<RawTickerPrice> = self.get("/fapi/v1/ticker/price", &[]).await?;

        let marks: HashMap<String, Decimal> =
            marks.into_iter().map(|m| (m.symbol, m.mark_price)).collect();
        let lasts: HashMap<String, Decimal> =
            lasts.into_iter().map(|t| (t.symbol, t.price)).collect();

        let symbols: Vec<SymbolInfo> = info
            .symbols
            .into_iter()
            .filter(|s| s.status == "TRADING" && s.contract_type == "PERPETUAL")
            .filter_map(|s| {
                let mark = marks.get(&s.symbol).copied().filter(|p| *p > Decimal::ZERO)?;
                let last = lasts.get(&s.symbol).copied().filter(|p| *p > Decimal::ZERO)?;
                Some(
                    SymbolInfo::new(s.symbol, s.price_precision, s.quantity_precision).with_prices(
                        PriceTicker {
                            last_price: Some(last),
                            mark_price: Some(mark),
                        },
                    ),
                )
            })
            .collect();

        info!("Loaded {} Binance futures symbols", symbols.len());
        Ok(symbols)
    }

    /// Streams feed events into `events` until shutdown, reconnecting with
    /// a capped backoff whenever the socket drops.
    pub async fn run_stream(
        &self,
        depth_symbols: Vec<String>,
        events: mpsc::Sender<FeedEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let streams = stream_names(&depth_symbols);
        let mut attempt: u32 = 0;

        info!(
            "Starting Binance futures stream ({} depth symbols)",
            depth_symbols.len()
        );

        loop {
            if *shutdown.borrow() || events.is_closed() {
                break;
            }

            match self.connect_and_stream(&streams, &events, &mut shutdown).await {
                Ok(()) => {
                    attempt = 0;
                    if *shutdown.borrow() || events.is_closed() {
                        break;
                    }
                    info!("Binance stream closed by server");
                }
                Err(e) => {
                    attempt += 1;
                    error!("Binance stream error (attempt {}): {}", attempt, e);
                }
            }

            let delay = Duration::from_secs(u64::from(attempt.clamp(1, 10)))
                .min(Duration::from_secs(MAX_RECONNECT_DELAY_SECS));
            info!("Reconnecting Binance stream in {:?}", delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Binance futures stream stopped");
    }

    async fn connect_and_stream(
        &self,
        streams: &[String],
        events: &mpsc::Sender<FeedEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), MarketDataError> {
        let url = Url::parse(&format!("{}?streams={}", self.ws_url, streams.join("/")))
            .map_err(|e| MarketDataError::InvalidEndpoint(e.to_string()))?;

        let (ws_stream, _) = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            connect_async(url.as_str()),
        )
        .await
        .map_err(|_| MarketDataError::ConnectionTimeout)??;

        info!("Connected to Binance stream ({} streams)", streams.len());

        let (mut write, mut read) = ws_stream.split();
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => match parse_stream_message(&text) {
                        Ok(decoded) => {
                            for event in decoded {
                                if events.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Err(e) => warn!("Dropping undecodable frame: {}", e),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                },
                _ = ping_interval.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                    debug!("Sent ping");
                }
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl DepthSnapshotSource for BinanceFuturesClient {
    async fn fetch_depth(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot, MarketDataError> {
        let depth: RawDepth = self
            .get(
                "/fapi/v1/depth",
                &[("symbol", symbol.to_string()), ("limit", limit.to_string())],
            )
            .await?;

        debug!(
            "Fetched {} depth snapshot {} ({} bids, {} asks)",
            symbol,
            depth.last_update_id,
            depth.bids.len(),
            depth.asks.len()
        );

        Ok(DepthSnapshot {
            last_update_id: depth.last_update_id,
            bids: depth.bids,
            asks: depth.asks,
        })
    }
}
