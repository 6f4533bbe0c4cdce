//! Binance Wire Message Types
//!
//! Wire format types for the spot market-data REST endpoints and the
//! combined WebSocket streams, with conversions into the domain types.
//!
//! # Message Types
//!
//! ## Streams (`/stream?streams=...`)
//! - `StreamEnvelope`: `{"stream": "...", "data": {...}}` wrapper
//! - `TickerEvent`: `<symbol>@ticker` 24h rolling statistics
//! - `KlineEvent`: `<symbol>@kline_<interval>` candle updates
//! - `DepthSnapshot`: `<symbol>@depth<N>@100ms` partial book (also the REST body)
//! - `StreamResponse`: acknowledgement of a `SUBSCRIBE`/`UNSUBSCRIBE` request
//!
//! ## REST (`/api/v3/...`)
//! - `RestTicker`: `ticker/24hr` body
//! - `RestKline`: one row of the `klines` array
//! - `ApiErrorBody`: `{"code": -1121, "msg": "Invalid symbol."}`
//!
//! # References
//!
//! - [Market Data Endpoints](https://developers.binance.com/docs/binance-spot-api-docs/rest-api/market-data-endpoints)
//! - [WebSocket Streams](https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};

use super::codec::CodecError;
use crate::domain::market::{Candle, OrderBook, PriceLevel, Symbol, Ticker};

/// Convert exchange epoch milliseconds to UTC.
///
/// # Errors
///
/// Returns `CodecError::InvalidTimestamp` for out-of-range values.
pub fn millis_to_utc(millis: i64) -> Result<DateTime<Utc>, CodecError> {
    DateTime::from_timestamp_millis(millis).ok_or(CodecError::InvalidTimestamp(millis))
}

fn symbol(raw: &str) -> Result<Symbol, CodecError> {
    Symbol::new(raw).map_err(|e| CodecError::InvalidFormat(e.to_string()))
}

// =============================================================================
// Stream Control
// =============================================================================

/// Combined stream wrapper.
///
/// # Wire Format (JSON)
/// ```json
/// {"stream": "btcusdt@ticker", "data": {"e": "24hrTicker", ...}}
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamEnvelope {
    /// Stream name.
    pub stream: String,
    /// Stream payload.
    pub data: serde_json::Value,
}

/// Live subscription request.
///
/// # Wire Format (JSON)
/// ```json
/// {"method": "SUBSCRIBE", "params": ["btcusdt@ticker"], "id": 1}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamRequest {
    /// `SUBSCRIBE` or `UNSUBSCRIBE`.
    pub method: StreamMethod,
    /// Stream names.
    pub params: Vec<String>,
    /// Request identifier echoed in the response.
    pub id: u64,
}

/// Live subscription method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamMethod {
    /// Add streams.
    Subscribe,
    /// Remove streams.
    Unsubscribe,
}

/// Response to a `StreamRequest`.
///
/// # Wire Format (JSON)
/// ```json
/// {"result": null, "id": 1}
/// {"error": {"code": 2, "msg": "Invalid request"}, "id": 1}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamResponse {
    /// Request identifier.
    pub id: Option<u64>,
    /// Present when the request was rejected.
    #[serde(default)]
    pub error: Option<ApiErrorBody>,
}

// =============================================================================
// Stream Payloads
// =============================================================================

/// 24h rolling ticker stream event.
///
/// # Wire Format (JSON, abridged)
/// ```json
/// {"e":"24hrTicker","E":1672515782136,"s":"BTCUSDT","p":"120.5","P":"0.73",
///  "c":"16620.1","o":"16499.6","h":"16700.0","l":"16450.2","v":"2540.1","q":"42131210.7"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TickerEvent {
    /// Event time (ms).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Price change.
    #[serde(rename = "p")]
    pub price_change: Decimal,
    /// Price change percent.
    #[serde(rename = "P")]
    pub price_change_percent: Decimal,
    /// Last price.
    #[serde(rename = "c")]
    pub last_price: Decimal,
    /// Open price.
    #[serde(rename = "o")]
    pub open_price: Decimal,
    /// High price.
    #[serde(rename = "h")]
    pub high_price: Decimal,
    /// Low price.
    #[serde(rename = "l")]
    pub low_price: Decimal,
    /// Base asset volume.
    #[serde(rename = "v")]
    pub volume: Decimal,
    /// Quote asset volume.
    #[serde(rename = "q")]
    pub quote_volume: Decimal,
}

impl TryFrom<TickerEvent> for Ticker {
    type Error = CodecError;

    fn try_from(event: TickerEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            symbol: symbol(&event.symbol)?,
            last_price: event.last_price,
            open_price: event.open_price,
            high_price: event.high_price,
            low_price: event.low_price,
            volume: event.volume,
            quote_volume: event.quote_volume,
            price_change: event.price_change,
            price_change_percent: event.price_change_percent,
            event_time: millis_to_utc(event.event_time)?,
        })
    }
}

/// Kline stream event.
///
/// # Wire Format (JSON, abridged)
/// ```json
/// {"e":"kline","E":1672515782136,"s":"BTCUSDT",
///  "k":{"t":1672515780000,"T":1672515839999,"i":"1m","o":"16620.1","c":"16621.0",
///       "h":"16622.5","l":"16619.8","v":"12.3","x":false}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KlineEvent {
    /// Event time (ms).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Candle.
    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

/// Candle inside a `KlineEvent`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KlinePayload {
    /// Open time (ms).
    #[serde(rename = "t")]
    pub open_time: i64,
    /// Close time (ms).
    #[serde(rename = "T")]
    pub close_time: i64,
    /// Interval.
    #[serde(rename = "i")]
    pub interval: String,
    /// Open price.
    #[serde(rename = "o")]
    pub open: Decimal,
    /// Close price.
    #[serde(rename = "c")]
    pub close: Decimal,
    /// High price.
    #[serde(rename = "h")]
    pub high: Decimal,
    /// Low price.
    #[serde(rename = "l")]
    pub low: Decimal,
    /// Base asset volume.
    #[serde(rename = "v")]
    pub volume: Decimal,
    /// Whether the candle is closed.
    #[serde(rename = "x")]
    pub is_closed: bool,
}

impl TryFrom<KlinePayload> for Candle {
    type Error = CodecError;

    fn try_from(k: KlinePayload) -> Result<Self, Self::Error> {
        Ok(Self {
            open_time: millis_to_utc(k.open_time)?,
            close_time: millis_to_utc(k.close_time)?,
            open: k.open,
            high: k.high,
            low: k.low,
            close: k.close,
            volume: k.volume,
            is_closed: k.is_closed,
        })
    }
}

/// `[price, quantity]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct WireLevel(pub Decimal, pub Decimal);

/// Order book snapshot (partial depth stream and REST `depth`).
///
/// # Wire Format (JSON)
/// ```json
/// {"lastUpdateId":160,"bids":[["0.0024","10"]],"asks":[["0.0026","100"]]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthSnapshot {
    /// Book sequence number.
    pub last_update_id: u64,
    /// Bids, best first.
    pub bids: Vec<WireLevel>,
    /// Asks, best first.
    pub asks: Vec<WireLevel>,
}

impl From<DepthSnapshot> for OrderBook {
    fn from(snapshot: DepthSnapshot) -> Self {
        let levels = |side: Vec<WireLevel>| {
            side.into_iter()
                .map(|WireLevel(price, quantity)| PriceLevel { price, quantity })
                .collect()
        };
        Self {
            last_update_id: snapshot.last_update_id,
            bids: levels(snapshot.bids),
            asks: levels(snapshot.asks),
        }
    }
}

// =============================================================================
// REST Payloads
// =============================================================================

/// `GET /api/v3/ticker/24hr` body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestTicker {
    /// Symbol.
    pub symbol: String,
    /// Price change.
    pub price_change: Decimal,
    /// Price change percent.
    pub price_change_percent: Decimal,
    /// Last price.
    pub last_price: Decimal,
    /// Open price.
    pub open_price: Decimal,
    /// High price.
    pub high_price: Decimal,
    /// Low price.
    pub low_price: Decimal,
    /// Base asset volume.
    pub volume: Decimal,
    /// Quote asset volume.
    pub quote_volume: Decimal,
    /// Statistics close time (ms).
    pub close_time: i64,
}

impl TryFrom<RestTicker> for Ticker {
    type Error = CodecError;

    fn try_from(t: RestTicker) -> Result<Self, Self::Error> {
        Ok(Self {
            symbol: symbol(&t.symbol)?,
            last_price: t.last_price,
            open_price: t.open_price,
            high_price: t.high_price,
            low_price: t.low_price,
            volume: t.volume,
            quote_volume: t.quote_volume,
            price_change: t.price_change,
            price_change_percent: t.price_change_percent,
            event_time: millis_to_utc(t.close_time)?,
        })
    }
}

/// One `GET /api/v3/klines` row.
///
/// `[openTime, open, high, low, close, volume, closeTime, quoteVolume,
/// trades, takerBase, takerQuote, ignore]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RestKline(
    pub i64,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub i64,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
);

impl RestKline {
    /// Convert to a candle. Rows whose close time has passed `now` are final.
    ///
    /// # Errors
    ///
    /// Returns an error for out-of-range timestamps.
    pub fn into_candle(self, now: DateTime<Utc>) -> Result<Candle, CodecError> {
        let close_time = millis_to_utc(self.6)?;
        Ok(Candle {
            open_time: millis_to_utc(self.0)?,
            close_time,
            open: self.1,
            high: self.2,
            low: self.3,
            close: self.4,
            volume: self.5,
            is_closed: close_time < now,
        })
    }
}

/// Error body returned with non-success statuses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiErrorBody {
    /// Application error code.
    pub code: i64,
    /// Description.
    pub msg: String,
}
