//! Market Data Types
//!
//! Canonical, transport-agnostic representation of the data this crate
//! delivers: tickers, candles and order-book snapshots, plus the topic
//! addressing scheme used by subscriptions, caching and stream routing.
//!
//! # Topic Strings
//!
//! ```text
//! BTCUSDT:ticker      24h rolling ticker (alias: BTCUSDT:24hr)
//! BTCUSDT:kline_1m    candles at a given interval
//! BTCUSDT:depth20     top-N order book snapshot (5, 10 or 20 levels)
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

// =============================================================================
// Addressing
// =============================================================================

/// Exchange symbol, normalised to upper case (e.g. `BTCUSDT`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Create a symbol, normalising case.
    ///
    /// # Errors
    ///
    /// Returns `FeedError::InvalidTopic` for empty or non-alphanumeric input.
    pub fn new(raw: &str) -> Result<Self, FeedError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(FeedError::InvalidTopic(format!("invalid symbol: {raw:?}")));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// The upper-case symbol.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Candle interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    /// 1 minute.
    OneMinute,
    /// 5 minutes.
    FiveMinutes,
    /// 15 minutes.
    FifteenMinutes,
    /// 1 hour.
    OneHour,
    /// 4 hours.
    FourHours,
    /// 1 day.
    OneDay,
    /// 1 week.
    OneWeek,
}

impl Interval {
    /// Wire representation (`1m`, `1h`, ...).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
            Self::OneWeek => "1w",
        }
    }
}

impl FromStr for Interval {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Self::OneMinute),
            "5m" => Ok(Self::FiveMinutes),
            "15m" => Ok(Self::FifteenMinutes),
            "1h" => Ok(Self::OneHour),
            "4h" => Ok(Self::FourHours),
            "1d" => Ok(Self::OneDay),
            "1w" => Ok(Self::OneWeek),
            other => Err(FeedError::InvalidTopic(format!("unknown interval: {other}"))),
        }
    }
}

/// Order book depths the exchange publishes as partial snapshots.
pub const SUPPORTED_DEPTHS: [u16; 3] = [5, 10, 20];

/// The kind of data carried on a topic, with its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    /// 24h rolling ticker.
    Ticker,
    /// Candles at the given interval.
    Candles(Interval),
    /// Top-N order book snapshot.
    OrderBook {
        /// Number of price levels per side.
        depth: u16,
    },
}

impl Channel {
    /// The channel kind (one physical stream connection per kind).
    #[must_use]
    pub const fn kind(self) -> ChannelKind {
        match self {
            Self::Ticker => ChannelKind::Ticker,
            Self::Candles(_) => ChannelKind::Candles,
            Self::OrderBook { .. } => ChannelKind::OrderBook,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ticker => f.write_str("ticker"),
            Self::Candles(interval) => write!(f, "kline_{}", interval.as_str()),
            Self::OrderBook { depth } => write!(f, "depth{depth}"),
        }
    }
}

impl FromStr for Channel {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if lower == "ticker" || lower == "24hr" {
            return Ok(Self::Ticker);
        }
        if let Some(interval) = lower.strip_prefix("kline_") {
            return Ok(Self::Candles(interval.parse()?));
        }
        if let Some(depth) = lower.strip_prefix("depth") {
            let depth: u16 = depth
                .parse()
                .map_err(|_| FeedError::InvalidTopic(format!("invalid depth: {s}")))?;
            if !SUPPORTED_DEPTHS.contains(&depth) {
                return Err(FeedError::InvalidTopic(format!(
                    "unsupported depth {depth}, expected one of {SUPPORTED_DEPTHS:?}"
                )));
            }
            return Ok(Self::OrderBook { depth });
        }
        Err(FeedError::InvalidTopic(format!("unknown channel: {s}")))
    }
}

/// Channel kind, the unit of connection management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Ticker streams.
    Ticker,
    /// Candle streams.
    Candles,
    /// Order book streams.
    OrderBook,
}

impl ChannelKind {
    /// All channel kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Ticker, Self::Candles, Self::OrderBook]
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Candles => "candles",
            Self::OrderBook => "order_book",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical data feed: one channel for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic {
    /// Exchange symbol.
    pub symbol: Symbol,
    /// Data channel.
    pub channel: Channel,
}

impl Topic {
    /// Create a topic.
    #[must_use]
    pub const fn new(symbol: Symbol, channel: Channel) -> Self {
        Self { symbol, channel }
    }

    /// Ticker topic for a symbol.
    ///
    /// # Errors
    ///
    /// Returns an error if the symbol is invalid.
    pub fn ticker(symbol: &str) -> Result<Self, FeedError> {
        Ok(Self::new(Symbol::new(symbol)?, Channel::Ticker))
    }

    /// Candle topic for a symbol and interval.
    ///
    /// # Errors
    ///
    /// Returns an error if the symbol is invalid.
    pub fn candles(symbol: &str, interval: Interval) -> Result<Self, FeedError> {
        Ok(Self::new(Symbol::new(symbol)?, Channel::Candles(interval)))
    }

    /// Channel kind this topic is multiplexed on.
    #[must_use]
    pub const fn kind(&self) -> ChannelKind {
        self.channel.kind()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.channel)
    }
}

impl FromStr for Topic {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (symbol, channel) = s
            .split_once(':')
            .ok_or_else(|| FeedError::InvalidTopic(format!("expected SYMBOL:channel, got {s:?}")))?;
        Ok(Self::new(Symbol::new(symbol)?, channel.parse()?))
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// 24h rolling ticker statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    /// Symbol.
    pub symbol: Symbol,
    /// Last traded price.
    pub last_price: Decimal,
    /// Open price 24h ago.
    pub open_price: Decimal,
    /// 24h high.
    pub high_price: Decimal,
    /// 24h low.
    pub low_price: Decimal,
    /// 24h base asset volume.
    pub volume: Decimal,
    /// 24h quote asset volume.
    pub quote_volume: Decimal,
    /// Absolute 24h price change.
    pub price_change: Decimal,
    /// 24h price change in percent.
    pub price_change_percent: Decimal,
    /// Exchange timestamp of the statistics.
    pub event_time: DateTime<Utc>,
}

/// OHLCV candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Candle open time.
    pub open_time: DateTime<Utc>,
    /// Candle close time.
    pub close_time: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close (or latest) price.
    pub close: Decimal,
    /// Base asset volume.
    pub volume: Decimal,
    /// Whether the candle is final.
    pub is_closed: bool,
}

/// One price level of an order book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Price.
    pub price: Decimal,
    /// Quantity at this price.
    pub quantity: Decimal,
}

/// Order book snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBook {
    /// Exchange sequence number of the snapshot.
    pub last_update_id: u64,
    /// Bids, best first.
    pub bids: Vec<PriceLevel>,
    /// Asks, best first.
    pub asks: Vec<PriceLevel>,
}

impl OrderBook {
    /// Best bid price, if any.
    #[must_use]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Best ask price, if any.
    #[must_use]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }
}

/// Market data payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketData {
    /// Ticker statistics.
    Ticker(Ticker),
    /// Candles, oldest first. Streams deliver one candle per update.
    Candles(Vec<Candle>),
    /// Order book snapshot.
    OrderBook(OrderBook),
}

/// Where an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateSource {
    /// Live streaming connection.
    Stream,
    /// REST fallback polling.
    Poll,
}

/// A market data update for one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketUpdate {
    /// Topic the update belongs to.
    pub topic: Topic,
    /// Transport that produced it.
    pub source: UpdateSource,
    /// Payload.
    pub data: MarketData,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
}

/// Event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// Fresh data.
    Update(MarketUpdate),
    /// A fallback poll failed after retries; data may be stale.
    Error {
        /// Topic the failure applies to.
        topic: Topic,
        /// Failure.
        error: FeedError,
    },
}

impl FeedEvent {
    /// Topic of the event.
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        match self {
            Self::Update(update) => &update.topic,
            Self::Error { topic, .. } => topic,
        }
    }
}
