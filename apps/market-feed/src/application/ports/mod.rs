//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `RestTransport`: one-shot REST fetches
//! - `StreamTransport` / `StreamConnection`: multiplexed streaming connections
//! - `Clock`: time source and sleeping, swapped for virtual time in tests

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::market::{Channel, ChannelKind, Interval, MarketData, MarketUpdate, Symbol, Topic};
use crate::error::FeedError;

// =============================================================================
// Clock
// =============================================================================

/// Time source used for TTLs, throttling and backoff sleeps.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Sleep for `duration`.
    async fn sleep(&self, duration: Duration);
}

// =============================================================================
// REST
// =============================================================================

/// REST endpoint family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestEndpoint {
    /// 24h rolling ticker statistics.
    Ticker24h,
    /// Candles.
    Klines,
    /// Order book snapshot.
    Depth,
}

impl RestEndpoint {
    /// Path segment under `/api/v3/`.
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::Ticker24h => "ticker/24hr",
            Self::Klines => "klines",
            Self::Depth => "depth",
        }
    }
}

/// A one-shot REST request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RestRequest {
    /// Endpoint.
    pub endpoint: RestEndpoint,
    /// Symbol.
    pub symbol: Symbol,
    /// Candle interval (klines only).
    pub interval: Option<Interval>,
    /// Result size limit (candle count or book depth).
    pub limit: Option<u16>,
}

impl RestRequest {
    /// REST request that fetches the current state of a topic.
    #[must_use]
    pub fn for_topic(topic: &Topic, candle_limit: u16) -> Self {
        let (endpoint, interval, limit) = match topic.channel {
            Channel::Ticker => (RestEndpoint::Ticker24h, None, None),
            Channel::Candles(interval) => (RestEndpoint::Klines, Some(interval), Some(candle_limit)),
            Channel::OrderBook { depth } => (RestEndpoint::Depth, None, Some(depth)),
        };
        Self {
            endpoint,
            symbol: topic.symbol.clone(),
            interval,
            limit,
        }
    }

    /// Cache key: `{endpoint}:{symbol}:{interval}`.
    ///
    /// Depth requests use the book depth in the last segment so snapshots of
    /// different depths do not alias.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let param = match (self.endpoint, self.interval, self.limit) {
            (_, Some(interval), _) => interval.as_str().to_string(),
            (RestEndpoint::Depth, None, Some(depth)) => depth.to_string(),
            _ => String::new(),
        };
        format!("{}:{}:{}", self.endpoint.path(), self.symbol, param)
    }
}

/// One-shot REST access to market data.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RestTransport: Send + Sync + 'static {
    /// Fetch the data a request describes.
    ///
    /// # Errors
    ///
    /// Returns `FeedError::Http` for non-success responses,
    /// `FeedError::Network` for I/O failures and `FeedError::Malformed`
    /// for undecodable bodies.
    async fn fetch(&self, request: &RestRequest) -> Result<MarketData, FeedError>;
}

// =============================================================================
// Streaming
// =============================================================================

/// Decoded inbound stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Market data for one topic.
    Update(MarketUpdate),
    /// Acknowledgement, unknown stream or other frame with no data.
    Ignored,
    /// Frame that could not be decoded.
    Malformed(String),
    /// Remote end closed the connection.
    Closed {
        /// Close code, when the peer sent one.
        code: Option<u16>,
    },
    /// Transport failure; the connection is unusable.
    Error(FeedError),
}

/// One live multiplexed streaming connection.
#[async_trait]
pub trait StreamConnection: Send {
    /// Add topics to the live connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be sent.
    async fn subscribe(&mut self, topics: &[Topic]) -> Result<(), FeedError>;

    /// Remove topics from the live connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be sent.
    async fn unsubscribe(&mut self, topics: &[Topic]) -> Result<(), FeedError>;

    /// Next inbound frame. Returns `Closed`/`Error` once the connection
    /// ends.
    async fn next_frame(&mut self) -> InboundFrame;

    /// Close the connection (best effort).
    async fn close(&mut self);
}

/// Factory for streaming connections.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Open a connection for a channel kind carrying `topics`.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails.
    async fn connect(
        &self,
        kind: ChannelKind,
        topics: &[Topic],
    ) -> Result<Box<dyn StreamConnection>, FeedError>;
}

// =============================================================================
// Bundle
// =============================================================================

/// The outbound adapters a facade runs on.
#[derive(Clone)]
pub struct Transports {
    /// REST adapter.
    pub rest: Arc<dyn RestTransport>,
    /// Streaming adapter.
    pub stream: Arc<dyn StreamTransport>,
}

impl fmt::Debug for Transports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transports").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("BTCUSDT:ticker", "ticker/24hr:BTCUSDT:" ; "ticker")]
    #[test_case("BTCUSDT:kline_1m", "klines:BTCUSDT:1m" ; "klines")]
    #[test_case("ethusdt:depth10", "depth:ETHUSDT:10" ; "depth")]
    fn cache_key_format(topic: &str, expected: &str) {
        let topic: Topic = topic.parse().unwrap();
        assert_eq!(RestRequest::for_topic(&topic, 500).cache_key(), expected);
    }

    #[test]
    fn klines_request_carries_limit() {
        let topic = Topic::candles("BTCUSDT", Interval::OneHour).unwrap();
        let request = RestRequest::for_topic(&topic, 100);
        assert_eq!(request.endpoint, RestEndpoint::Klines);
        assert_eq!(request.interval, Some(Interval::OneHour));
        assert_eq!(request.limit, Some(100));
    }
}
