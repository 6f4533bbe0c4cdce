//! Stream Codec Module
//!
//! Encoding and decoding for Binance combined streams.
//!
//! - Topic ↔ stream name mapping (`BTCUSDT:depth20` ↔ `btcusdt@depth20@100ms`)
//! - Combined stream URL construction
//! - `SUBSCRIBE` / `UNSUBSCRIBE` request encoding
//! - Inbound frame decoding into domain updates
//!
//! # Inbound Frames
//!
//! ```json
//! {"stream": "btcusdt@kline_1m", "data": {...}}   // market data
//! {"result": null, "id": 4}                       // request acknowledgement
//! {"error": {"code": 2, "msg": "..."}, "id": 4}   // request rejection
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::market::{
    Channel, Interval, MarketData, Symbol, SUPPORTED_DEPTHS, Ticker, Topic,
};
use crate::error::FeedError;

use super::messages::{
    DepthSnapshot, KlineEvent, StreamEnvelope, StreamMethod, StreamRequest, StreamResponse,
    TickerEvent,
};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stream name does not map to a topic.
    #[error("unknown stream: {0}")]
    UnknownStream(String),

    /// Timestamp out of range.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

impl From<CodecError> for FeedError {
    fn from(err: CodecError) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    /// Market data for a topic.
    Data {
        /// Topic derived from the stream name.
        topic: Topic,
        /// Payload.
        data: MarketData,
    },
    /// A live request was acknowledged.
    Ack {
        /// Request identifier.
        id: Option<u64>,
    },
    /// A live request was rejected.
    Rejected {
        /// Request identifier.
        id: Option<u64>,
        /// Error code.
        code: i64,
        /// Error message.
        msg: String,
    },
}

/// JSON codec for combined streams.
#[derive(Debug)]
pub struct StreamCodec {
    next_request_id: AtomicU64,
}

impl Default for StreamCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Stream name for a topic.
    #[must_use]
    pub fn stream_name(topic: &Topic) -> String {
        let symbol = topic.symbol.as_str().to_ascii_lowercase();
        match topic.channel {
            Channel::Ticker => format!("{symbol}@ticker"),
            Channel::Candles(interval) => format!("{symbol}@kline_{}", interval.as_str()),
            Channel::OrderBook { depth } => format!("{symbol}@depth{depth}@100ms"),
        }
    }

    /// Topic a stream name carries.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::UnknownStream` for names outside the supported
    /// channels.
    pub fn topic_for_stream(stream: &str) -> Result<Topic, CodecError> {
        let unknown = || CodecError::UnknownStream(stream.to_string());

        let mut parts = stream.split('@');
        let symbol = parts.next().ok_or_else(unknown)?;
        let channel = parts.next().ok_or_else(unknown)?;
        let symbol = Symbol::new(symbol).map_err(|_| unknown())?;

        let channel = if channel == "ticker" {
            Channel::Ticker
        } else if let Some(interval) = channel.strip_prefix("kline_") {
            Channel::Candles(interval.parse::<Interval>().map_err(|_| unknown())?)
        } else if let Some(depth) = channel.strip_prefix("depth") {
            let depth: u16 = depth.parse().map_err(|_| unknown())?;
            if !SUPPORTED_DEPTHS.contains(&depth) {
                return Err(unknown());
            }
            Channel::OrderBook { depth }
        } else {
            return Err(unknown());
        };

        Ok(Topic::new(symbol, channel))
    }

    /// Combined stream URL carrying `topics`.
    #[must_use]
    pub fn combined_url(base_url: &str, topics: &[Topic]) -> String {
        let streams: Vec<String> = topics.iter().map(Self::stream_name).collect();
        format!(
            "{}/stream?streams={}",
            base_url.trim_end_matches('/'),
            streams.join("/")
        )
    }

    /// Encode a live `SUBSCRIBE`/`UNSUBSCRIBE` request.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode_request(&self, method: StreamMethod, topics: &[Topic]) -> Result<String, CodecError> {
        let request = StreamRequest {
            method,
            params: topics.iter().map(Self::stream_name).collect(),
            id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
        };
        Ok(serde_json::to_string(&request)?)
    }

    /// Decode an inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid JSON, unknown streams or payloads that
    /// do not match the stream's schema.
    pub fn decode(&self, text: &str) -> Result<DecodedFrame, CodecError> {
        let value: serde_json::Value = serde_json::from_str(text.trim())?;

        if value.get("stream").is_some() {
            let envelope: StreamEnvelope = serde_json::from_value(value)?;
            return Self::decode_envelope(envelope);
        }

        if value.get("id").is_some() {
            let response: StreamResponse = serde_json::from_value(value)?;
            return Ok(match response.error {
                Some(error) => DecodedFrame::Rejected {
                    id: response.id,
                    code: error.code,
                    msg: error.msg,
                },
                None => DecodedFrame::Ack { id: response.id },
            });
        }

        Err(CodecError::InvalidFormat(format!(
            "expected stream envelope or response, got: {}",
            text.chars().take(50).collect::<String>()
        )))
    }

    fn decode_envelope(envelope: StreamEnvelope) -> Result<DecodedFrame, CodecError> {
        let topic = Self::topic_for_stream(&envelope.stream)?;

        let data = match topic.channel {
            Channel::Ticker => {
                let event: TickerEvent = serde_json::from_value(envelope.data)?;
                MarketData::Ticker(Ticker::try_from(event)?)
            }
            Channel::Candles(_) => {
                let event: KlineEvent = serde_json::from_value(envelope.data)?;
                MarketData::Candles(vec![event.kline.try_into()?])
            }
            Channel::OrderBook { .. } => {
                let snapshot: DepthSnapshot = serde_json::from_value(envelope.data)?;
                MarketData::OrderBook(snapshot.into())
            }
        };

        Ok(DecodedFrame::Data { topic, data })
    }
}
