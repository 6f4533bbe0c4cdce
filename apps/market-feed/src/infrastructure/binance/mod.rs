//! Binance Adapters
//!
//! REST and combined-stream adapters for the Binance public market-data
//! API (and compatible exchanges).
//!
//! - `rest`: one-shot fetches (`RestTransport`)
//! - `websocket`: multiplexed live streams (`StreamTransport`)
//! - `codec`: stream naming, request encoding and frame decoding
//! - `messages`: wire types

pub mod codec;
pub mod messages;
pub mod rest;
pub mod websocket;

pub use codec::{CodecError, DecodedFrame, StreamCodec};
pub use rest::BinanceRestClient;
pub use websocket::{BinanceStreamConnection, BinanceStreamTransport};
