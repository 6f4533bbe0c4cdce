//! Binance Combined Stream Client
//!
//! `tokio-tungstenite` implementation of the [`StreamTransport`] port.
//!
//! # Stream URL
//!
//! - Production: `wss://stream.binance.com:9443/stream?streams=<a>/<b>/...`
//!
//! # Protocol
//!
//! Frames are JSON envelopes `{"stream", "data"}`. Topics are added and
//! removed on a live connection with `SUBSCRIBE` / `UNSUBSCRIBE` requests.
//! The server pings every few minutes and drops connections that do not
//! answer. Pongs are queued by tungstenite while reading and flushed on the
//! following read, so `next_frame` never writes and stays safe to drop
//! inside `select!`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::codec::{CodecError, DecodedFrame, StreamCodec};
use super::messages::StreamMethod;
use crate::application::ports::{InboundFrame, StreamConnection, StreamTransport};
use crate::domain::market::{ChannelKind, MarketUpdate, Topic, UpdateSource};
use crate::error::FeedError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Factory for combined stream connections.
#[derive(Debug, Clone)]
pub struct BinanceStreamTransport {
    base_url: String,
    codec: Arc<StreamCodec>,
}

impl BinanceStreamTransport {
    /// Create a transport for `base_url` (e.g. `wss://stream.binance.com:9443`).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        // Several rustls providers may be linked; pin ring for the process.
        let _ = rustls::crypto::ring::default_provider().install_default();

        Self {
            base_url: base_url.into(),
            codec: Arc::new(StreamCodec::new()),
        }
    }
}

#[async_trait]
impl StreamTransport for BinanceStreamTransport {
    async fn connect(
        &self,
        kind: ChannelKind,
        topics: &[Topic],
    ) -> Result<Box<dyn StreamConnection>, FeedError> {
        let url = StreamCodec::combined_url(&self.base_url, topics);
        tracing::info!(channel = %kind, url = %url, "Connecting to market stream");

        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;

        Ok(Box::new(BinanceStreamConnection {
            ws,
            codec: Arc::clone(&self.codec),
            kind,
        }))
    }
}

/// One live combined stream connection.
pub struct BinanceStreamConnection {
    ws: WsStream,
    codec: Arc<StreamCodec>,
    kind: ChannelKind,
}

impl BinanceStreamConnection {
    async fn send_request(&mut self, method: StreamMethod, topics: &[Topic]) -> Result<(), FeedError> {
        if topics.is_empty() {
            return Ok(());
        }
        let json = self.codec.encode_request(method, topics)?;
        tracing::debug!(channel = %self.kind, request = %json, "Sending stream request");
        self.ws.send(Message::Text(json.into())).await?;
        Ok(())
    }

    fn handle_text(&self, text: &str) -> InboundFrame {
        match self.codec.decode(text) {
            Ok(DecodedFrame::Data { topic, data }) => InboundFrame::Update(MarketUpdate {
                topic,
                source: UpdateSource::Stream,
                data,
                received_at: Utc::now(),
            }),
            Ok(DecodedFrame::Ack { id }) => {
                tracing::trace!(channel = %self.kind, id = ?id, "Stream request acknowledged");
                InboundFrame::Ignored
            }
            Ok(DecodedFrame::Rejected { id, code, msg }) => {
                tracing::warn!(channel = %self.kind, id = ?id, code, msg = %msg, "Stream request rejected");
                InboundFrame::Ignored
            }
            Err(CodecError::UnknownStream(stream)) => {
                tracing::trace!(channel = %self.kind, stream = %stream, "Ignoring unknown stream");
                InboundFrame::Ignored
            }
            Err(e) => InboundFrame::Malformed(e.to_string()),
        }
    }
}

#[async_trait]
impl StreamConnection for BinanceStreamConnection {
    async fn subscribe(&mut self, topics: &[Topic]) -> Result<(), FeedError> {
        self.send_request(StreamMethod::Subscribe, topics).await
    }

    async fn unsubscribe(&mut self, topics: &[Topic]) -> Result<(), FeedError> {
        self.send_request(StreamMethod::Unsubscribe, topics).await
    }

    async fn next_frame(&mut self) -> InboundFrame {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return self.handle_text(text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    tracing::info!(channel = %self.kind, code = ?code, "Server sent close frame");
                    return InboundFrame::Closed { code };
                }
                Some(Ok(_)) => {
                    // Pings are answered by tungstenite on the next read;
                    // pong, binary and raw frames carry no market data.
                }
                Some(Err(e)) => return InboundFrame::Error(e.into()),
                None => return InboundFrame::Closed { code: None },
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            tracing::debug!(channel = %self.kind, error = %e, "Close handshake failed");
        }
    }
}
