//! Crate-wide error type.
//!
//! `FeedError` is `Clone` so a single upstream failure can be handed to every
//! caller that joined the same in-flight request.

use std::time::Duration;

/// Errors produced while acquiring market data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// Upstream answered with a non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Application error code from the response body, when present.
        code: Option<i64>,
        /// Error message from the response body or status line.
        message: String,
        /// Server-provided `Retry-After` hint.
        retry_after: Option<Duration>,
    },

    /// Request could not be sent or the response could not be read.
    #[error("network error: {0}")]
    Network(String),

    /// Streaming transport failure (handshake, I/O, unexpected close).
    #[error("transport error: {0}")]
    Transport(String),

    /// Payload could not be decoded.
    #[error("malformed data: {0}")]
    Malformed(String),

    /// Topic string or symbol is not recognised.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// The request queue was shut down before the call completed.
    #[error("request queue closed")]
    QueueClosed,
}

impl FeedError {
    /// Convenience constructor for a bare HTTP status failure.
    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Server-provided retry hint, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_constructor_has_no_hints() {
        let err = FeedError::http(400, "bad request");
        assert_eq!(err.retry_after(), None);
        assert_eq!(err.to_string(), "HTTP 400: bad request");
    }

    #[test]
    fn retry_after_only_on_http() {
        let err = FeedError::Http {
            status: 429,
            code: Some(-1003),
            message: "too many requests".to_string(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(FeedError::Transport("eof".into()).retry_after(), None);
    }
}
