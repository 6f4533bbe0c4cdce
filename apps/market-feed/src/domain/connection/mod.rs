//! Connection Lifecycle Types
//!
//! State of one streaming connection (one per channel kind) and the
//! bookkeeping for its reconnect backoff.
//!
//! ```text
//! Idle ──► Connecting ──► Open ──► Reconnecting ──► Connecting ...
//!              │                        │
//!              └──► Reconnecting        └──► FallbackActive ──► Open
//!
//! any ──► Closed   (last topic removed or shutdown)
//! ```

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::market::ChannelKind;

/// Lifecycle state of a channel's streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    /// No connection has been requested.
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Connected and receiving frames.
    Open,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Reconnect attempts exhausted; data is served by REST polling while
    /// reconnection continues at the capped delay.
    FallbackActive,
    /// Torn down on purpose.
    Closed,
}

impl ConnectionState {
    /// Label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::FallbackActive => "fallback_active",
            Self::Closed => "closed",
        }
    }

    /// Numeric code exported as a gauge.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Connecting => 1,
            Self::Open => 2,
            Self::Reconnecting => 3,
            Self::FallbackActive => 4,
            Self::Closed => 5,
        }
    }

    /// Whether live stream data is flowing.
    #[must_use]
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change of one channel's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    /// Channel kind whose connection changed.
    pub kind: ChannelKind,
    /// Previous state.
    pub from: ConnectionState,
    /// New state.
    pub to: ConnectionState,
}

/// Reconnect backoff bookkeeping.
///
/// `attempt` counts the reconnects scheduled since the last successful
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    /// Reconnects scheduled since the last success.
    pub attempt: u32,
    /// Delay of the first reconnect.
    pub base_delay: Duration,
    /// Reconnects allowed before falling back to polling.
    pub max_attempts: u32,
}

impl BackoffState {
    /// Fresh backoff state.
    #[must_use]
    pub const fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            base_delay,
            max_attempts,
        }
    }

    /// Reset after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Whether the reconnect budget is used up.
    #[must_use]
    pub const fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Attempt index used for the capped delay while in fallback.
    #[must_use]
    pub const fn capped_attempt(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_exhausts_at_max_attempts() {
        let mut backoff = BackoffState::new(Duration::from_secs(1), 5);
        for _ in 0..5 {
            assert!(!backoff.exhausted());
            backoff.attempt += 1;
        }
        assert!(backoff.exhausted());
        assert_eq!(backoff.capped_attempt(), 4);

        backoff.reset();
        assert_eq!(backoff.attempt, 0);
    }

    #[test]
    fn zero_max_attempts_is_immediately_exhausted() {
        let backoff = BackoffState::new(Duration::from_secs(1), 0);
        assert!(backoff.exhausted());
        assert_eq!(backoff.capped_attempt(), 0);
    }

    #[test]
    fn only_open_is_streaming() {
        assert!(ConnectionState::Open.is_streaming());
        assert!(!ConnectionState::FallbackActive.is_streaming());
        assert_eq!(ConnectionState::FallbackActive.to_string(), "fallback_active");
    }
}
