//! Streaming Connection Management
//!
//! One worker task per channel kind owns that channel's connection state
//! machine, multiplexes the channel's topics over one physical connection,
//! reconnects with exponential backoff and hands topics to the fallback
//! poller when reconnection keeps failing.

mod manager;

use std::time::Duration;

pub use manager::ConnectionManager;

/// Streaming connection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Reconnects attempted before falling back to REST polling.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect; doubles per attempt.
    pub initial_backoff: Duration,
    /// A connection that delivers no frame for this long is considered dead.
    pub idle_timeout: Duration,
    /// A handshake that has not completed after this long counts as failed.
    pub connect_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}
