//! Prometheus Metrics Module
//!
//! Application metrics recorded through the `metrics` facade. Recording is
//! a no-op until a recorder is installed, so the library never requires
//! one; hosts that want Prometheus output call [`init_metrics`].
//!
//! # Metrics Categories
//!
//! - **REST**: Outbound calls by outcome, cache hits and misses
//! - **Throttle**: Queue depth and time spent waiting for a dispatch slot
//! - **Streams**: Messages received and dropped, reconnects, connection state
//! - **Fallback**: Poll outcomes

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionState;
use crate::domain::market::ChannelKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // REST
    describe_counter!(
        "market_feed_rest_calls_total",
        "Outbound REST calls by outcome"
    );
    describe_counter!(
        "market_feed_cache_hits_total",
        "Requests answered from the response cache"
    );
    describe_counter!(
        "market_feed_cache_misses_total",
        "Requests that needed an upstream call"
    );

    // Throttle
    describe_gauge!(
        "market_feed_throttle_queue_depth",
        "Calls waiting in the throttle queue"
    );
    describe_histogram!(
        "market_feed_throttle_wait_seconds",
        "Time between enqueue and dispatch of a throttled call"
    );

    // Streams
    describe_counter!(
        "market_feed_stream_messages_total",
        "Stream updates dispatched by channel"
    );
    describe_counter!(
        "market_feed_stream_messages_dropped_total",
        "Malformed stream frames dropped by channel"
    );
    describe_counter!(
        "market_feed_reconnects_total",
        "Stream reconnection attempts by channel"
    );
    describe_gauge!(
        "market_feed_connection_state",
        "Connection state code by channel (0 idle .. 5 closed)"
    );

    // Fallback
    describe_counter!(
        "market_feed_fallback_polls_total",
        "Fallback REST polls by outcome"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for calls and polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Call succeeded.
    Success,
    /// Upstream rate limited the call.
    RateLimited,
    /// Any other failure.
    Error,
}

impl Outcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RateLimited => "rate_limited",
            Self::Error => "error",
        }
    }
}

/// Record an outbound REST call.
pub fn record_rest_call(outcome: Outcome) {
    counter!("market_feed_rest_calls_total", "outcome" => outcome.as_str()).increment(1);
}

/// Record a cache lookup.
pub fn record_cache_lookup(hit: bool) {
    if hit {
        counter!("market_feed_cache_hits_total").increment(1);
    } else {
        counter!("market_feed_cache_misses_total").increment(1);
    }
}

/// Update the throttle queue depth.
#[allow(clippy::cast_precision_loss)]
pub fn set_throttle_queue_depth(depth: usize) {
    gauge!("market_feed_throttle_queue_depth").set(depth as f64);
}

/// Record how long a call waited before dispatch.
pub fn record_throttle_wait(wait: Duration) {
    histogram!("market_feed_throttle_wait_seconds").record(wait.as_secs_f64());
}

/// Record a stream update dispatched to subscribers.
pub fn record_stream_message(kind: ChannelKind) {
    counter!("market_feed_stream_messages_total", "channel" => kind.as_str()).increment(1);
}

/// Record a malformed stream frame.
pub fn record_stream_message_dropped(kind: ChannelKind) {
    counter!("market_feed_stream_messages_dropped_total", "channel" => kind.as_str())
        .increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect(kind: ChannelKind) {
    counter!("market_feed_reconnects_total", "channel" => kind.as_str()).increment(1);
}

/// Update the connection state gauge.
pub fn set_connection_state(kind: ChannelKind, state: ConnectionState) {
    gauge!("market_feed_connection_state", "channel" => kind.as_str())
        .set(f64::from(state.code()));
}

/// Record a fallback poll.
pub fn record_fallback_poll(outcome: Outcome) {
    counter!("market_feed_fallback_polls_total", "outcome" => outcome.as_str()).increment(1);
}

// =============================================================================
// Tests
// =============================================================================
