#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_truncation
    )
)]

//! Market Feed - Resilient Market Data Acquisition
//!
//! Keeps consumers fed with tickers, candles and order books from an
//! exchange API while respecting its rate limits and surviving network
//! failures. Consumers subscribe to topics and never deal with throttling,
//! caching or reconnection.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Market data types and subscription bookkeeping
//!   - `market`: Topics, tickers, candles, order books
//!   - `subscription`: Refcounted topic subscriptions and event routing
//!   - `connection`: Connection states and backoff bookkeeping
//!
//! - **Application**: Port definitions and the facade
//!   - `ports`: REST, streaming and clock interfaces
//!   - `services`: `DataAcquisitionFacade`
//!
//! - **Infrastructure**: Adapters and resilience machinery
//!   - `binance`: REST and combined-stream adapters
//!   - `cache` / `throttle`: TTL cache and serialized REST dispatch
//!   - `retry`: Error classification and backoff
//!   - `stream`: Per-channel connection manager
//!   - `fallback`: REST polling while streams are down
//!   - `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                          ┌──────────────────┐
//! subscribe(topic) ──────► │  Subscription    │ ◄──── dispatch ─────┐
//!                          │  Registry        │                     │
//!                          └────────┬─────────┘                     │
//!                                   │ first / last subscriber       │
//!                                   ▼                               │
//!                          ┌──────────────────┐   frames   ┌────────┴───────┐
//!                          │ ConnectionManager│ ─────────► │ channel worker │
//!                          └────────┬─────────┘            └────────────────┘
//!                                   │ reconnects exhausted
//!                                   ▼
//!                          ┌──────────────────┐   ┌───────────────┐
//! fetch_once(topic) ─────► │  ThrottleQueue   │ ─►│  CacheStore   │
//!        (RetryPolicy)     │  (FIFO, spaced)  │   └───────────────┘
//!                          └────────┬─────────┘
//!                                   ▼
//!                              REST API
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market data types with no I/O.
pub mod domain;

/// Application layer - Ports and the facade.
pub mod application;

/// Infrastructure layer - Adapters and resilience machinery.
pub mod infrastructure;

/// Crate-wide error type.
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

// Facade
pub use application::ports::{Clock, RestTransport, StreamConnection, StreamTransport, Transports};
pub use application::services::{DataAcquisitionFacade, FacadeError};

// Domain types
pub use domain::connection::{ConnectionState, StateTransition};
pub use domain::market::{
    Candle, Channel, ChannelKind, FeedEvent, Interval, MarketData, MarketUpdate, OrderBook,
    PriceLevel, Symbol, Ticker, Topic, UpdateSource,
};
pub use domain::subscription::{SubscriptionHandle, SubscriptionStats};

// Errors
pub use error::FeedError;

// Configuration
pub use infrastructure::config::{ConfigError, EndpointSettings, FeedConfig, load_dotenv};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
