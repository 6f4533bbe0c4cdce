//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the resilience machinery the
//! facade is assembled from.

/// Binance REST and combined-stream adapters.
pub mod binance;

/// TTL cache for REST results.
pub mod cache;

/// Production clock.
pub mod clock;

/// Configuration loading.
pub mod config;

/// REST polling while streams are down.
pub mod fallback;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Error classification and retry with backoff.
pub mod retry;

/// Streaming connection management.
pub mod stream;

/// Tracing and OpenTelemetry setup.
pub mod telemetry;

/// Serialized, rate-limited REST dispatch.
pub mod throttle;
