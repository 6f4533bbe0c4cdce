//! Domain Layer - Core market data types and business rules.
//!
//! This layer contains the core domain types with no I/O. All types here
//! are pure Rust with serialization support.

/// Connection lifecycle states and backoff bookkeeping.
pub mod connection;

/// Market data types (topics, tickers, candles, order books).
pub mod market;

/// Subscription tracking and event routing.
pub mod subscription;
