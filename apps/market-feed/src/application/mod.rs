//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the consumer-facing facade and the port interfaces
//! that define how it reaches external systems.

/// Port interfaces for external systems (REST, streams, clock).
pub mod ports;

/// Application services (the data acquisition facade).
pub mod services;
