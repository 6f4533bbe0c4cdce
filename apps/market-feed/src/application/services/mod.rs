//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `DataAcquisitionFacade`: subscriptions and one-shot fetches

mod facade;

pub use facade::{DataAcquisitionFacade, FacadeError};
