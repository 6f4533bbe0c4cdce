//! Configuration Module
//!
//! Configuration loading for the market feed.

mod settings;

pub use settings::{ConfigError, EndpointSettings, FeedConfig, load_dotenv};
