//! Feed Configuration Settings
//!
//! Configuration types for the market feed, loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::infrastructure::fallback::FallbackSettings;
use crate::infrastructure::retry::RetrySettings;
use crate::infrastructure::stream::StreamSettings;
use crate::infrastructure::throttle::ThrottleSettings;

/// Upstream endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    /// REST API base URL.
    pub rest_base_url: String,
    /// Combined stream base URL.
    pub stream_base_url: String,
    /// Timeout applied to each REST request.
    pub request_timeout: Duration,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            rest_base_url: "https://api.binance.com".to_string(),
            stream_base_url: "wss://stream.binance.com:9443".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Complete feed configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedConfig {
    /// Upstream endpoints.
    pub endpoints: EndpointSettings,
    /// REST throttling and caching.
    pub throttle: ThrottleSettings,
    /// One-shot fetch retries.
    pub retry: RetrySettings,
    /// Streaming connections.
    pub stream: StreamSettings,
    /// REST fallback polling.
    pub fallback: FallbackSettings,
}

impl FeedConfig {
    /// Create configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting configuration is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting configuration is invalid.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let endpoints = EndpointSettings {
            rest_base_url: lookup("MARKET_FEED_REST_URL")
                .unwrap_or(defaults.endpoints.rest_base_url),
            stream_base_url: lookup("MARKET_FEED_STREAM_URL")
                .unwrap_or(defaults.endpoints.stream_base_url),
            request_timeout: parse_env_duration_secs(
                &lookup,
                "MARKET_FEED_REQUEST_TIMEOUT_SECS",
                defaults.endpoints.request_timeout,
            ),
        };

        let throttle = ThrottleSettings {
            min_delay: parse_env_duration_millis(
                &lookup,
                "MARKET_FEED_MIN_DELAY_MS",
                defaults.throttle.min_delay,
            ),
            cache_ttl: parse_env_duration_millis(
                &lookup,
                "MARKET_FEED_CACHE_TTL_MS",
                defaults.throttle.cache_ttl,
            ),
        };

        let retry = RetrySettings {
            max_retries: parse_env(&lookup, "MARKET_FEED_MAX_RETRIES", defaults.retry.max_retries),
            initial_delay: parse_env_duration_millis(
                &lookup,
                "MARKET_FEED_RETRY_DELAY_MS",
                defaults.retry.initial_delay,
            ),
        };

        let stream = StreamSettings {
            max_reconnect_attempts: parse_env(
                &lookup,
                "MARKET_FEED_MAX_RECONNECT_ATTEMPTS",
                defaults.stream.max_reconnect_attempts,
            ),
            initial_backoff: parse_env_duration_millis(
                &lookup,
                "MARKET_FEED_RECONNECT_BACKOFF_MS",
                defaults.stream.initial_backoff,
            ),
            idle_timeout: parse_env_duration_secs(
                &lookup,
                "MARKET_FEED_STREAM_IDLE_TIMEOUT_SECS",
                defaults.stream.idle_timeout,
            ),
            connect_timeout: parse_env_duration_secs(
                &lookup,
                "MARKET_FEED_CONNECT_TIMEOUT_SECS",
                defaults.stream.connect_timeout,
            ),
        };

        let fallback = FallbackSettings {
            poll_interval: parse_env_duration_millis(
                &lookup,
                "MARKET_FEED_FALLBACK_POLL_MS",
                defaults.fallback.poll_interval,
            ),
            candle_limit: parse_env(&lookup, "MARKET_FEED_CANDLE_LIMIT", defaults.fallback.candle_limit),
        };

        let config = Self {
            endpoints,
            throttle,
            retry,
            stream,
            fallback,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the feed cannot run with.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rest = &self.endpoints.rest_base_url;
        if !(rest.starts_with("http://") || rest.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl {
                key: "MARKET_FEED_REST_URL",
                url: rest.clone(),
            });
        }

        let stream = &self.endpoints.stream_base_url;
        if !(stream.starts_with("ws://") || stream.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl {
                key: "MARKET_FEED_STREAM_URL",
                url: stream.clone(),
            });
        }

        if self.fallback.poll_interval.is_zero() {
            return Err(ConfigError::ZeroValue("MARKET_FEED_FALLBACK_POLL_MS"));
        }
        if self.throttle.cache_ttl.is_zero() {
            return Err(ConfigError::ZeroValue("MARKET_FEED_CACHE_TTL_MS"));
        }
        if self.stream.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroValue("MARKET_FEED_CONNECT_TIMEOUT_SECS"));
        }
        if self.fallback.candle_limit == 0 {
            return Err(ConfigError::ZeroValue("MARKET_FEED_CANDLE_LIMIT"));
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// URL with an unsupported scheme.
    #[error("{key} has an unsupported URL: {url}")]
    InvalidUrl {
        /// Variable the URL came from.
        key: &'static str,
        /// Offending URL.
        url: String,
    },
    /// Value that must be positive is zero.
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
}

/// Load `.env` from the working directory or its nearest ancestor.
pub fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

fn parse_env<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_env_duration_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
