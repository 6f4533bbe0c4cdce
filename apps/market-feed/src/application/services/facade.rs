//! Data Acquisition Facade
//!
//! The one component consumers talk to. It owns the cache and throttle
//! queue, the subscription registry, the fallback poller and the connection
//! manager, and wires them together:
//!
//! ```text
//! subscribe ──► registry (refcount) ──first──► ConnectionManager::add_topic
//!                  ▲                                │ stream frames
//!                  │ dispatch                       ▼
//!                  └──────────── worker ◄── FallbackPoller (when streams fail)
//!                                                   │
//! fetch_once ──► RetryPolicy ──► ThrottleQueue ──► CacheStore / RestTransport
//! ```

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::application::ports::{Clock, RestRequest, RestTransport, Transports};
use crate::domain::connection::{ConnectionState, StateTransition};
use crate::domain::market::{ChannelKind, FeedEvent, MarketData, Topic};
use crate::domain::subscription::{SubscriptionHandle, SubscriptionRegistry, SubscriptionStats};
use crate::error::FeedError;
use crate::infrastructure::binance::{BinanceRestClient, BinanceStreamTransport};
use crate::infrastructure::cache::CacheStore;
use crate::infrastructure::clock::TokioClock;
use crate::infrastructure::config::{ConfigError, FeedConfig};
use crate::infrastructure::fallback::FallbackPoller;
use crate::infrastructure::retry::RetryPolicy;
use crate::infrastructure::stream::ConnectionManager;
use crate::infrastructure::throttle::ThrottleQueue;

/// Facade construction errors.
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    /// Configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A transport could not be built.
    #[error(transparent)]
    Transport(#[from] FeedError),
}

/// Entry point for market data: live subscriptions and one-shot fetches.
pub struct DataAcquisitionFacade {
    config: FeedConfig,
    rest: Arc<dyn RestTransport>,
    cache: Arc<CacheStore<MarketData>>,
    throttle: ThrottleQueue<MarketData>,
    retry: RetryPolicy,
    registry: Arc<SubscriptionRegistry>,
    poller: Arc<FallbackPoller>,
    manager: ConnectionManager,
}

impl fmt::Debug for DataAcquisitionFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataAcquisitionFacade")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl DataAcquisitionFacade {
    /// Assemble a facade on explicit transports and clock.
    #[must_use]
    pub fn new(config: FeedConfig, transports: Transports, clock: Arc<dyn Clock>) -> Self {
        let cache = Arc::new(CacheStore::new(Arc::clone(&clock)));
        let throttle = ThrottleQueue::new(config.throttle, Arc::clone(&cache), Arc::clone(&clock));
        let retry = RetryPolicy::new(config.retry, Arc::clone(&clock));
        let registry = Arc::new(SubscriptionRegistry::new());

        let poller = Arc::new(FallbackPoller::new(
            config.fallback,
            Arc::clone(&transports.rest),
            throttle.clone(),
            Arc::clone(&registry),
            Arc::clone(&clock),
        ));

        let manager = ConnectionManager::new(
            config.stream,
            transports.stream,
            Arc::clone(&registry),
            Arc::clone(&poller),
            clock,
        );

        tracing::info!(
            rest = %config.endpoints.rest_base_url,
            stream = %config.endpoints.stream_base_url,
            "Market feed ready"
        );

        Self {
            config,
            rest: transports.rest,
            cache,
            throttle,
            retry,
            registry,
            poller,
            manager,
        }
    }

    /// Assemble a facade on the Binance adapters and the tokio clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn connect(config: FeedConfig) -> Result<Self, FacadeError> {
        config.validate()?;

        let rest = BinanceRestClient::new(
            config.endpoints.rest_base_url.as_str(),
            config.endpoints.request_timeout,
        )?;
        let stream = BinanceStreamTransport::new(config.endpoints.stream_base_url.as_str());

        let transports = Transports {
            rest: Arc::new(rest),
            stream: Arc::new(stream),
        };
        Ok(Self::new(config, transports, Arc::new(TokioClock)))
    }

    /// Subscribe to a topic.
    ///
    /// `on_event` receives every update (streamed or polled) and every
    /// surfaced error for the topic. The first subscriber to a topic makes
    /// the stream carry it.
    pub fn subscribe<F>(&self, topic: Topic, on_event: F) -> SubscriptionHandle
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        let handle = self
            .registry
            .subscribe(topic, Arc::new(on_event), |topic| self.manager.add_topic(topic));
        tracing::debug!(topic = %handle.topic(), id = handle.id(), "Subscribed");
        handle
    }

    /// Drop a subscription. Idempotent.
    ///
    /// The last subscriber leaving a topic removes it from the stream and
    /// stops any fallback polling for it.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let removed = self.registry.unsubscribe(handle, |topic| {
            self.manager.remove_topic(topic);
            self.poller.stop(topic);
        });
        if removed {
            tracing::debug!(topic = %handle.topic(), id = handle.id(), "Unsubscribed");
        }
    }

    /// Fetch a topic's current state over REST.
    ///
    /// Served from cache while fresh; otherwise queued behind the throttle
    /// and retried with backoff on rate limits and transient failures.
    ///
    /// # Errors
    ///
    /// Returns non-retryable errors immediately and the last error once
    /// retries are exhausted.
    pub async fn fetch_once(&self, topic: &Topic) -> Result<MarketData, FeedError> {
        let request = RestRequest::for_topic(topic, self.config.fallback.candle_limit);
        let cache_key = request.cache_key();

        self.retry
            .retry_with_backoff(|| {
                let rest = Arc::clone(&self.rest);
                let request = request.clone();
                let throttle = self.throttle.clone();
                let cache_key = cache_key.clone();
                async move {
                    throttle
                        .throttle(move || async move { rest.fetch(&request).await }, Some(cache_key.as_str()))
                        .await
                }
            })
            .await
    }

    /// Drop every cached REST result.
    pub fn clear_cache(&self) {
        self.cache.clear();
        tracing::debug!("REST cache cleared");
    }

    /// Connection state of a channel kind.
    #[must_use]
    pub fn connection_state(&self, kind: ChannelKind) -> ConnectionState {
        self.manager.state(kind)
    }

    /// Stream of connection state transitions.
    #[must_use]
    pub fn state_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.manager.transitions()
    }

    /// Number of live subscriptions to a topic.
    #[must_use]
    pub fn subscription_count(&self, topic: &Topic) -> usize {
        self.registry.subscriber_count(topic)
    }

    /// Subscription totals.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.registry.stats()
    }

    /// Whether a topic is currently served by REST polling.
    #[must_use]
    pub fn is_polling(&self, topic: &Topic) -> bool {
        self.poller.is_polling(topic)
    }

    /// Close every stream and stop all polling.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down market feed");
        self.manager.shutdown();
        self.poller.shutdown();
    }
}

impl Drop for DataAcquisitionFacade {
    fn drop(&mut self) {
        self.manager.shutdown();
        self.poller.shutdown();
    }
}
