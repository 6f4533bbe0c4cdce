//! REST Fallback Poller
//!
//! Keeps subscribers fed while a channel's stream is unavailable by polling
//! the REST API per topic. Polls go through the shared throttle queue (and
//! its cache), and results are dispatched through the subscription registry
//! exactly like stream updates, tagged `UpdateSource::Poll`.
//!
//! A rate-limited poll stretches the next wait to
//! `max(interval, next_delay(consecutive_failures, interval))`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Clock, RestRequest, RestTransport};
use crate::domain::market::{FeedEvent, MarketData, MarketUpdate, Topic, UpdateSource};
use crate::domain::subscription::SubscriptionRegistry;
use crate::error::FeedError;
use crate::infrastructure::metrics::{self, Outcome};
use crate::infrastructure::retry;
use crate::infrastructure::throttle::ThrottleQueue;

/// Cap on the backoff exponent applied after consecutive rate-limited polls.
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Fallback polling settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackSettings {
    /// Default interval between polls of one topic.
    pub poll_interval: Duration,
    /// Candle count requested per klines poll.
    pub candle_limit: u16,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            candle_limit: 500,
        }
    }
}

#[derive(Clone)]
struct PollContext {
    rest: Arc<dyn RestTransport>,
    throttle: ThrottleQueue<MarketData>,
    registry: Arc<SubscriptionRegistry>,
    clock: Arc<dyn Clock>,
    candle_limit: u16,
}

/// Per-topic REST polling.
pub struct FallbackPoller {
    ctx: PollContext,
    poll_interval: Duration,
    polls: Mutex<HashMap<Topic, CancellationToken>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for FallbackPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackPoller")
            .field("poll_interval", &self.poll_interval)
            .field("polling", &self.polls.lock().len())
            .finish_non_exhaustive()
    }
}

impl FallbackPoller {
    /// Create a poller.
    #[must_use]
    pub fn new(
        settings: FallbackSettings,
        rest: Arc<dyn RestTransport>,
        throttle: ThrottleQueue<MarketData>,
        registry: Arc<SubscriptionRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ctx: PollContext {
                rest,
                throttle,
                registry,
                clock,
                candle_limit: settings.candle_limit,
            },
            poll_interval: settings.poll_interval,
            polls: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start polling a topic: once immediately, then every `interval_hint`
    /// (or the configured interval). No-op if the topic is already polled.
    pub fn start(&self, topic: &Topic, interval_hint: Option<Duration>) {
        let mut polls = self.polls.lock();
        if polls.get(topic).is_some_and(|token| !token.is_cancelled()) {
            return;
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        let interval = interval_hint.unwrap_or(self.poll_interval);
        let cancel = self.shutdown.child_token();
        polls.insert(topic.clone(), cancel.clone());

        tracing::info!(topic = %topic, interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "Starting fallback polling");
        tokio::spawn(poll_loop(self.ctx.clone(), topic.clone(), interval, cancel));
    }

    /// Stop polling a topic. Idempotent.
    pub fn stop(&self, topic: &Topic) {
        if let Some(token) = self.polls.lock().remove(topic) {
            tracing::info!(topic = %topic, "Stopping fallback polling");
            token.cancel();
        }
    }

    /// Whether a topic is being polled.
    #[must_use]
    pub fn is_polling(&self, topic: &Topic) -> bool {
        self.polls
            .lock()
            .get(topic)
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Topics currently polled.
    #[must_use]
    pub fn polling_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.polls.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Stop every poll.
    pub fn stop_all(&self) {
        for (_, token) in self.polls.lock().drain() {
            token.cancel();
        }
    }

    /// Stop every poll and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.stop_all();
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn poll_loop(ctx: PollContext, topic: Topic, interval: Duration, cancel: CancellationToken) {
    let request = RestRequest::for_topic(&topic, ctx.candle_limit);
    let cache_key = request.cache_key();
    let mut rate_limited_streak = 0u32;

    loop {
        let rest = Arc::clone(&ctx.rest);
        let req = request.clone();
        let result = tokio::select! {
            () = cancel.cancelled() => return,
            result = ctx.throttle.throttle(move || async move { rest.fetch(&req).await }, Some(cache_key.as_str())) => result,
        };

        let wait = match result {
            Ok(data) => {
                rate_limited_streak = 0;
                metrics::record_fallback_poll(Outcome::Success);
                let delivered = ctx.registry.dispatch(&FeedEvent::Update(MarketUpdate {
                    topic: topic.clone(),
                    source: UpdateSource::Poll,
                    data,
                    received_at: Utc::now(),
                }));
                tracing::debug!(topic = %topic, delivered, "Fallback poll delivered");
                interval
            }
            Err(error) if retry::is_rate_limited(&error) => {
                metrics::record_fallback_poll(Outcome::RateLimited);
                rate_limited_streak = rate_limited_streak.saturating_add(1);
                let stretched = retry::next_delay(rate_limited_streak.min(MAX_BACKOFF_EXPONENT), interval).max(interval);
                let wait = error.retry_after().map_or(stretched, |hint| hint.max(stretched));
                tracing::warn!(
                    topic = %topic,
                    streak = rate_limited_streak,
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    "Fallback poll rate limited"
                );
                if rate_limited_streak > MAX_BACKOFF_EXPONENT {
                    report_error(&ctx, &topic, error);
                }
                wait
            }
            Err(error) => {
                rate_limited_streak = 0;
                metrics::record_fallback_poll(Outcome::Error);
                tracing::warn!(topic = %topic, error = %error, "Fallback poll failed");
                report_error(&ctx, &topic, error);
                interval
            }
        };

        tokio::select! {
            () = cancel.cancelled() => return,
            () = ctx.clock.sleep(wait) => {}
        }
    }
}

fn report_error(ctx: &PollContext, topic: &Topic, error: FeedError) {
    ctx.registry.dispatch(&FeedEvent::Error {
        topic: topic.clone(),
        error,
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::MockRestTransport;
    use crate::domain::market::{OrderBook, PriceLevel};
    use crate::infrastructure::cache::CacheStore;
    use crate::infrastructure::clock::TokioClock;
    use crate::infrastructure::throttle::ThrottleSettings;

    fn book(id: u64) -> MarketData {
        MarketData::OrderBook(OrderBook {
            last_update_id: id,
            bids: vec![PriceLevel {
                price: Decimal::ONE,
                quantity: Decimal::ONE,
            }],
            asks: vec![],
        })
    }

    fn poller(rest: MockRestTransport, registry: Arc<SubscriptionRegistry>) -> FallbackPoller {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let throttle = ThrottleQueue::new(
            ThrottleSettings {
                min_delay: Duration::from_millis(100),
                cache_ttl: Duration::from_millis(500),
            },
            Arc::new(CacheStore::new(Arc::clone(&clock))),
            Arc::clone(&clock),
        );
        FallbackPoller::new(
            FallbackSettings {
                poll_interval: Duration::from_secs(1),
                candle_limit: 500,
            },
            Arc::new(rest),
            throttle,
            registry,
            clock,
        )
    }

    fn collect(registry: &SubscriptionRegistry, topic: &Topic) -> Arc<Mutex<Vec<FeedEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        registry.subscribe(topic.clone(), Arc::new(move |e| sink.lock().push(e.clone())), |_| {});
        events
    }

    #[tokio::test(start_paused = true)]
    async fn polls_immediately_then_every_interval() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let topic: Topic = "BTCUSDT:depth20".parse().unwrap();
        let events = collect(&registry, &topic);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut rest = MockRestTransport::new();
        rest.expect_fetch().returning(move |request| {
            assert_eq!(request.cache_key(), "depth:BTCUSDT:20");
            Ok(book(u64::from(counter.fetch_add(1, Ordering::SeqCst))))
        });

        let poller = poller(rest, Arc::clone(&registry));
        poller.start(&topic, None);
        poller.start(&topic, None);

        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let events = events.lock();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| matches!(
            e,
            FeedEvent::Update(update) if update.source == UpdateSource::Poll
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_halts_polling() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let topic = Topic::ticker("BTCUSDT").unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut rest = MockRestTransport::new();
        rest.expect_fetch().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(book(1))
        });

        let poller = poller(rest, registry);
        poller.start(&topic, None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(poller.is_polling(&topic));

        poller.stop(&topic);
        poller.stop(&topic);
        assert!(!poller.is_polling(&topic));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_delivered_to_subscribers() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let topic = Topic::ticker("NOPE").unwrap();
        let events = collect(&registry, &topic);

        let mut rest = MockRestTransport::new();
        rest.expect_fetch().returning(|_| {
            Err(FeedError::Http {
                status: 400,
                code: Some(-1121),
                message: "Invalid symbol.".to_string(),
                retry_after: None,
            })
        });

        let poller = poller(rest, Arc::clone(&registry));
        poller.start(&topic, None);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let events = events.lock();
        assert!(matches!(
            events.first(),
            Some(FeedEvent::Error { error: FeedError::Http { status: 400, .. }, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_poll_stretches_next_wait() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let topic = Topic::ticker("BTCUSDT").unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut rest = MockRestTransport::new();
        rest.expect_fetch().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(FeedError::http(429, "Too many requests"))
            } else {
                Ok(book(2))
            }
        });

        let poller = poller(rest, registry);
        poller.start(&topic, None);

        // Stretched to 2 * interval after the first rate-limited poll.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_clears_every_topic() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let mut rest = MockRestTransport::new();
        rest.expect_fetch().returning(|_| Ok(book(1)));

        let poller = poller(rest, registry);
        let a = Topic::ticker("BTCUSDT").unwrap();
        let b = Topic::ticker("ETHUSDT").unwrap();
        poller.start(&a, None);
        poller.start(&b, Some(Duration::from_secs(3)));
        assert_eq!(poller.polling_topics(), vec![a.clone(), b.clone()]);

        poller.stop_all();
        assert!(!poller.is_polling(&a));
        assert!(poller.polling_topics().is_empty());
    }
}
