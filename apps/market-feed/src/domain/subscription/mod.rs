//! Subscription Management Types
//!
//! Tracks which consumers are subscribed to which topics and routes
//! events to them.
//!
//! # Design
//!
//! The registry tracks:
//! - The handler of every live subscription
//! - A reference count per topic (the number of live subscriptions)
//!
//! Many consumers may subscribe to the same topic while the transport
//! carries it only once. The first subscription and the last
//! unsubscription are reported to the caller (inside the registry lock) so
//! upstream subscribe/unsubscribe calls stay ordered with the refcount.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::market::{ChannelKind, FeedEvent, Topic};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback invoked for every event on a subscribed topic.
pub type UpdateHandler = Arc<dyn Fn(&FeedEvent) + Send + Sync>;

/// Handle returned by `subscribe`; pass it back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    topic: Topic,
}

impl SubscriptionHandle {
    /// Subscription identifier.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Subscribed topic.
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }
}

/// Reference-counted view of one subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic.
    pub topic: Topic,
    /// Channel kind the topic is carried on.
    pub channel_kind: ChannelKind,
    /// Number of live subscriptions.
    pub subscriber_count: usize,
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Default)]
struct RegistryState {
    /// Handlers per topic, in subscription order.
    topics: HashMap<Topic, Vec<(SubscriptionId, UpdateHandler)>>,
    /// Reverse index from subscription to topic.
    owners: HashMap<SubscriptionId, Topic>,
}

/// Thread-safe subscription registry.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use market_feed::domain::market::Topic;
/// use market_feed::domain::subscription::SubscriptionRegistry;
///
/// let registry = SubscriptionRegistry::new();
/// let topic = Topic::ticker("BTCUSDT").unwrap();
///
/// let mut first = false;
/// let handle = registry.subscribe(topic.clone(), Arc::new(|_| {}), |_| first = true);
/// assert!(first);
///
/// let mut last = false;
/// registry.unsubscribe(&handle, |_| last = true);
/// assert!(last);
///
/// // A second unsubscribe is a no-op.
/// assert!(!registry.unsubscribe(&handle, |_| unreachable!()));
/// ```
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
    next_id: AtomicU64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &state.topics.len())
            .field("subscriptions", &state.owners.len())
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for a topic.
    ///
    /// `on_first` runs under the registry lock when this is the topic's
    /// first subscription (refcount 0→1).
    pub fn subscribe<F>(&self, topic: Topic, handler: UpdateHandler, on_first: F) -> SubscriptionHandle
    where
        F: FnOnce(&Topic),
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write();

        let handlers = state.topics.entry(topic.clone()).or_default();
        let first = handlers.is_empty();
        handlers.push((id, handler));
        state.owners.insert(id, topic.clone());

        if first {
            on_first(&topic);
        }

        SubscriptionHandle { id, topic }
    }

    /// Remove a subscription.
    ///
    /// `on_last` runs under the registry lock when this was the topic's
    /// last subscription (refcount 1→0). Returns `false` if the handle was
    /// already removed.
    pub fn unsubscribe<F>(&self, handle: &SubscriptionHandle, on_last: F) -> bool
    where
        F: FnOnce(&Topic),
    {
        let mut state = self.state.write();

        let Some(topic) = state.owners.remove(&handle.id) else {
            return false;
        };

        let now_empty = state.topics.get_mut(&topic).is_some_and(|handlers| {
            handlers.retain(|(id, _)| *id != handle.id);
            handlers.is_empty()
        });

        if now_empty {
            state.topics.remove(&topic);
            on_last(&topic);
        }

        true
    }

    /// Deliver an event to every subscriber of its topic.
    ///
    /// Handlers run outside the registry lock. Returns the number of
    /// handlers invoked.
    pub fn dispatch(&self, event: &FeedEvent) -> usize {
        let handlers: Vec<UpdateHandler> = {
            let state = self.state.read();
            match state.topics.get(event.topic()) {
                Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return 0,
            }
        };

        for handler in &handlers {
            handler(event);
        }

        handlers.len()
    }

    /// Refcounted view of a topic, if subscribed.
    #[must_use]
    pub fn subscription(&self, topic: &Topic) -> Option<Subscription> {
        self.state.read().topics.get(topic).map(|handlers| Subscription {
            topic: topic.clone(),
            channel_kind: topic.kind(),
            subscriber_count: handlers.len(),
        })
    }

    /// Number of live subscriptions for a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.state.read().topics.get(topic).map_or(0, Vec::len)
    }

    /// Subscribed topics of a channel kind.
    #[must_use]
    pub fn topics(&self, kind: ChannelKind) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .state
            .read()
            .topics
            .keys()
            .filter(|t| t.kind() == kind)
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    /// Overall statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let state = self.state.read();
        SubscriptionStats {
            topic_count: state.topics.len(),
            subscription_count: state.owners.len(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Number of distinct subscribed topics.
    pub topic_count: usize,
    /// Number of live subscriptions.
    pub subscription_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;

    use super::*;
    use crate::domain::market::{MarketData, MarketUpdate, OrderBook, UpdateSource};

    fn noop() -> UpdateHandler {
        Arc::new(|_| {})
    }

    fn event(topic: &Topic) -> FeedEvent {
        FeedEvent::Update(MarketUpdate {
            topic: topic.clone(),
            source: UpdateSource::Stream,
            data: MarketData::OrderBook(OrderBook {
                last_update_id: 1,
                bids: vec![],
                asks: vec![],
            }),
            received_at: Utc::now(),
        })
    }

    #[test]
    fn first_subscription_reports_upstream() {
        let registry = SubscriptionRegistry::new();
        let topic = Topic::ticker("BTCUSDT").unwrap();

        let mut firsts = 0;
        registry.subscribe(topic.clone(), noop(), |_| firsts += 1);
        registry.subscribe(topic.clone(), noop(), |_| firsts += 1);

        assert_eq!(firsts, 1);
        assert_eq!(registry.subscriber_count(&topic), 2);
    }

    #[test]
    fn last_unsubscription_reports_upstream() {
        let registry = SubscriptionRegistry::new();
        let topic = Topic::ticker("BTCUSDT").unwrap();

        let a = registry.subscribe(topic.clone(), noop(), |_| {});
        let b = registry.subscribe(topic.clone(), noop(), |_| {});

        let mut lasts = 0;
        assert!(registry.unsubscribe(&a, |_| lasts += 1));
        assert_eq!(lasts, 0);
        assert!(registry.unsubscribe(&b, |_| lasts += 1));
        assert_eq!(lasts, 1);
        assert!(registry.subscription(&topic).is_none());
    }

    #[test]
    fn double_unsubscribe_is_noop() {
        let registry = SubscriptionRegistry::new();
        let topic = Topic::ticker("BTCUSDT").unwrap();
        let handle = registry.subscribe(topic, noop(), |_| {});

        let mut lasts = 0;
        assert!(registry.unsubscribe(&handle, |_| lasts += 1));
        assert!(!registry.unsubscribe(&handle, |_| lasts += 1));
        assert_eq!(lasts, 1);
    }

    #[test]
    fn dispatch_reaches_only_topic_subscribers() {
        let registry = SubscriptionRegistry::new();
        let btc = Topic::ticker("BTCUSDT").unwrap();
        let eth = Topic::ticker("ETHUSDT").unwrap();

        let btc_hits = Arc::new(AtomicUsize::new(0));
        let eth_hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&btc_hits);
        registry.subscribe(
            btc.clone(),
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            |_| {},
        );
        let counter = Arc::clone(&eth_hits);
        registry.subscribe(
            eth,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            |_| {},
        );

        assert_eq!(registry.dispatch(&event(&btc)), 1);
        assert_eq!(btc_hits.load(Ordering::SeqCst), 1);
        assert_eq!(eth_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dispatch_to_unknown_topic_is_dropped() {
        let registry = SubscriptionRegistry::new();
        let topic = Topic::ticker("BTCUSDT").unwrap();
        assert_eq!(registry.dispatch(&event(&topic)), 0);
    }

    #[test]
    fn handler_may_unsubscribe_during_dispatch() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let topic = Topic::ticker("BTCUSDT").unwrap();

        let slot: Arc<parking_lot::Mutex<Option<SubscriptionHandle>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let reg = Arc::clone(&registry);
        let handle_slot = Arc::clone(&slot);
        let handle = registry.subscribe(
            topic.clone(),
            Arc::new(move |_| {
                if let Some(h) = handle_slot.lock().take() {
                    reg.unsubscribe(&h, |_| {});
                }
            }),
            |_| {},
        );
        *slot.lock() = Some(handle);

        assert_eq!(registry.dispatch(&event(&topic)), 1);
        assert_eq!(registry.subscriber_count(&topic), 0);
    }

    #[test]
    fn topics_filtered_by_kind() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(Topic::ticker("ETHUSDT").unwrap(), noop(), |_| {});
        registry.subscribe(Topic::ticker("BTCUSDT").unwrap(), noop(), |_| {});
        registry.subscribe("BTCUSDT:depth20".parse().unwrap(), noop(), |_| {});

        let tickers = registry.topics(ChannelKind::Ticker);
        assert_eq!(tickers.len(), 2);
        assert_eq!(tickers[0].symbol.as_str(), "BTCUSDT");
        assert_eq!(registry.topics(ChannelKind::OrderBook).len(), 1);
        assert!(registry.topics(ChannelKind::Candles).is_empty());

        let stats = registry.stats();
        assert_eq!(stats.topic_count, 3);
        assert_eq!(stats.subscription_count, 3);
    }

    #[test]
    fn thread_safety_concurrent_subscriptions() {
        use std::thread;

        let registry = Arc::new(SubscriptionRegistry::new());
        let firsts = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..10 {
            let r = Arc::clone(&registry);
            let f = Arc::clone(&firsts);
            handles.push(thread::spawn(move || {
                r.subscribe(Topic::ticker("SHARED").unwrap(), noop(), |_| {
                    f.fetch_add(1, Ordering::SeqCst);
                })
            }));
        }

        let subs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(firsts.load(Ordering::SeqCst), 1);
        assert_eq!(subs.len(), 10);
        assert_eq!(
            registry.subscriber_count(&Topic::ticker("SHARED").unwrap()),
            10
        );
    }
}
