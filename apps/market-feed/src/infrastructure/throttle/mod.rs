//! Request Throttle Queue
//!
//! Serializes outbound REST calls, spaces them at least `min_delay` apart
//! and answers repeated requests from the response cache.
//!
//! # Dispatch
//!
//! ```text
//! throttle(call, key)
//!   ├─ cache hit ─────────────────────────────► Ok(cached)
//!   ├─ key already queued/in flight ──────────► join, share its result
//!   └─ enqueue ─► drain task (one at a time, FIFO)
//!                   wait = min_delay - (now - last_call_at)
//!                   last_call_at = now; call(); cache on success
//! ```
//!
//! At most one call is in flight per queue. Errors are returned to the
//! caller (and every joined waiter) without retrying.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::application::ports::Clock;
use crate::error::FeedError;
use crate::infrastructure::cache::CacheStore;
use crate::infrastructure::metrics::{self, Outcome};
use crate::infrastructure::retry;

type BoxedCall<V> = Box<dyn FnOnce() -> BoxFuture<'static, Result<V, FeedError>> + Send>;
type Reply<V> = oneshot::Sender<Result<V, FeedError>>;

/// Throttle queue settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleSettings {
    /// Minimum spacing between two dispatched calls.
    pub min_delay: Duration,
    /// TTL of cached successful responses.
    pub cache_ttl: Duration,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            cache_ttl: Duration::from_secs(5),
        }
    }
}

struct QueuedTask<V> {
    call: BoxedCall<V>,
    cache_key: Option<String>,
    enqueued_at: Instant,
    reply: Reply<V>,
}

struct QueueState<V> {
    tasks: VecDeque<QueuedTask<V>>,
    draining: bool,
    last_call_at: Option<Instant>,
    /// Callers that joined a queued or in-flight keyed call.
    joined: HashMap<String, Vec<Reply<V>>>,
}

struct Inner<V> {
    state: Mutex<QueueState<V>>,
    cache: Arc<CacheStore<V>>,
    clock: Arc<dyn Clock>,
    settings: ThrottleSettings,
}

/// FIFO, single-in-flight, cache-fronted call queue.
pub struct ThrottleQueue<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for ThrottleQueue<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for ThrottleQueue<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ThrottleQueue")
            .field("settings", &self.inner.settings)
            .field("queued", &state.tasks.len())
            .field("draining", &state.draining)
            .finish_non_exhaustive()
    }
}

impl<V: Clone + Send + 'static> ThrottleQueue<V> {
    /// Create a queue in front of `cache`.
    #[must_use]
    pub fn new(settings: ThrottleSettings, cache: Arc<CacheStore<V>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    tasks: VecDeque::new(),
                    draining: false,
                    last_call_at: None,
                    joined: HashMap::new(),
                }),
                cache,
                clock,
                settings,
            }),
        }
    }

    /// The cache this queue stores results in.
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheStore<V>> {
        &self.inner.cache
    }

    /// Number of calls waiting for dispatch.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    /// Run `call` through the queue.
    ///
    /// With a `cache_key`, a fresh cached value is returned without calling
    /// upstream, and concurrent callers for the same key share one call.
    ///
    /// # Errors
    ///
    /// Returns the call's error, or `FeedError::QueueClosed` if the drain
    /// task went away before replying.
    pub async fn throttle<F, Fut>(&self, call: F, cache_key: Option<&str>) -> Result<V, FeedError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, FeedError>> + Send + 'static,
    {
        if let Some(key) = cache_key
            && let Some(value) = self.inner.cache.get(key)
        {
            metrics::record_cache_lookup(true);
            return Ok(value);
        }

        let (reply, response) = oneshot::channel();
        let spawn_drain = {
            let mut state = self.inner.state.lock();

            if let Some(key) = cache_key
                && let Some(waiters) = state.joined.get_mut(key)
            {
                tracing::trace!(cache_key = key, "Joining in-flight request");
                waiters.push(reply);
                false
            } else if let Some(value) = cache_key.and_then(|key| self.inner.cache.get(key)) {
                // Completed between the first lookup and taking the lock.
                metrics::record_cache_lookup(true);
                return Ok(value);
            } else {
                if let Some(key) = cache_key {
                    metrics::record_cache_lookup(false);
                    state.joined.insert(key.to_string(), Vec::new());
                }
                state.tasks.push_back(QueuedTask {
                    call: Box::new(move || call().boxed()),
                    cache_key: cache_key.map(str::to_string),
                    enqueued_at: self.inner.clock.now(),
                    reply,
                });
                metrics::set_throttle_queue_depth(state.tasks.len());

                let idle = !state.draining;
                state.draining = true;
                idle
            }
        };

        if spawn_drain {
            tokio::spawn(Self::drain(Arc::clone(&self.inner)));
        }

        response.await.map_err(|_| FeedError::QueueClosed)?
    }

    async fn drain(inner: Arc<Inner<V>>) {
        loop {
            let (task, last_call_at) = {
                let mut state = inner.state.lock();
                let Some(task) = state.tasks.pop_front() else {
                    state.draining = false;
                    return;
                };
                metrics::set_throttle_queue_depth(state.tasks.len());
                (task, state.last_call_at)
            };

            if let Some(last) = last_call_at {
                let since = inner.clock.now().saturating_duration_since(last);
                let wait = inner.settings.min_delay.saturating_sub(since);
                if !wait.is_zero() {
                    tracing::trace!(wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX), "Throttling request");
                    inner.clock.sleep(wait).await;
                }
            }

            let dispatched_at = inner.clock.now();
            inner.state.lock().last_call_at = Some(dispatched_at);
            metrics::record_throttle_wait(dispatched_at.saturating_duration_since(task.enqueued_at));

            // Run on its own task so a panicking call cannot stall the queue.
            let result = match tokio::spawn((task.call)()).await {
                Ok(result) => result,
                Err(join_error) => Err(FeedError::Network(format!("request task failed: {join_error}"))),
            };

            match &result {
                Ok(value) => {
                    metrics::record_rest_call(Outcome::Success);
                    if let Some(key) = &task.cache_key {
                        inner.cache.put(key.clone(), value.clone(), inner.settings.cache_ttl);
                    }
                }
                Err(error) => {
                    let outcome = if retry::is_rate_limited(error) {
                        Outcome::RateLimited
                    } else {
                        Outcome::Error
                    };
                    metrics::record_rest_call(outcome);
                    tracing::debug!(cache_key = ?task.cache_key, error = %error, "Throttled call failed");
                }
            }

            let waiters = task
                .cache_key
                .as_ref()
                .and_then(|key| inner.state.lock().joined.remove(key))
                .unwrap_or_default();
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
            let _ = task.reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::infrastructure::clock::TokioClock;

    fn queue(min_delay: Duration) -> ThrottleQueue<u32> {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        ThrottleQueue::new(
            ThrottleSettings {
                min_delay,
                cache_ttl: Duration::from_secs(5),
            },
            Arc::new(CacheStore::new(Arc::clone(&clock))),
            clock,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_are_spaced_by_min_delay() {
        let queue = queue(Duration::from_millis(100));
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let calls = (0..3).map(|i| {
            let stamps = Arc::clone(&stamps);
            queue.throttle(
                move || async move {
                    stamps.lock().push(Instant::now());
                    Ok(i)
                },
                None,
            )
        });
        let results = futures::future::join_all(calls).await;
        assert_eq!(results, vec![Ok(0), Ok(1), Ok(2)]);

        let stamps = stamps.lock();
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn calls_run_in_arrival_order() {
        let queue = queue(Duration::from_millis(10));
        let order = Arc::new(Mutex::new(Vec::new()));

        let calls = (0..5).map(|i| {
            let order = Arc::clone(&order);
            queue.throttle(
                move || async move {
                    order.lock().push(i);
                    Ok(i)
                },
                None,
            )
        });
        futures::future::join_all(calls).await;

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_same_key_calls_share_one_request() {
        let queue = queue(Duration::from_millis(100));
        let invocations = Arc::new(AtomicU32::new(0));

        let make_call = || {
            let invocations = Arc::clone(&invocations);
            move || async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(42)
            }
        };

        let (a, b) = tokio::join!(
            queue.throttle(make_call(), Some("klines:BTCUSDT:1m")),
            queue.throttle(make_call(), Some("klines:BTCUSDT:1m")),
        );

        assert_eq!(a, Ok(42));
        assert_eq!(b, Ok(42));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_value_skips_the_call() {
        let queue = queue(Duration::from_millis(100));
        let invocations = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let invocations = Arc::clone(&invocations);
            let value = queue
                .throttle(
                    move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        Ok(7)
                    },
                    Some("ticker/24hr:BTCUSDT:"),
                )
                .await;
            assert_eq!(value, Ok(7));
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(queue.cache().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_returned_and_not_cached() {
        let queue = queue(Duration::from_millis(100));
        let invocations = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let invocations = Arc::clone(&invocations);
            let result = queue
                .throttle(
                    move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        Err(FeedError::http(503, "unavailable"))
                    },
                    Some("depth:BTCUSDT:20"),
                )
                .await;
            assert_eq!(result, Err(FeedError::http(503, "unavailable")));
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert!(queue.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_call_does_not_stall_queue() {
        let queue = queue(Duration::from_millis(10));

        let failed = queue
            .throttle(
                || async {
                    let result: Result<u32, FeedError> = Err(FeedError::QueueClosed);
                    assert!(result.is_ok(), "boom");
                    result
                },
                None,
            )
            .await;
        assert!(matches!(failed, Err(FeedError::Network(_))));

        let next = queue.throttle(|| async { Ok(1) }, None).await;
        assert_eq!(next, Ok(1));
    }
}
