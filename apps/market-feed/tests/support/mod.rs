//! Shared fakes for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::Instant;

use market_feed::application::ports::{InboundFrame, RestRequest};
use market_feed::infrastructure::clock::TokioClock;
use market_feed::{
    ChannelKind, DataAcquisitionFacade, FeedConfig, FeedError, FeedEvent, MarketData,
    MarketUpdate, RestTransport, StreamConnection, StreamTransport, Symbol, Ticker, Topic,
    Transports, UpdateSource,
};

// =============================================================================
// Streaming
// =============================================================================

/// What the next `connect` call does.
pub enum Script {
    /// Handshake fails.
    Refuse,
    /// Handshake succeeds, the frames are delivered, then the peer closes.
    Accept(Vec<InboundFrame>),
    /// Handshake succeeds and the connection stays open; feed it with
    /// [`ScriptedTransport::push`].
    Live,
}

/// Stream transport that follows a script, refusing once it runs out.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    connects: Mutex<Vec<(Instant, Vec<Topic>)>>,
    live: Mutex<Option<mpsc::UnboundedSender<InboundFrame>>>,
    requests: Arc<Mutex<Vec<(&'static str, Topic)>>>,
    closes: Arc<AtomicU32>,
}

impl ScriptedTransport {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            ..Self::default()
        })
    }

    /// Transport that refuses every connect until scripted otherwise.
    pub fn refusing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue more scripted connects.
    pub fn script(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    /// Instants of every connect call.
    pub fn connect_times(&self) -> Vec<Instant> {
        self.connects.lock().iter().map(|(at, _)| *at).collect()
    }

    /// Topics requested in the most recent connect call.
    pub fn last_connect_topics(&self) -> Vec<Topic> {
        self.connects
            .lock()
            .last()
            .map(|(_, topics)| topics.clone())
            .unwrap_or_default()
    }

    /// Live subscribe/unsubscribe requests, in order.
    pub fn requests(&self) -> Vec<(&'static str, Topic)> {
        self.requests.lock().clone()
    }

    /// Connections closed by the client.
    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Deliver a frame on the live connection.
    pub fn push(&self, frame: InboundFrame) {
        let live = self.live.lock();
        live.as_ref().expect("no live connection").send(frame).unwrap();
    }

    /// Drop the live connection as if the peer went away.
    pub fn drop_live(&self) {
        self.live.lock().take();
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn connect(
        &self,
        _kind: ChannelKind,
        topics: &[Topic],
    ) -> Result<Box<dyn StreamConnection>, FeedError> {
        self.connects.lock().push((Instant::now(), topics.to_vec()));
        let script = self.scripts.lock().pop_front().unwrap_or(Script::Refuse);

        let (tx, rx) = mpsc::unbounded_channel();
        match script {
            Script::Refuse => return Err(FeedError::Transport("connection refused".to_string())),
            Script::Accept(frames) => {
                for frame in frames {
                    tx.send(frame).unwrap();
                }
            }
            Script::Live => {
                *self.live.lock() = Some(tx);
            }
        }

        Ok(Box::new(ScriptedConnection {
            frames: rx,
            requests: Arc::clone(&self.requests),
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct ScriptedConnection {
    frames: mpsc::UnboundedReceiver<InboundFrame>,
    requests: Arc<Mutex<Vec<(&'static str, Topic)>>>,
    closes: Arc<AtomicU32>,
}

#[async_trait]
impl StreamConnection for ScriptedConnection {
    async fn subscribe(&mut self, topics: &[Topic]) -> Result<(), FeedError> {
        let mut requests = self.requests.lock();
        requests.extend(topics.iter().map(|t| ("SUBSCRIBE", t.clone())));
        Ok(())
    }

    async fn unsubscribe(&mut self, topics: &[Topic]) -> Result<(), FeedError> {
        let mut requests = self.requests.lock();
        requests.extend(topics.iter().map(|t| ("UNSUBSCRIBE", t.clone())));
        Ok(())
    }

    async fn next_frame(&mut self) -> InboundFrame {
        self.frames
            .recv()
            .await
            .unwrap_or(InboundFrame::Closed { code: Some(1006) })
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// REST
// =============================================================================

/// REST transport answering every request with a ticker, after an optional
/// run of scripted failures.
#[derive(Default)]
pub struct FakeRest {
    calls: AtomicU32,
    failures: Mutex<VecDeque<FeedError>>,
    requests: Mutex<Vec<RestRequest>>,
}

impl FakeRest {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_first(errors: impl IntoIterator<Item = FeedError>) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(errors.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RestRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl RestTransport for FakeRest {
    async fn fetch(&self, request: &RestRequest) -> Result<MarketData, FeedError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        Ok(ticker(&request.symbol, Decimal::from(call)))
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub fn ticker(symbol: &Symbol, last_price: Decimal) -> MarketData {
    MarketData::Ticker(Ticker {
        symbol: symbol.clone(),
        last_price,
        open_price: Decimal::ONE,
        high_price: Decimal::TEN,
        low_price: Decimal::ONE,
        volume: Decimal::ONE_HUNDRED,
        quote_volume: Decimal::ONE_THOUSAND,
        price_change: Decimal::ZERO,
        price_change_percent: Decimal::ZERO,
        event_time: Utc::now(),
    })
}

/// A streamed ticker update for `topic`.
pub fn stream_update(topic: &Topic) -> InboundFrame {
    InboundFrame::Update(MarketUpdate {
        topic: topic.clone(),
        source: UpdateSource::Stream,
        data: ticker(&topic.symbol, Decimal::TWO),
        received_at: Utc::now(),
    })
}

/// Configuration with fast, deterministic timings.
pub fn test_config() -> FeedConfig {
    let mut config = FeedConfig::default();
    config.throttle.min_delay = Duration::from_millis(100);
    config.throttle.cache_ttl = Duration::from_secs(5);
    config.stream.initial_backoff = Duration::from_secs(1);
    config.stream.max_reconnect_attempts = 5;
    config.fallback.poll_interval = Duration::from_secs(1);
    config
}

pub fn facade(
    config: FeedConfig,
    rest: &Arc<FakeRest>,
    stream: &Arc<ScriptedTransport>,
) -> DataAcquisitionFacade {
    DataAcquisitionFacade::new(
        config,
        Transports {
            rest: Arc::clone(rest) as Arc<dyn RestTransport>,
            stream: Arc::clone(stream) as Arc<dyn StreamTransport>,
        },
        Arc::new(TokioClock),
    )
}

/// Collects every event delivered to a handler.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<(Instant, FeedEvent)>>>,
}

impl Recorder {
    pub fn handler(&self) -> impl Fn(&FeedEvent) + Send + Sync + 'static {
        let events = Arc::clone(&self.events);
        move |event| events.lock().push((Instant::now(), event.clone()))
    }

    pub fn events(&self) -> Vec<FeedEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    /// Arrival instants of updates from `source`.
    pub fn update_times(&self, source: UpdateSource) -> Vec<Instant> {
        self.events
            .lock()
            .iter()
            .filter_map(|(at, e)| match e {
                FeedEvent::Update(update) if update.source == source => Some(*at),
                _ => None,
            })
            .collect()
    }
}
