//! Connection Manager
//!
//! Maintains one streaming connection per channel kind.
//!
//! # State Machine
//!
//! ```text
//! Idle ─► Connecting ─ok─► Open ─close/error/idle─► Reconnecting
//!             │                                        │  │
//!             └─handshake failed/timed out────────────►┘  │ sleep next_delay(attempt)
//!                                                         ▼
//!                                  attempt < max ──► Connecting
//!                                  attempt ≥ max ──► FallbackActive
//!                                                      │ poll via REST,
//!                                                      │ retry at capped delay
//!                                                      └─ok─► Open (polling stops)
//!
//! last topic removed / shutdown ──► Closed
//! ```
//!
//! The backoff resets once a connection delivers its first update; a
//! connection that drops before delivering data keeps escalating the delay.
//! A handshake still pending after `connect_timeout` counts as failed.
//! Any close the manager did not initiate reconnects, whatever its code.
//!
//! # Ownership
//!
//! Each channel's state lives in its worker task. The manager keeps the
//! channel's topic set (the source of truth for what should be carried) and
//! talks to the worker over an unbounded command channel. Fallback polling
//! is started and stopped under the manager lock so a retired worker can
//! never restart polling for a topic that was already removed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::StreamSettings;
use crate::application::ports::{Clock, InboundFrame, StreamConnection, StreamTransport};
use crate::domain::connection::{BackoffState, ConnectionState, StateTransition};
use crate::domain::market::{ChannelKind, FeedEvent, MarketUpdate, Topic};
use crate::domain::subscription::SubscriptionRegistry;
use crate::error::FeedError;
use crate::infrastructure::fallback::FallbackPoller;
use crate::infrastructure::metrics;
use crate::infrastructure::retry;

/// Capacity of the state transition broadcast.
const TRANSITION_CAPACITY: usize = 256;

// =============================================================================
// Shared State
// =============================================================================

#[derive(Debug)]
enum Command {
    Add(Topic),
    Remove(Topic),
    Shutdown,
}

struct WorkerHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    topics: BTreeSet<Topic>,
    state: Arc<RwLock<ConnectionState>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Workers {
    active: HashMap<ChannelKind, WorkerHandle>,
    retired: HashSet<ChannelKind>,
    next_generation: u64,
}

struct Shared {
    settings: StreamSettings,
    transport: Arc<dyn StreamTransport>,
    registry: Arc<SubscriptionRegistry>,
    poller: Arc<FallbackPoller>,
    clock: Arc<dyn Clock>,
    workers: Mutex<Workers>,
    transitions: broadcast::Sender<StateTransition>,
    shutdown: CancellationToken,
}

impl Shared {
    /// Start polling every topic of the channel, if `generation` is current.
    fn start_fallback(&self, kind: ChannelKind, generation: u64) {
        let workers = self.workers.lock();
        if let Some(handle) = workers.active.get(&kind)
            && handle.generation == generation
        {
            for topic in &handle.topics {
                self.poller.start(topic, None);
            }
        }
    }

    /// Start polling one topic, if `generation` is current and still carries it.
    fn start_fallback_topic(&self, kind: ChannelKind, generation: u64, topic: &Topic) {
        let workers = self.workers.lock();
        if let Some(handle) = workers.active.get(&kind)
            && handle.generation == generation
            && handle.topics.contains(topic)
        {
            self.poller.start(topic, None);
        }
    }

    /// Stop polling every topic of the channel, if `generation` is current.
    fn stop_fallback(&self, kind: ChannelKind, generation: u64) {
        let workers = self.workers.lock();
        if let Some(handle) = workers.active.get(&kind)
            && handle.generation == generation
        {
            for topic in &handle.topics {
                self.poller.stop(topic);
            }
        }
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Maintains live streaming subscriptions per channel kind.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let workers = self.shared.workers.lock();
        f.debug_struct("ConnectionManager")
            .field("settings", &self.shared.settings)
            .field("channels", &workers.active.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager. No connection is opened until a topic is added.
    #[must_use]
    pub fn new(
        settings: StreamSettings,
        transport: Arc<dyn StreamTransport>,
        registry: Arc<SubscriptionRegistry>,
        poller: Arc<FallbackPoller>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                settings,
                transport,
                registry,
                poller,
                clock,
                workers: Mutex::new(Workers::default()),
                transitions,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Carry a topic on its channel's connection, opening it if needed.
    pub fn add_topic(&self, topic: &Topic) {
        if self.shared.shutdown.is_cancelled() {
            tracing::debug!(topic = %topic, "Ignoring topic added after shutdown");
            return;
        }

        let kind = topic.kind();
        let mut workers = self.shared.workers.lock();

        if let Some(handle) = workers.active.get_mut(&kind) {
            if !handle.topics.insert(topic.clone()) {
                return;
            }
            if handle.commands.send(Command::Add(topic.clone())).is_ok() {
                return;
            }
            // Worker is gone; replace it with one carrying every topic.
            tracing::warn!(channel = %kind, "Stream worker stopped unexpectedly, restarting");
            if let Some(dead) = workers.active.remove(&kind) {
                self.spawn_worker(&mut workers, kind, dead.topics);
            }
            return;
        }

        self.spawn_worker(&mut workers, kind, BTreeSet::from([topic.clone()]));
    }

    /// Stop carrying a topic. Closes the channel when its last topic goes.
    pub fn remove_topic(&self, topic: &Topic) {
        let kind = topic.kind();
        let mut workers = self.shared.workers.lock();

        let Some(handle) = workers.active.get_mut(&kind) else {
            return;
        };
        if !handle.topics.remove(topic) {
            return;
        }
        self.shared.poller.stop(topic);

        if handle.topics.is_empty() {
            let _ = handle.commands.send(Command::Shutdown);
            handle.cancel.cancel();
            workers.active.remove(&kind);
            workers.retired.insert(kind);
            tracing::info!(channel = %kind, "Last topic removed, closing stream");
        } else {
            let _ = handle.commands.send(Command::Remove(topic.clone()));
        }
    }

    /// Current connection state of a channel.
    #[must_use]
    pub fn state(&self, kind: ChannelKind) -> ConnectionState {
        let workers = self.shared.workers.lock();
        match workers.active.get(&kind) {
            Some(handle) => *handle.state.read(),
            None if workers.retired.contains(&kind) => ConnectionState::Closed,
            None => ConnectionState::Idle,
        }
    }

    /// Stream of state transitions across all channels.
    #[must_use]
    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.shared.transitions.subscribe()
    }

    /// Topics carried on a channel.
    #[must_use]
    pub fn topics(&self, kind: ChannelKind) -> Vec<Topic> {
        self.shared
            .workers
            .lock()
            .active
            .get(&kind)
            .map(|handle| handle.topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Close every channel and stop its fallback polling.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();

        let mut workers = self.shared.workers.lock();
        let kinds: Vec<ChannelKind> = workers.active.keys().copied().collect();
        for kind in kinds {
            if let Some(handle) = workers.active.remove(&kind) {
                for topic in &handle.topics {
                    self.shared.poller.stop(topic);
                }
                let _ = handle.commands.send(Command::Shutdown);
                workers.retired.insert(kind);
            }
        }
    }

    fn spawn_worker(&self, workers: &mut Workers, kind: ChannelKind, topics: BTreeSet<Topic>) {
        let generation = workers.next_generation;
        workers.next_generation += 1;
        workers.retired.remove(&kind);

        let (commands, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnectionState::Idle));
        let settings = self.shared.settings;
        let cancel = self.shared.shutdown.child_token();

        let worker = Worker {
            kind,
            generation,
            shared: Arc::clone(&self.shared),
            commands: receiver,
            topics: topics.clone(),
            state: Arc::clone(&state),
            backoff: BackoffState::new(settings.initial_backoff, settings.max_reconnect_attempts),
            cancel: cancel.clone(),
        };

        workers.active.insert(
            kind,
            WorkerHandle {
                generation,
                commands,
                topics,
                state,
                cancel,
            },
        );
        tokio::spawn(worker.run());
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

// =============================================================================
// Channel Worker
// =============================================================================

enum Exit {
    Shutdown,
    Failed(String),
}

struct Worker {
    kind: ChannelKind,
    generation: u64,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    topics: BTreeSet<Topic>,
    state: Arc<RwLock<ConnectionState>>,
    backoff: BackoffState,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        self.transition(ConnectionState::Connecting);

        loop {
            let keep_running = match self.current() {
                ConnectionState::Connecting => self.on_connecting().await,
                ConnectionState::Reconnecting => self.on_reconnecting().await,
                ConnectionState::FallbackActive => self.on_fallback().await,
                ConnectionState::Idle | ConnectionState::Open | ConnectionState::Closed => false,
            };
            if !keep_running {
                break;
            }
        }

        self.transition(ConnectionState::Closed);
    }

    fn current(&self) -> ConnectionState {
        *self.state.read()
    }

    fn transition(&self, to: ConnectionState) {
        let from = std::mem::replace(&mut *self.state.write(), to);
        if from == to {
            return;
        }

        tracing::info!(channel = %self.kind, from = %from, to = %to, "Connection state changed");
        metrics::set_connection_state(self.kind, to);
        let _ = self.shared.transitions.send(StateTransition {
            kind: self.kind,
            from,
            to,
        });
    }

    async fn on_connecting(&mut self) -> bool {
        match self.connect().await {
            None => false,
            Some(Ok(connection)) => self.run_connection(connection).await,
            Some(Err(error)) => {
                tracing::warn!(channel = %self.kind, error = %error, "Stream handshake failed");
                self.transition(ConnectionState::Reconnecting);
                true
            }
        }
    }

    async fn on_reconnecting(&mut self) -> bool {
        if self.backoff.exhausted() {
            tracing::warn!(
                channel = %self.kind,
                attempts = self.backoff.attempt,
                "Reconnect attempts exhausted, falling back to REST polling"
            );
            self.transition(ConnectionState::FallbackActive);
            self.shared.start_fallback(self.kind, self.generation);
            return true;
        }

        let delay = retry::next_delay(self.backoff.attempt, self.backoff.base_delay);
        self.backoff.attempt += 1;
        metrics::record_reconnect(self.kind);
        tracing::info!(
            channel = %self.kind,
            attempt = self.backoff.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling reconnect"
        );

        if !self.wait(delay).await {
            return false;
        }
        self.transition(ConnectionState::Connecting);
        true
    }

    async fn on_fallback(&mut self) -> bool {
        let delay = retry::next_delay(self.backoff.capped_attempt(), self.backoff.base_delay);
        if !self.wait(delay).await {
            return false;
        }

        metrics::record_reconnect(self.kind);
        match self.connect().await {
            None => false,
            Some(Ok(connection)) => self.run_connection(connection).await,
            Some(Err(error)) => {
                tracing::debug!(channel = %self.kind, error = %error, "Background reconnect failed");
                true
            }
        }
    }

    async fn connect(&mut self) -> Option<Result<Box<dyn StreamConnection>, FeedError>> {
        if !self.drain_commands() {
            return None;
        }

        let topics: Vec<Topic> = self.topics.iter().cloned().collect();
        let transport = Arc::clone(&self.shared.transport);
        let clock = Arc::clone(&self.shared.clock);
        let connect_timeout = self.shared.settings.connect_timeout;
        tokio::select! {
            () = self.cancel.cancelled() => None,
            result = transport.connect(self.kind, &topics) => Some(result),
            () = clock.sleep(connect_timeout) => Some(Err(FeedError::Transport(format!(
                "handshake timed out after {connect_timeout:?}"
            )))),
        }
    }

    async fn run_connection(&mut self, mut connection: Box<dyn StreamConnection>) -> bool {
        self.transition(ConnectionState::Open);
        self.shared.stop_fallback(self.kind, self.generation);

        match self.pump(connection.as_mut()).await {
            Exit::Shutdown => {
                connection.close().await;
                false
            }
            Exit::Failed(reason) => {
                tracing::warn!(channel = %self.kind, reason = %reason, "Stream connection lost");
                connection.close().await;
                self.transition(ConnectionState::Reconnecting);
                true
            }
        }
    }

    /// Receive frames until the connection fails or the worker stops.
    async fn pump(&mut self, connection: &mut dyn StreamConnection) -> Exit {
        let clock = Arc::clone(&self.shared.clock);
        let idle_timeout = self.shared.settings.idle_timeout;
        let mut last_frame_at = clock.now();
        let mut delivered = false;

        loop {
            let idle_left =
                idle_timeout.saturating_sub(clock.now().saturating_duration_since(last_frame_at));

            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return Exit::Shutdown,

                command = self.commands.recv() => {
                    if let Err(exit) = self.apply_live(connection, command).await {
                        return exit;
                    }
                }

                frame = connection.next_frame() => {
                    last_frame_at = clock.now();
                    match frame {
                        InboundFrame::Update(update) => {
                            if !delivered {
                                delivered = true;
                                self.backoff.reset();
                            }
                            self.deliver(update);
                        }
                        InboundFrame::Ignored => {}
                        InboundFrame::Malformed(reason) => {
                            tracing::warn!(channel = %self.kind, reason = %reason, "Dropping malformed frame");
                            metrics::record_stream_message_dropped(self.kind);
                        }
                        InboundFrame::Closed { code } => {
                            return Exit::Failed(format!("closed by peer (code {code:?})"));
                        }
                        InboundFrame::Error(error) => return Exit::Failed(error.to_string()),
                    }
                }

                () = clock.sleep(idle_left) => {
                    return Exit::Failed(format!("no frames for {idle_timeout:?}"));
                }
            }
        }
    }

    fn deliver(&self, update: MarketUpdate) {
        if update.topic.kind() != self.kind || !self.topics.contains(&update.topic) {
            tracing::trace!(channel = %self.kind, topic = %update.topic, "Ignoring update for uncarried topic");
            return;
        }

        metrics::record_stream_message(self.kind);
        let delivered = self.shared.registry.dispatch(&FeedEvent::Update(update));
        tracing::trace!(channel = %self.kind, delivered, "Stream update dispatched");
    }

    /// Apply a command while connected.
    async fn apply_live(
        &mut self,
        connection: &mut dyn StreamConnection,
        command: Option<Command>,
    ) -> Result<(), Exit> {
        match command {
            Some(Command::Add(topic)) => {
                if self.topics.insert(topic.clone()) {
                    connection
                        .subscribe(slice::from_ref(&topic))
                        .await
                        .map_err(|e| Exit::Failed(format!("subscribe failed: {e}")))?;
                }
                Ok(())
            }
            Some(Command::Remove(topic)) => {
                if self.topics.remove(&topic) {
                    connection
                        .unsubscribe(slice::from_ref(&topic))
                        .await
                        .map_err(|e| Exit::Failed(format!("unsubscribe failed: {e}")))?;
                }
                Ok(())
            }
            Some(Command::Shutdown) | None => Err(Exit::Shutdown),
        }
    }

    /// Apply a command while disconnected. Returns `false` to stop.
    fn apply_offline(&mut self, command: Option<Command>) -> bool {
        match command {
            Some(Command::Add(topic)) => {
                self.topics.insert(topic.clone());
                if self.current() == ConnectionState::FallbackActive {
                    self.shared.start_fallback_topic(self.kind, self.generation, &topic);
                }
                true
            }
            Some(Command::Remove(topic)) => {
                self.topics.remove(&topic);
                true
            }
            Some(Command::Shutdown) | None => false,
        }
    }

    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    if !self.apply_offline(Some(command)) {
                        return false;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Sleep while still handling commands. Returns `false` to stop.
    async fn wait(&mut self, delay: Duration) -> bool {
        let clock = Arc::clone(&self.shared.clock);
        let mut sleep = clock.sleep(delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = &mut sleep => return true,
                command = self.commands.recv() => {
                    if !self.apply_offline(command) {
                        return false;
                    }
                }
            }
        }
    }
}
