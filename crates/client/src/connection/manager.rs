//! Connection manager owning the single STOMP session for the signed-in user.
//!
//! The manager is an injectable service: build one per session, clone it
//! into whatever needs to send or subscribe, and call
//! [`ConnectionManager::disconnect`] on logout.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use parley_shared::stomp::{HEADER_MESSAGE, HEADER_SUBSCRIPTION};
use parley_shared::{topics, Command, Frame, Ping, PresenceAnnounce, UserId};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{ConnectError, ConnectionState, FrameSink};
use crate::auth::{CurrentUser, TokenProvider};
use crate::config::ChatConfig;
use crate::events::{ChatEvent, EventBus};
use crate::router::{Handler, InboundFrame, Revoke, SubscriptionHandle, SubscriptionRouter};
use crate::transport::{Transport, TransportError, WireChannel};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The live transport.
struct Session {
    outgoing: UnboundedSender<String>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    identity: Option<CurrentUser>,
    /// User whose subscriptions sit in the router and `boot`. Outlives
    /// `identity` across failed attempts.
    owner: Option<UserId>,
    reconnect_attempts: u32,
    /// Bumped whenever a session is discarded. Tasks holding an older value
    /// are stale and must not touch state.
    generation: u64,
    session: Option<Session>,
    health_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    boot: Vec<SubscriptionHandle>,
}

struct Inner<T: Transport> {
    config: ChatConfig,
    transport: T,
    tokens: Arc<dyn TokenProvider>,
    events: EventBus,
    state: watch::Sender<ConnectionState>,
    // Lock order: shared, then router. `state` may be updated under either.
    shared: Mutex<Shared>,
    router: Mutex<SubscriptionRouter>,
}

/// Handle to the process-wide chat connection.
pub struct ConnectionManager<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(config: ChatConfig, transport: T, tokens: impl TokenProvider + 'static) -> Self {
        Self::with_events(config, transport, tokens, EventBus::new())
    }

    pub fn with_events(
        config: ChatConfig,
        transport: T,
        tokens: impl TokenProvider + 'static,
        events: EventBus,
    ) -> Self {
        let (state, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                tokens: Arc::new(tokens),
                events,
                state,
                shared: Mutex::new(Shared::default()),
                router: Mutex::new(SubscriptionRouter::new()),
            }),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.inner.shared).reconnect_attempts
    }

    /// The user the connection is bound to.
    pub fn identity(&self) -> Option<CurrentUser> {
        lock(&self.inner.shared).identity.clone()
    }

    /// Number of live subscriptions, boot subscriptions included.
    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.router).len()
    }

    /// Open the session for `user`.
    ///
    /// Idempotent: while an attempt is in flight, later callers wait for its
    /// outcome instead of opening a second transport, and an existing session
    /// for the same user is reused. A session bound to another user is torn
    /// down first.
    pub async fn connect(&self, user: &CurrentUser) -> Result<(), ConnectError> {
        let mut rx = self.inner.state.subscribe();
        let generation = loop {
            let current = rx.borrow_and_update().clone();
            match current {
                ConnectionState::Connected => {
                    let bound = lock(&self.inner.shared).identity.as_ref().map(|u| u.id);
                    if bound == Some(user.id) {
                        return Ok(());
                    }
                    tracing::info!(
                        "Connection is bound to {:?}, reconnecting as {}",
                        bound,
                        user.id
                    );
                    self.disconnect();
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                    if rx.changed().await.is_err() {
                        return Err(ConnectError::AttemptFailed);
                    }
                    if *rx.borrow() == ConnectionState::Disconnected {
                        return Err(ConnectError::AttemptFailed);
                    }
                }
                ConnectionState::Disconnected => {
                    if let Some(generation) = self.inner.claim_connecting(user) {
                        break generation;
                    }
                }
            }
        };

        match self.inner.establish(generation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!("Connect as {} failed: {}", user.id, e);
                self.inner.abandon(generation);
                Err(e)
            }
        }
    }

    /// Send a JSON payload to `destination`.
    ///
    /// Returns `false` without side effects when not connected. The current
    /// bearer token is attached to every frame.
    pub fn send<P: Serialize + ?Sized>(&self, destination: &str, payload: &P) -> bool {
        self.inner.send(destination, payload)
    }

    /// Subscribe `handler` to `topic`.
    ///
    /// Returns `None` when not connected. Handlers run one at a time on the
    /// connection's reader task, in arrival order.
    pub fn subscribe_to_topic<F>(&self, topic: &str, handler: F) -> Option<SubscriptionHandle>
    where
        F: Fn(&InboundFrame) + Send + Sync + 'static,
    {
        self.inner.subscribe(topic, Arc::new(handler))
    }

    /// Tear the session down and reset to the initial state.
    ///
    /// State is reset before the transport is touched, so cleanup holds even
    /// when closing fails. Calling this twice is harmless.
    pub fn disconnect(&self) {
        self.inner.shutdown();
    }
}

impl<T: Transport> FrameSink for ConnectionManager<T> {
    fn send_frame(&self, destination: &str, payload: &Value) -> bool {
        self.send(destination, payload)
    }
}

impl<T: Transport> Inner<T> {
    fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.shared).generation == generation
    }

    /// Publish a state change. Caller holds `shared` when ordering matters.
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            tracing::debug!("Connection state {:?} -> {:?}", previous, next);
            self.events.emit(ChatEvent::ConnectionStateChanged(next));
        }
    }

    /// Move Disconnected -> Connecting for `user`, returning the generation
    /// owned by the new attempt.
    fn claim_connecting(&self, user: &CurrentUser) -> Option<u64> {
        let mut shared = lock(&self.shared);
        let claimed = self.state.send_if_modified(|s| {
            if *s == ConnectionState::Disconnected {
                *s = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return None;
        }
        self.events
            .emit(ChatEvent::ConnectionStateChanged(ConnectionState::Connecting));

        if shared.owner.is_some_and(|owner| owner != user.id) {
            // Subscriptions left over from another user's session
            shared.boot.clear();
            lock(&self.router).clear();
        }
        shared.generation += 1;
        shared.owner = Some(user.id);
        shared.identity = Some(user.clone());
        Some(shared.generation)
    }

    /// Open a transport, run the STOMP handshake and install the session.
    async fn establish(self: &Arc<Self>, generation: u64) -> Result<(), ConnectError> {
        let token = self
            .tokens
            .auth_token()
            .ok_or(ConnectError::MissingCredential)?;

        let WireChannel {
            outgoing,
            mut incoming,
        } = self.transport.open(&self.config.server_url).await?;

        outgoing
            .unbounded_send(Frame::connect(&self.config.host(), Some(&token)).encode())
            .map_err(|_| TransportError::Closed)?;

        let reply = tokio::time::timeout(self.config.connect_timeout, next_frame(&mut incoming))
            .await
            .map_err(|_| ConnectError::Timeout)?;
        match reply {
            Some(frame) if frame.command == Command::Connected => {}
            Some(frame) if frame.command == Command::Error => {
                let reason = frame
                    .get(HEADER_MESSAGE)
                    .map(str::to_string)
                    .unwrap_or(frame.body);
                return Err(ConnectError::Rejected(reason));
            }
            Some(frame) => {
                return Err(ConnectError::Protocol(format!(
                    "expected CONNECTED, got {}",
                    frame.command
                )))
            }
            None => return Err(TransportError::Closed.into()),
        }

        let user_id = {
            let mut shared = lock(&self.shared);
            if shared.generation != generation {
                return Err(ConnectError::Cancelled);
            }
            let reader = tokio::spawn(read_loop(Arc::downgrade(self), incoming, generation));
            shared.session = Some(Session { outgoing, reader });
            shared.reconnect_attempts = 0;
            self.set_state(ConnectionState::Connected);
            shared.identity.as_ref().map(|u| u.id)
        };
        tracing::info!("Connected to {} as {:?}", self.config.server_url, user_id);

        // Subscriptions survive transport loss; replay them on the new session
        let replay = lock(&self.router).active();
        for (id, topic) in replay {
            self.write_frame(&Frame::subscribe(&id, &topic));
        }

        if let Some(user_id) = user_id {
            self.boot_subscriptions(user_id);
            self.send(topics::PRESENCE_ANNOUNCE, &PresenceAnnounce { user_id });
        }
        self.start_health_check(generation);
        Ok(())
    }

    /// Undo a failed attempt so the next connect starts clean.
    fn abandon(&self, generation: u64) {
        let mut shared = lock(&self.shared);
        if shared.generation != generation {
            // A disconnect already reset everything
            return;
        }
        shared.generation += 1;
        shared.identity = None;
        if let Some(session) = shared.session.take() {
            session.reader.abort();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn boot_subscriptions(self: &Arc<Self>, user_id: UserId) {
        if !lock(&self.shared).boot.is_empty() {
            return;
        }

        let notify = self.events.clone();
        let rooms = self.events.clone();
        let pings = self.events.clone();
        let boot: [(String, Handler); 3] = [
            (
                topics::notifications(user_id),
                Arc::new(move |f: &InboundFrame| {
                    notify.emit(ChatEvent::NotificationReceived(f.body.clone()))
                }),
            ),
            (
                topics::room_events(user_id),
                Arc::new(move |f: &InboundFrame| {
                    rooms.emit(ChatEvent::RoomEventReceived(f.body.clone()))
                }),
            ),
            (
                topics::ping_responses(user_id),
                Arc::new(move |f: &InboundFrame| pings.emit(ChatEvent::PingResponse(f.body.clone()))),
            ),
        ];

        let handles: Vec<SubscriptionHandle> = boot
            .into_iter()
            .filter_map(|(topic, handler)| self.subscribe(&topic, handler))
            .collect();
        lock(&self.shared).boot = handles;
    }

    fn subscribe(self: &Arc<Self>, topic: &str, handler: Handler) -> Option<SubscriptionHandle> {
        if !self.is_connected() {
            tracing::debug!("Not connected, refusing subscription to {}", topic);
            return None;
        }
        let id = lock(&self.router).register(topic, handler);
        self.write_frame(&Frame::subscribe(&id, topic));
        tracing::debug!("Subscribed {} to {}", id, topic);

        let weak: Weak<Inner<T>> = Arc::downgrade(self);
        let revoker: Weak<dyn Revoke> = weak;
        Some(SubscriptionHandle::new(id, topic.to_string(), revoker))
    }

    fn send<P: Serialize + ?Sized>(self: &Arc<Self>, destination: &str, payload: &P) -> bool {
        if !self.is_connected() {
            tracing::debug!("Not connected, dropping frame for {}", destination);
            return false;
        }
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("Failed to serialize frame for {}: {}", destination, e);
                return false;
            }
        };
        let token = self.tokens.auth_token();
        if token.is_none() {
            tracing::warn!("Sending to {} without a bearer token", destination);
        }
        self.write_frame(&Frame::send(destination, token.as_deref(), body))
    }

    /// Queue a frame on the live transport. A refused write means the
    /// transport is gone, which starts recovery.
    fn write_frame(self: &Arc<Self>, frame: &Frame) -> bool {
        let failed_generation = {
            let shared = lock(&self.shared);
            let Some(session) = shared.session.as_ref() else {
                return false;
            };
            match session.outgoing.unbounded_send(frame.encode()) {
                Ok(()) => return true,
                Err(_) => shared.generation,
            }
        };
        tracing::warn!("Transport refused {} frame", frame.command);
        self.schedule_reconnect(failed_generation);
        false
    }

    fn start_health_check(self: &Arc<Self>, generation: u64) {
        let period = self.config.health_check_interval;
        if period.is_zero() {
            tracing::debug!("Health check disabled");
            return;
        }

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.is_current(generation) {
                    return;
                }
                if !inner.ping() {
                    tracing::warn!("Health check failed");
                    inner.schedule_reconnect(generation);
                    return;
                }
            }
        });

        let mut shared = lock(&self.shared);
        if shared.generation != generation {
            task.abort();
            return;
        }
        if let Some(previous) = shared.health_task.replace(task) {
            previous.abort();
        }
    }

    fn ping(self: &Arc<Self>) -> bool {
        if !self.is_connected() {
            return false;
        }
        let user_id = lock(&self.shared).identity.as_ref().map(|u| u.id);
        let Some(user_id) = user_id else {
            return false;
        };
        self.send(
            topics::PING,
            &Ping {
                user_id,
                timestamp: Utc::now().timestamp_millis(),
            },
        )
    }

    /// The session of `generation` is gone.
    fn connection_lost(self: &Arc<Self>, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        tracing::warn!("Connection lost");
        self.schedule_reconnect(generation);
    }

    /// Start the bounded reconnect loop unless one is already running.
    fn schedule_reconnect(self: &Arc<Self>, generation: u64) {
        let mut shared = lock(&self.shared);
        if shared.generation != generation {
            return;
        }
        // Only a live session can enter recovery; the Reconnecting state is
        // the guard against overlapping loops.
        let claimed = self.state.send_if_modified(|s| {
            if *s == ConnectionState::Connected {
                *s = ConnectionState::Reconnecting { attempt: 0 };
                true
            } else {
                false
            }
        });
        if !claimed {
            return;
        }
        self.events
            .emit(ChatEvent::ConnectionStateChanged(ConnectionState::Reconnecting {
                attempt: 0,
            }));

        shared.generation += 1;
        let next = shared.generation;
        if let Some(session) = shared.session.take() {
            session.reader.abort();
        }
        if let Some(task) = shared.health_task.take() {
            task.abort();
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let task = runtime.spawn(reconnect_loop(Arc::downgrade(self), next));
                if let Some(previous) = shared.reconnect_task.replace(task) {
                    previous.abort();
                }
            }
            Err(_) => {
                tracing::error!("No async runtime available to reconnect");
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(Some(frame)) => frame,
            // Heart-beat
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Dropping undecodable frame: {}", e);
                return;
            }
        };

        match frame.command {
            Command::Message => self.dispatch(frame),
            Command::Error => {
                tracing::error!(
                    "Server error: {}",
                    frame.get(HEADER_MESSAGE).unwrap_or(&frame.body)
                );
            }
            other => tracing::debug!("Ignoring {} frame", other),
        }
    }

    fn dispatch(&self, frame: Frame) {
        let Some(sub_id) = frame.get(HEADER_SUBSCRIPTION) else {
            tracing::warn!("MESSAGE frame without subscription header");
            return;
        };
        let routed = lock(&self.router).route(sub_id);
        let Some((topic, handler)) = routed else {
            tracing::debug!("No handler for subscription {}", sub_id);
            return;
        };

        let body = if frame.body.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(&frame.body) {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!("Failed to parse frame on {}: {}", topic, e);
                    return;
                }
            }
        };
        handler(&InboundFrame { topic, body });
    }

    fn shutdown(&self) {
        let (session, tasks) = {
            let mut shared = lock(&self.shared);
            shared.generation += 1;
            shared.identity = None;
            shared.owner = None;
            shared.reconnect_attempts = 0;
            shared.boot.clear();
            let tasks = [shared.health_task.take(), shared.reconnect_task.take()];
            let session = shared.session.take();
            self.set_state(ConnectionState::Disconnected);
            (session, tasks)
        };
        let ids = lock(&self.router).clear();

        for task in tasks.into_iter().flatten() {
            task.abort();
        }

        let Some(session) = session else {
            return;
        };
        for id in &ids {
            let _ = session
                .outgoing
                .unbounded_send(Frame::unsubscribe(id).encode());
        }
        let _ = session.outgoing.unbounded_send(Frame::disconnect().encode());
        session.outgoing.close_channel();
        session.reader.abort();
        tracing::info!("Disconnected, revoked {} subscriptions", ids.len());
    }
}

impl<T: Transport> Revoke for Inner<T> {
    fn revoke(&self, id: &str) {
        if !lock(&self.router).remove(id) {
            return;
        }
        let shared = lock(&self.shared);
        if let Some(session) = shared.session.as_ref() {
            let _ = session
                .outgoing
                .unbounded_send(Frame::unsubscribe(id).encode());
        }
        tracing::debug!("Unsubscribed {}", id);
    }
}

impl<T: Transport> Drop for Inner<T> {
    fn drop(&mut self) {
        let shared = self.shared.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in [shared.health_task.take(), shared.reconnect_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        if let Some(session) = shared.session.take() {
            session.reader.abort();
        }
    }
}

/// Wait for the next real frame, skipping heart-beats and garbage.
async fn next_frame(incoming: &mut UnboundedReceiver<String>) -> Option<Frame> {
    while let Some(text) = incoming.next().await {
        match Frame::decode(&text) {
            Ok(Some(frame)) => return Some(frame),
            Ok(None) => continue,
            Err(e) => tracing::warn!("Dropping undecodable frame during handshake: {}", e),
        }
    }
    None
}

async fn read_loop<T: Transport>(
    weak: Weak<Inner<T>>,
    mut incoming: UnboundedReceiver<String>,
    generation: u64,
) {
    while let Some(text) = incoming.next().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.is_current(generation) {
            return;
        }
        inner.handle_text(&text);
    }
    if let Some(inner) = weak.upgrade() {
        inner.connection_lost(generation);
    }
}

async fn reconnect_loop<T: Transport>(weak: Weak<Inner<T>>, generation: u64) {
    loop {
        let delay = {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut shared = lock(&inner.shared);
            if shared.generation != generation {
                return;
            }
            let max = inner.config.reconnect.max_attempts;
            if shared.reconnect_attempts >= max {
                tracing::error!(
                    "Giving up after {} reconnect attempts; waiting for an explicit connect",
                    shared.reconnect_attempts
                );
                inner.set_state(ConnectionState::Disconnected);
                return;
            }
            shared.reconnect_attempts += 1;
            let attempt = shared.reconnect_attempts;
            inner.set_state(ConnectionState::Reconnecting { attempt });
            tracing::info!(
                "Reconnecting in {:?} (attempt {}/{})",
                inner.config.reconnect.delay,
                attempt,
                max
            );
            inner.config.reconnect.delay
        };

        tokio::time::sleep(delay).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        match inner.establish(generation).await {
            Ok(()) => return,
            Err(ConnectError::Cancelled) => return,
            Err(e) => tracing::warn!("Reconnect attempt failed: {}", e),
        }
    }
}
