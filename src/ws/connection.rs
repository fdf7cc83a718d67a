//! Connection state machine.
//!
//! A [`Connection`] is a cheap handle to a task that owns everything about
//! one broker session: the transport, the subscription registry, the
//! throttler and every timer. Handles talk to the task over a request
//! channel and read its state from a `watch` snapshot, so status checks
//! never block and the task never shares mutable state.
//!
//! ```text
//!             connect()                 CONNECTED
//! Disconnected ───────▶ Connecting ─────────────────▶ Connected
//!      ▲                    │   dial/handshake failure      │
//!      │ reconnect timer    │   (manual) ───▶ Error         │ drop, broker
//!      │                    │                               │ ERROR, missed
//!      └──── backoff ◀──────┴───── (automatic) ◀────────────┘ heart-beats
//! ```
//!
//! An unintentional loss schedules a reconnect with exponential backoff and
//! replays every registered subscription once the broker accepts the new
//! session. `disconnect()` is final: it cancels any pending reconnect.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::http::Uri;

use super::codec;
use super::frame::{self, Command, Frame, HEARTBEAT, Inbound};
use super::subscription::{
    MessageCallback, SubscribeOptions, SubscriptionEntry, SubscriptionInfo, SubscriptionRegistry,
};
use super::throttle::Throttler;
use super::transport::{Connector, DialFuture, TransportEvent, TransportSession};
use crate::config::ConnectionConfig;
use crate::domain::{
    ConnectionEvent, ConnectionSnapshot, ConnectionStatus, DataSourceEvent, DataUpdate, Delivery,
    Observers, SubscriptionId,
};
use crate::error::LinkError;
use crate::scheduler::{Scheduler, TimerSet, TokioScheduler, sleep_until_opt};

/// Collaborators injected into a connection task.
#[derive(Debug, Clone)]
pub struct ConnectionDeps {
    /// Opens transport sessions.
    pub connector: Arc<dyn Connector>,
    /// Time source for every timer the task arms.
    pub scheduler: Arc<dyn Scheduler>,
    /// Receivers of lifecycle and subscription events.
    pub observers: Observers,
}

impl ConnectionDeps {
    /// Uses `connector`, the tokio clock and no observers.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            scheduler: Arc::new(TokioScheduler),
            observers: Observers::new(),
        }
    }

    /// Replaces the scheduler.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Replaces the observers.
    #[must_use]
    pub fn with_observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }
}

enum Request {
    Connect {
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        topic: String,
        callback: MessageCallback,
        options: SubscribeOptions,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Publish {
        topic: String,
        body: String,
        content_type: &'static str,
        headers: BTreeMap<String, String>,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Subscriptions {
        reply: oneshot::Sender<Vec<SubscriptionInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one broker connection.
///
/// Clones share the same task. The task stops on [`Connection::shutdown`]
/// or when the last handle is dropped.
#[derive(Debug, Clone)]
pub struct Connection {
    id: String,
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionSnapshot>,
}

impl Connection {
    /// Spawns the connection task. The connection starts disconnected.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(
        id: impl Into<String>,
        name: impl Into<String>,
        config: ConnectionConfig,
        deps: ConnectionDeps,
    ) -> Self {
        let id = id.into();
        let (requests, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionSnapshot::new(
            id.clone(),
            name,
            config.url.clone(),
        ));
        let task = ConnectionTask::new(id.clone(), config, deps, state_tx, rx);
        tokio::spawn(task.run());
        Self {
            id,
            requests,
            state,
        }
    }

    /// Returns the connection id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    /// Returns a copy of the latest snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state.borrow().clone()
    }

    /// Returns a receiver that observes every snapshot change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.clone()
    }

    /// Connects and resolves once the broker accepts the session.
    ///
    /// Resolves immediately when already connected. A failed manual
    /// connect leaves the connection in [`ConnectionStatus::Error`] and is
    /// not retried.
    ///
    /// # Errors
    ///
    /// Returns the dial, handshake or timeout failure, or
    /// [`LinkError::Internal`] if the task is gone.
    pub async fn connect(&self) -> Result<(), LinkError> {
        self.call(|reply| Request::Connect { reply }).await?
    }

    /// Closes the session, cancelling any pending reconnect. Subscriptions
    /// stay registered and are replayed by the next `connect`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Internal`] if the task is gone.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        self.call(|reply| Request::Disconnect { reply }).await
    }

    /// Registers a subscription. It is attached immediately when connected
    /// and on every later (re)connect otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Internal`] if the task is gone.
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        callback: MessageCallback,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, LinkError> {
        let topic = topic.into();
        self.call(|reply| Request::Subscribe {
            topic,
            callback,
            options,
            reply,
        })
        .await
    }

    /// Removes a subscription. Once this resolves its callback is never
    /// invoked again, and any throttled deliveries are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::SubscriptionNotFound`] for unknown ids.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), LinkError> {
        self.call(|reply| Request::Unsubscribe { id, reply }).await?
    }

    /// Publishes `data` to `topic`. Strings are sent verbatim as
    /// `text/plain`; any other value is sent as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] unless connected, or
    /// [`LinkError::Serialization`] if `data` cannot be encoded.
    pub async fn publish(
        &self,
        topic: &str,
        data: &Value,
        headers: BTreeMap<String, String>,
    ) -> Result<(), LinkError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(LinkError::NotConnected {
                connection_id: self.id.clone(),
            });
        }
        let (body, content_type) = codec::encode_publish(data)?;
        let topic = topic.to_string();
        self.call(|reply| Request::Publish {
            topic,
            body,
            content_type,
            headers,
            reply,
        })
        .await?
    }

    /// Lists registered subscriptions in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Internal`] if the task is gone.
    pub async fn subscriptions(&self) -> Result<Vec<SubscriptionInfo>, LinkError> {
        self.call(|reply| Request::Subscriptions { reply }).await
    }

    /// Disconnects and stops the task. Pending throttled deliveries are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Internal`] if the task is already gone.
    pub async fn shutdown(&self) -> Result<(), LinkError> {
        self.call(|reply| Request::Shutdown { reply }).await
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .map_err(|_| self.task_gone())?;
        rx.await.map_err(|_| self.task_gone())
    }

    fn task_gone(&self) -> LinkError {
        LinkError::Internal(format!("connection task {} has stopped", self.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Timer {
    Reconnect,
    ConnectTimeout,
    HeartbeatSend,
    HeartbeatCheck,
}

struct ConnectionTask {
    id: String,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    scheduler: Arc<dyn Scheduler>,
    observers: Observers,
    state: watch::Sender<ConnectionSnapshot>,
    requests: mpsc::UnboundedReceiver<Request>,
    status: ConnectionStatus,
    registry: SubscriptionRegistry,
    throttler: Throttler,
    timers: TimerSet<Timer>,
    dial: Option<DialFuture>,
    session: Option<TransportSession>,
    waiters: Vec<oneshot::Sender<Result<(), LinkError>>>,
    /// Set while the current attempt was started by the reconnect timer.
    automatic: bool,
    /// Reconnects scheduled since the last successful handshake.
    attempts: u32,
    send_every: Duration,
    expect_every: Duration,
    last_inbound: Instant,
}

impl ConnectionTask {
    fn new(
        id: String,
        config: ConnectionConfig,
        deps: ConnectionDeps,
        state: watch::Sender<ConnectionSnapshot>,
        requests: mpsc::UnboundedReceiver<Request>,
    ) -> Self {
        let last_inbound = deps.scheduler.now();
        Self {
            id,
            config,
            connector: deps.connector,
            scheduler: deps.scheduler,
            observers: deps.observers,
            state,
            requests,
            status: ConnectionStatus::Disconnected,
            registry: SubscriptionRegistry::new(),
            throttler: Throttler::new(),
            timers: TimerSet::new(),
            dial: None,
            session: None,
            waiters: Vec::new(),
            automatic: false,
            attempts: 0,
            send_every: Duration::ZERO,
            expect_every: Duration::ZERO,
            last_inbound,
        }
    }

    async fn run(mut self) {
        tracing::debug!(connection_id = %self.id, url = %self.config.url, "connection task started");
        loop {
            let deadline = match (self.timers.next_deadline(), self.throttler.next_deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let wake = sleep_until_opt(self.scheduler.as_ref(), deadline);

            tokio::select! {
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        self.close("all handles dropped");
                        break;
                    };
                    if !self.on_request(request) {
                        break;
                    }
                }
                dialed = next_dial(&mut self.dial) => {
                    self.dial = None;
                    self.on_dialed(dialed);
                }
                event = next_event(&mut self.session) => self.on_transport(event),
                () = wake => self.on_timers(),
            }
        }
        tracing::debug!(connection_id = %self.id, "connection task stopped");
    }

    fn on_request(&mut self, request: Request) -> bool {
        match request {
            Request::Connect { reply } => self.on_connect_request(reply),
            Request::Disconnect { reply } => {
                self.close("client disconnect");
                let _ = reply.send(());
            }
            Request::Subscribe {
                topic,
                callback,
                options,
                reply,
            } => {
                let id = self.add_subscription(topic, callback, options);
                let _ = reply.send(id);
            }
            Request::Unsubscribe { id, reply } => {
                let _ = reply.send(self.remove_subscription(&id));
            }
            Request::Publish {
                topic,
                body,
                content_type,
                headers,
                reply,
            } => {
                let _ = reply.send(self.publish(&topic, body, content_type, &headers));
            }
            Request::Subscriptions { reply } => {
                let _ = reply.send(self.registry.infos());
            }
            Request::Shutdown { reply } => {
                self.close("connection removed");
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    // ---- lifecycle ----

    fn on_connect_request(&mut self, reply: oneshot::Sender<Result<(), LinkError>>) {
        match self.status {
            ConnectionStatus::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionStatus::Connecting => {
                if self.automatic {
                    self.automatic = false;
                    self.attempts = 0;
                    self.update(|s| s.reconnect_attempts = 0);
                    tracing::debug!(connection_id = %self.id, "manual connect took over reconnect attempt");
                }
                self.waiters.push(reply);
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                self.waiters.push(reply);
                self.timers.cancel(&Timer::Reconnect);
                self.automatic = false;
                self.attempts = 0;
                self.update(|s| {
                    s.reconnect_pending = false;
                    s.reconnect_attempts = 0;
                });
                self.start_dial();
            }
        }
    }

    fn start_dial(&mut self) {
        tracing::info!(
            connection_id = %self.id,
            url = %self.config.url,
            automatic = self.automatic,
            "connecting"
        );
        self.set_status(ConnectionStatus::Connecting);
        self.dial = Some(self.connector.connect(&self.config.url));
        if !self.config.connect_timeout.is_zero() {
            self.timers.schedule(
                Timer::ConnectTimeout,
                self.scheduler.now() + self.config.connect_timeout,
            );
        }
    }

    fn on_dialed(&mut self, dialed: Result<TransportSession, LinkError>) {
        match dialed {
            Ok(session) => {
                let connect = Frame::connect(
                    &host_of(&self.config.url),
                    (self.config.heartbeat_outgoing, self.config.heartbeat_incoming),
                    &self.config.connect_headers,
                );
                self.session = Some(session);
                self.last_inbound = self.scheduler.now();
                if let Err(err) = self.send_frame(&connect) {
                    self.fail_attempt(err);
                }
            }
            Err(err) => self.fail_attempt(err),
        }
    }

    fn on_connected(&mut self, frame: &Frame) {
        self.timers.cancel(&Timer::ConnectTimeout);

        let server = frame
            .heart_beat()
            .unwrap_or((Duration::ZERO, Duration::ZERO));
        let (send_every, expect_every) = frame::negotiate_heartbeat(
            (self.config.heartbeat_outgoing, self.config.heartbeat_incoming),
            server,
        );
        self.send_every = send_every;
        self.expect_every = expect_every;
        let now = self.scheduler.now();
        self.last_inbound = now;
        if !send_every.is_zero() {
            self.timers.schedule(Timer::HeartbeatSend, now + send_every);
        }
        if !self.config.heartbeat_incoming.is_zero() {
            self.timers.schedule(
                Timer::HeartbeatCheck,
                now + self.config.heartbeat_incoming,
            );
        }

        let reconnected = self.automatic;
        self.automatic = false;
        self.attempts = 0;
        self.update(|s| {
            s.connected_at = Some(Utc::now());
            s.reconnect_attempts = 0;
            s.reconnect_pending = false;
            if reconnected {
                s.metrics.reconnect_count += 1;
            }
        });
        self.set_status(ConnectionStatus::Connected);
        tracing::info!(
            connection_id = %self.id,
            reconnected,
            send_every = ?send_every,
            expect_every = ?expect_every,
            "connected"
        );

        self.replay_subscriptions();
        self.emit(ConnectionEvent::Connected {
            connection_id: self.id.clone(),
            reconnected,
            timestamp: Utc::now(),
        });
        self.resolve_waiters(&Ok(()));
    }

    /// Handles a failed dial or handshake. Manual attempts end in `Error`;
    /// automatic ones go back to the backoff schedule.
    fn fail_attempt(&mut self, err: LinkError) {
        self.timers.cancel(&Timer::ConnectTimeout);
        self.dial = None;
        self.session = None;
        tracing::warn!(
            connection_id = %self.id,
            error = %err,
            automatic = self.automatic,
            "connection attempt failed"
        );
        self.report(&err);
        self.resolve_waiters(&Err(err.clone()));
        if self.automatic {
            self.set_status(ConnectionStatus::Disconnected);
            self.schedule_reconnect(&err);
        } else {
            self.set_status(ConnectionStatus::Error);
        }
    }

    /// Handles an unintentional loss of an established session.
    fn on_drop(&mut self, err: LinkError) {
        tracing::warn!(connection_id = %self.id, error = %err, "connection lost");
        self.session = None;
        self.timers.cancel(&Timer::HeartbeatSend);
        self.timers.cancel(&Timer::HeartbeatCheck);
        self.registry.detach_all();
        self.update(|s| s.disconnected_at = Some(Utc::now()));
        self.report(&err);
        self.emit(ConnectionEvent::Disconnected {
            connection_id: self.id.clone(),
            reason: err.to_string(),
            intentional: false,
            timestamp: Utc::now(),
        });
        self.set_status(ConnectionStatus::Disconnected);
        self.automatic = true;
        self.schedule_reconnect(&err);
    }

    fn schedule_reconnect(&mut self, cause: &LinkError) {
        let policy = self.config.reconnect.clone();
        if !policy.allows(self.attempts) {
            self.automatic = false;
            self.update(|s| s.reconnect_pending = false);
            if policy.enabled {
                let err = LinkError::MaxReconnectAttemptsExceeded {
                    attempts: self.attempts,
                };
                tracing::error!(connection_id = %self.id, attempts = self.attempts, "giving up on reconnect");
                self.report(&err);
            } else {
                tracing::info!(connection_id = %self.id, cause = %cause, "reconnect disabled");
            }
            self.set_status(ConnectionStatus::Error);
            return;
        }

        let delay = policy.delay_for(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        self.timers
            .schedule(Timer::Reconnect, self.scheduler.now() + delay);
        let attempt = self.attempts;
        self.update(|s| {
            s.reconnect_attempts = attempt;
            s.reconnect_pending = true;
        });
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(connection_id = %self.id, attempt, delay_ms, "reconnect scheduled");
        self.emit(ConnectionEvent::Reconnecting {
            connection_id: self.id.clone(),
            attempt,
            delay_ms,
            timestamp: Utc::now(),
        });
    }

    /// Intentional close. Idempotent when already idle.
    fn close(&mut self, reason: &str) {
        let was = self.status;
        let pending = self.timers.is_armed(&Timer::Reconnect);
        self.timers.clear();
        self.dial = None;
        if let Some(session) = self.session.take()
            && was == ConnectionStatus::Connected
        {
            for id in self.registry.detach_all() {
                let _ = session.send(Frame::unsubscribe(&id.to_string()).encode());
            }
            let _ = session.send(Frame::new(Command::Disconnect).encode());
        }
        self.registry.detach_all();
        self.automatic = false;
        self.attempts = 0;
        self.resolve_waiters(&Err(LinkError::Connection(format!(
            "connect aborted: {reason}"
        ))));

        if was == ConnectionStatus::Disconnected && !pending {
            return;
        }
        self.update(|s| {
            s.reconnect_pending = false;
            s.reconnect_attempts = 0;
            s.disconnected_at = Some(Utc::now());
        });
        tracing::info!(connection_id = %self.id, reason, "disconnected");
        self.emit(ConnectionEvent::Disconnected {
            connection_id: self.id.clone(),
            reason: reason.to_string(),
            intentional: true,
            timestamp: Utc::now(),
        });
        self.set_status(ConnectionStatus::Disconnected);
    }

    // ---- transport ----

    fn on_transport(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Message(text)) => self.on_text(&text),
            Some(TransportEvent::Closed(reason)) => self.on_lost(LinkError::Connection(reason)),
            None => self.on_lost(LinkError::Connection("transport ended".to_string())),
        }
    }

    fn on_lost(&mut self, err: LinkError) {
        match self.status {
            ConnectionStatus::Connecting => self.fail_attempt(err),
            ConnectionStatus::Connected => self.on_drop(err),
            ConnectionStatus::Disconnected | ConnectionStatus::Error => self.session = None,
        }
    }

    fn on_text(&mut self, text: &str) {
        self.last_inbound = self.scheduler.now();
        let units = match frame::decode(text) {
            Ok(units) => units,
            Err(err) if self.status == ConnectionStatus::Connecting => {
                self.fail_attempt(err);
                return;
            }
            Err(err) => {
                tracing::warn!(connection_id = %self.id, error = %err, "dropping malformed frame");
                self.update(|s| s.metrics.error_count += 1);
                return;
            }
        };
        for unit in units {
            if let Inbound::Frame(frame) = unit {
                self.on_frame(frame);
            }
            if self.session.is_none() {
                break;
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        if self.config.debug {
            tracing::debug!(connection_id = %self.id, command = %frame.command, "frame in");
        } else {
            tracing::trace!(connection_id = %self.id, command = %frame.command, "frame in");
        }
        match frame.command {
            Command::Connected if self.status == ConnectionStatus::Connecting => {
                self.on_connected(&frame);
            }
            Command::Message if self.status == ConnectionStatus::Connected => {
                self.on_message(frame);
            }
            Command::Error => {
                let message = frame.get("message").unwrap_or("broker error");
                let body = frame.body.trim_end_matches(['\n', '\r']);
                let detail = if body.is_empty() {
                    message.to_string()
                } else {
                    format!("{message}: {body}")
                };
                let err = LinkError::Protocol(detail);
                match self.status {
                    ConnectionStatus::Connecting => self.fail_attempt(err),
                    ConnectionStatus::Connected => self.on_drop(err),
                    ConnectionStatus::Disconnected | ConnectionStatus::Error => {}
                }
            }
            Command::Receipt => {
                tracing::debug!(connection_id = %self.id, receipt = ?frame.get("receipt-id"), "receipt");
            }
            other => {
                tracing::warn!(connection_id = %self.id, command = %other, status = %self.status, "unexpected frame");
            }
        }
    }

    fn on_message(&mut self, frame: Frame) {
        self.update(|s| s.metrics.messages_received += 1);
        let Some(id) = frame
            .get("subscription")
            .and_then(|s| s.parse::<SubscriptionId>().ok())
        else {
            tracing::warn!(connection_id = %self.id, "message without a known subscription header");
            return;
        };
        let Some(entry) = self.registry.get(&id) else {
            tracing::debug!(connection_id = %self.id, subscription_id = %id, "message for removed subscription");
            return;
        };

        let payload = match codec::decode_body(&frame.body) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(
                    connection_id = %self.id,
                    subscription_id = %id,
                    error = %err,
                    "dropping unparseable message"
                );
                self.update(|s| s.metrics.parse_errors += 1);
                return;
            }
        };
        if !entry.accepts(&payload) {
            return;
        }
        let topic = entry.topic.clone();
        let throttle = entry.options.throttle;

        let mut headers = BTreeMap::new();
        for (name, value) in frame.headers {
            headers.entry(name).or_insert(value);
        }
        let delivery = Delivery {
            subscription_id: id,
            topic,
            payload,
            headers,
            received_at: Utc::now(),
        };
        match throttle {
            Some(interval) => self
                .throttler
                .offer(delivery, interval, self.scheduler.now()),
            None => self.deliver(delivery),
        }
    }

    fn deliver(&mut self, delivery: Delivery) {
        let Some(entry) = self.registry.get_mut(&delivery.subscription_id) else {
            return;
        };
        entry.delivered += 1;
        let callback = Arc::clone(&entry.callback);
        let event = DataSourceEvent::DataReceived {
            subscription_id: delivery.subscription_id,
            topic: delivery.topic.clone(),
            update_kind: delivery.payload.as_update().map(DataUpdate::kind),
        };
        callback(delivery);
        self.emit_data_source(event);
    }

    // ---- timers ----

    fn on_timers(&mut self) {
        let now = self.scheduler.now();
        for timer in self.timers.pop_due(now) {
            match timer {
                Timer::Reconnect => {
                    self.automatic = true;
                    self.start_dial();
                    self.update(|s| s.reconnect_pending = false);
                }
                Timer::ConnectTimeout => {
                    if self.status == ConnectionStatus::Connecting {
                        let ms = self.config.connect_timeout.as_millis();
                        self.fail_attempt(LinkError::Connection(format!(
                            "connect timed out after {ms}ms"
                        )));
                    }
                }
                Timer::HeartbeatSend => {
                    let sent = self
                        .session
                        .as_ref()
                        .is_some_and(|s| s.send(HEARTBEAT.to_string()).is_ok());
                    if sent {
                        self.timers
                            .schedule(Timer::HeartbeatSend, now + self.send_every);
                    }
                }
                Timer::HeartbeatCheck => self.check_heartbeat(now),
            }
        }
        for delivery in self.throttler.due(now) {
            self.deliver(delivery);
        }
    }

    fn check_heartbeat(&mut self, now: Instant) {
        if self.status != ConnectionStatus::Connected {
            return;
        }
        let Some(session) = &self.session else {
            return;
        };
        let alive = session.is_connected();
        let silent_for = now.saturating_duration_since(self.last_inbound);
        let stale = !self.expect_every.is_zero() && silent_for > self.expect_every.saturating_mul(2);
        if alive && !stale {
            self.timers.schedule(
                Timer::HeartbeatCheck,
                now + self.config.heartbeat_incoming,
            );
            return;
        }
        let reason = if alive {
            format!("no inbound traffic for {}ms", silent_for.as_millis())
        } else {
            "heart-beat check found the transport down".to_string()
        };
        self.on_drop(LinkError::Connection(reason));
    }

    // ---- subscriptions ----

    fn add_subscription(
        &mut self,
        topic: String,
        callback: MessageCallback,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let id = self.registry.subscribe(topic.clone(), callback, options);
        if self.status == ConnectionStatus::Connected {
            let frame = self.registry.get_mut(&id).map(|entry| {
                entry.attached = true;
                subscribe_frame(entry)
            });
            if let Some(frame) = frame
                && let Err(err) = self.send_frame(&frame)
            {
                tracing::warn!(connection_id = %self.id, error = %err, "subscribe frame not sent");
            }
        }
        let count = self.registry.len();
        self.update(|s| s.subscription_count = count);
        tracing::debug!(connection_id = %self.id, subscription_id = %id, topic = %topic, "subscribed");
        self.emit_data_source(DataSourceEvent::SubscriptionAdded {
            subscription_id: id,
            topic,
        });
        id
    }

    fn remove_subscription(&mut self, id: &SubscriptionId) -> Result<(), LinkError> {
        let entry = self
            .registry
            .unsubscribe(id)
            .ok_or_else(|| LinkError::SubscriptionNotFound(id.to_string()))?;
        if entry.attached
            && let Err(err) = self.send_frame(&Frame::unsubscribe(&id.to_string()))
        {
            tracing::debug!(connection_id = %self.id, error = %err, "unsubscribe frame not sent");
        }
        let discarded = self.throttler.discard(id);
        let count = self.registry.len();
        self.update(|s| s.subscription_count = count);
        tracing::debug!(connection_id = %self.id, subscription_id = %id, discarded, "unsubscribed");
        self.emit_data_source(DataSourceEvent::SubscriptionRemoved {
            subscription_id: *id,
            topic: entry.topic,
        });
        Ok(())
    }

    fn replay_subscriptions(&mut self) {
        let frames: Vec<Frame> = self
            .registry
            .attach_all()
            .into_iter()
            .map(subscribe_frame)
            .collect();
        for frame in &frames {
            if let Err(err) = self.send_frame(frame) {
                tracing::warn!(connection_id = %self.id, error = %err, "subscription replay interrupted");
                return;
            }
        }
        if !frames.is_empty() {
            tracing::info!(connection_id = %self.id, count = frames.len(), "subscriptions replayed");
        }
    }

    fn publish(
        &mut self,
        topic: &str,
        body: String,
        content_type: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<(), LinkError> {
        if self.status != ConnectionStatus::Connected {
            return Err(LinkError::NotConnected {
                connection_id: self.id.clone(),
            });
        }
        self.send_frame(&Frame::send(topic, body, content_type, headers))?;
        self.update(|s| s.metrics.messages_sent += 1);
        Ok(())
    }

    // ---- plumbing ----

    fn send_frame(&self, frame: &Frame) -> Result<(), LinkError> {
        let Some(session) = &self.session else {
            return Err(LinkError::NotConnected {
                connection_id: self.id.clone(),
            });
        };
        if self.config.debug {
            tracing::debug!(connection_id = %self.id, command = %frame.command, "frame out");
        } else {
            tracing::trace!(connection_id = %self.id, command = %frame.command, "frame out");
        }
        session.send(frame.encode())
    }

    fn set_status(&mut self, current: ConnectionStatus) {
        let previous = self.status;
        if previous == current {
            return;
        }
        self.status = current;
        self.update(|s| s.status = current);
        tracing::debug!(connection_id = %self.id, %previous, %current, "state changed");
        self.emit(ConnectionEvent::StateChanged {
            connection_id: self.id.clone(),
            previous,
            current,
            timestamp: Utc::now(),
        });
    }

    fn report(&self, err: &LinkError) {
        let message = err.to_string();
        let last = message.clone();
        self.update(move |s| {
            s.metrics.error_count += 1;
            s.last_error = Some(last);
        });
        self.emit(ConnectionEvent::Error {
            connection_id: self.id.clone(),
            code: err.error_code(),
            message,
            timestamp: Utc::now(),
        });
    }

    fn resolve_waiters(&mut self, result: &Result<(), LinkError>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn update(&self, modify: impl FnOnce(&mut ConnectionSnapshot)) {
        self.state.send_modify(modify);
    }

    fn emit(&self, event: ConnectionEvent) {
        self.observers.emit(&event);
    }

    fn emit_data_source(&self, event: DataSourceEvent) {
        self.emit(ConnectionEvent::DataSource {
            connection_id: self.id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }
}

async fn next_dial(dial: &mut Option<DialFuture>) -> Result<TransportSession, LinkError> {
    match dial {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_event(session: &mut Option<TransportSession>) -> Option<TransportEvent> {
    match session {
        Some(session) => session.inbound.recv().await,
        None => std::future::pending().await,
    }
}

fn subscribe_frame(entry: &SubscriptionEntry) -> Frame {
    let mut frame = Frame::subscribe(&entry.id.to_string(), &entry.topic);
    for (name, value) in &entry.options.headers {
        frame = frame.header(name.clone(), value.clone());
    }
    frame
}

/// Value of the `host` header: the broker's host name.
fn host_of(url: &str) -> String {
    url.parse::<Uri>()
        .ok()
        .and_then(|uri| uri.host().map(str::to_string))
        .unwrap_or_else(|| "/".to_string())
}
