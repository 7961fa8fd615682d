//! Dual-mode conversation delivery: push with reconnect, polling fallback.
//!
//! SYSTEM CONTEXT
//! ==============
//! The widget controller subscribes to conversations and receives messages
//! and typing notices through callbacks. It never learns which delivery mode
//! is active; [`RealtimeTransport::mode`] and [`RealtimeTransport::events`]
//! exist for diagnostics and tests.
//!
//! DESIGN
//! ======
//! - One `Inner` behind a mutex owns the subscription registry, the per
//!   conversation cursors, the reconnect counter, the outbound push sender and
//!   every background task handle. Teardown is a single call that aborts the
//!   tasks and resets the bookkeeping.
//! - Every background task captures the `epoch` it was spawned in. Teardown
//!   bumps the epoch, so a task that wakes after teardown sees a stale epoch
//!   and exits without touching state.
//! - Callbacks are cloned out of the registry and invoked after the lock is
//!   released, so a callback may subscribe or unsubscribe re-entrantly.
//! - Subscribing never replays history, whichever mode is active. The first
//!   poll of a conversation with no known cursor records a baseline and
//!   dispatches nothing.
//!
//! State flow: `Idle -> Connecting -> Connected`, `Connecting -> Polling` on a
//! failed first connect, `Connected -> Connecting` on an unexpected close
//! (reconnect with backoff), and `Connecting -> Polling` once the reconnect
//! budget is spent. Exhaustion is sticky for the life of the transport.
//!
//! ERROR HANDLING
//! ==============
//! Connect and poll failures are absorbed here. They are logged, counted and
//! published as [`TransportEvent`]s but never returned to subscribers.

#[cfg(test)]
#[path = "transport_test.rs"]
mod transport_test;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use envelopes::{ChatMessage, Directive, Envelope, TypingIndicator, decode_envelope, encode_directive};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::backoff::reconnect_delay;
use super::poll::{HttpPoller, MessagePoller};
use super::push::{PushConnector, WsConnector};
use super::types::{DeliveryMode, TransportEvent};
use crate::config::TransportConfig;
use crate::http::ApiClient;

const EVENT_CAPACITY: usize = 64;

pub type MessageHandler = Arc<dyn Fn(ChatMessage) + Send + Sync>;
pub type TypingHandler = Arc<dyn Fn(TypingIndicator) + Send + Sync>;

// =============================================================================
// PUBLIC HANDLE
// =============================================================================

/// Delivery layer for one session.
///
/// Must be used from within a Tokio runtime: subscribing spawns the connect
/// and delivery tasks. Dropping the transport tears everything down.
pub struct RealtimeTransport {
    shared: Arc<Shared>,
}

impl RealtimeTransport {
    pub fn new(
        session_id: impl Into<String>,
        config: TransportConfig,
        connector: Arc<dyn PushConnector>,
        poller: Arc<dyn MessagePoller>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                session_id: session_id.into(),
                connector,
                poller,
                events,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// WebSocket push and HTTP polling against `client`'s API base.
    pub fn over_http(client: ApiClient, session_id: impl Into<String>, config: TransportConfig) -> Self {
        let connector = Arc::new(WsConnector::new(client.api_base()));
        let poller = Arc::new(HttpPoller::new(client));
        Self::new(session_id, config, connector, poller)
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Register `on_message` for `conversation_id`, replacing any earlier
    /// subscription for the same conversation.
    pub fn subscribe<F>(&self, conversation_id: &str, on_message: F) -> Subscription
    where
        F: Fn(ChatMessage) + Send + Sync + 'static,
    {
        self.register(conversation_id, Arc::new(on_message), None)
    }

    /// Like [`Self::subscribe`], also routing typing notices to `on_typing`.
    pub fn subscribe_with_typing<F, T>(&self, conversation_id: &str, on_message: F, on_typing: T) -> Subscription
    where
        F: Fn(ChatMessage) + Send + Sync + 'static,
        T: Fn(TypingIndicator) + Send + Sync + 'static,
    {
        let on_typing: TypingHandler = Arc::new(on_typing);
        self.register(conversation_id, Arc::new(on_message), Some(on_typing))
    }

    /// Start delivery if the transport is idle. No-op otherwise.
    pub fn ensure_connection(&self) {
        let mut inner = self.shared.lock();
        if inner.registry.is_empty() {
            return;
        }
        self.shared.ensure_connection(&mut inner);
    }

    /// Best-effort typing directive. Dropped unless push is connected.
    pub fn send_typing(&self, conversation_id: &str, is_typing: bool) {
        let inner = self.shared.lock();
        match (&inner.mode, &inner.outbound) {
            (DeliveryMode::Connected, Some(outbound)) => {
                send_directive(outbound, &Directive::typing(conversation_id, is_typing));
            }
            (mode, _) => {
                debug!(conversation_id, ?mode, "typing directive dropped; push not connected");
            }
        }
    }

    /// Start delivery for `conversation_id` after `message_id`.
    ///
    /// Without a seed the first poll for a conversation only records where
    /// its history ends. Seeding lets polling pick up right after history the
    /// caller already loaded, including anything posted in between.
    pub fn seed_cursor(&self, conversation_id: &str, message_id: &str) {
        self.shared.lock().cursors.insert(conversation_id.to_owned(), Some(message_id.to_owned()));
    }

    #[must_use]
    pub fn mode(&self) -> DeliveryMode {
        self.shared.lock().mode
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.shared.lock().registry.len()
    }

    /// Failed poll requests since the last successful one.
    #[must_use]
    pub fn consecutive_poll_failures(&self) -> u32 {
        self.shared.lock().consecutive_poll_failures
    }

    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    /// Drop every subscription and stop all delivery.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        inner.registry.clear();
        self.shared.teardown(&mut inner);
    }

    fn register(&self, conversation_id: &str, on_message: MessageHandler, on_typing: Option<TypingHandler>) -> Subscription {
        let mut inner = self.shared.lock();
        inner.next_token += 1;
        let token = inner.next_token;
        let replaced = inner
            .registry
            .insert(conversation_id.to_owned(), Registration { token, on_message, on_typing })
            .is_some();
        debug!(conversation_id, replaced, "subscribed");

        match inner.mode {
            DeliveryMode::Connected if !replaced => {
                if let Some(outbound) = &inner.outbound {
                    send_directive(outbound, &Directive::subscribe(conversation_id));
                }
            }
            DeliveryMode::Idle => self.shared.ensure_connection(&mut inner),
            _ => {}
        }

        Subscription {
            shared: Arc::downgrade(&self.shared),
            conversation_id: conversation_id.to_owned(),
            token,
        }
    }
}

impl Drop for RealtimeTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Handle returned by `subscribe`. Dropping it leaves the subscription active.
#[derive(Debug)]
pub struct Subscription {
    shared: Weak<Shared>,
    conversation_id: String,
    token: u64,
}

impl Subscription {
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Remove this subscription; disconnects when it was the last one.
    ///
    /// Idempotent, and a no-op once a newer subscription replaced this one.
    pub fn unsubscribe(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.unsubscribe(&self.conversation_id, self.token);
        }
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct Shared {
    config: TransportConfig,
    session_id: String,
    connector: Arc<dyn PushConnector>,
    poller: Arc<dyn MessagePoller>,
    events: broadcast::Sender<TransportEvent>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    mode: DeliveryMode,
    registry: HashMap<String, Registration>,
    /// Last seen message id per conversation. `Some(None)` marks a
    /// conversation whose first poll came back empty; an absent entry means
    /// nothing is known yet and the next poll only records a baseline.
    cursors: HashMap<String, Option<String>>,
    reconnect_attempts: u32,
    push_exhausted: bool,
    consecutive_poll_failures: u32,
    outbound: Option<mpsc::UnboundedSender<String>>,
    tasks: Tasks,
    epoch: u64,
    next_token: u64,
}

struct Registration {
    token: u64,
    on_message: MessageHandler,
    on_typing: Option<TypingHandler>,
}

#[derive(Default)]
struct Tasks {
    connect: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    poll: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [self.connect.take(), self.reader.take(), self.reconnect.take(), self.poll.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` only if no teardown happened since `epoch`.
    fn with_live<R>(&self, epoch: u64, f: impl FnOnce(&mut Inner) -> R) -> Option<R> {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return None;
        }
        Some(f(&mut inner))
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn set_mode(&self, inner: &mut Inner, mode: DeliveryMode) {
        if inner.mode != mode {
            debug!(from = ?inner.mode, to = ?mode, "delivery mode changed");
            inner.mode = mode;
            self.emit(TransportEvent::ModeChanged(mode));
        }
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    fn ensure_connection(self: &Arc<Self>, inner: &mut Inner) {
        if inner.mode != DeliveryMode::Idle {
            return;
        }
        if inner.push_exhausted {
            debug!("push previously exhausted; polling");
            self.start_polling(inner);
            return;
        }
        self.set_mode(inner, DeliveryMode::Connecting);
        let shared = Arc::clone(self);
        let epoch = inner.epoch;
        inner.tasks.connect = Some(tokio::spawn(async move {
            shared.attempt_connect(epoch, false).await;
        }));
    }

    async fn attempt_connect(self: &Arc<Self>, epoch: u64, reconnecting: bool) {
        let result = self.connector.connect(&self.session_id).await;
        self.with_live(epoch, |inner| match result {
            Ok(channel) => {
                inner.reconnect_attempts = 0;
                for conversation_id in inner.registry.keys() {
                    send_directive(&channel.outbound, &Directive::subscribe(conversation_id.as_str()));
                }
                info!(subscriptions = inner.registry.len(), reconnecting, "push connected");
                inner.outbound = Some(channel.outbound);
                self.set_mode(inner, DeliveryMode::Connected);
                let shared = Arc::clone(self);
                let inbound = channel.inbound;
                inner.tasks.reader = Some(tokio::spawn(async move {
                    shared.read_push(epoch, inbound).await;
                }));
            }
            Err(e) if reconnecting => {
                warn!(attempt = inner.reconnect_attempts, error = %e, "push reconnect failed");
                self.schedule_reconnect(inner);
            }
            Err(e) => {
                warn!(error = %e, "push connect failed; falling back to polling");
                self.start_polling(inner);
            }
        });
    }

    async fn read_push(self: &Arc<Self>, epoch: u64, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = inbound.recv().await {
            let envelope = match decode_envelope(&text) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable envelope");
                    continue;
                }
            };
            let live = match envelope {
                Envelope::NewMessage(message) => self.deliver_message(epoch, message),
                Envelope::Typing(typing) => self.deliver_typing(epoch, typing),
                Envelope::Read(receipt) => {
                    debug!(conversation_id = %receipt.conversation_id, "read receipt ignored");
                    true
                }
            };
            if !live {
                return;
            }
        }

        self.with_live(epoch, |inner| {
            if inner.mode != DeliveryMode::Connected {
                return;
            }
            warn!("push channel closed unexpectedly");
            inner.outbound = None;
            self.emit(TransportEvent::Disconnected);
            self.set_mode(inner, DeliveryMode::Connecting);
            self.schedule_reconnect(inner);
        });
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner) {
        inner.reconnect_attempts += 1;
        let attempt = inner.reconnect_attempts;
        if attempt > self.config.max_reconnect_attempts {
            warn!(attempts = attempt - 1, "push reconnect budget exhausted; polling");
            inner.push_exhausted = true;
            self.emit(TransportEvent::PushExhausted);
            self.start_polling(inner);
            return;
        }

        let delay = reconnect_delay(self.config.reconnect_base_delay, attempt);
        info!(attempt, ?delay, "scheduling push reconnect");
        self.emit(TransportEvent::ReconnectScheduled { attempt, delay });
        let shared = Arc::clone(self);
        let epoch = inner.epoch;
        inner.tasks.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let has_subscriptions = shared.with_live(epoch, |inner| !inner.registry.is_empty());
            match has_subscriptions {
                Some(true) => shared.attempt_connect(epoch, true).await,
                Some(false) => debug!("reconnect skipped; no subscriptions"),
                None => {}
            }
        }));
    }

    fn start_polling(self: &Arc<Self>, inner: &mut Inner) {
        inner.outbound = None;
        self.set_mode(inner, DeliveryMode::Polling);
        let shared = Arc::clone(self);
        let epoch = inner.epoch;
        let period = self.config.poll_interval;
        inner.tasks.poll = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !shared.poll_once(epoch).await {
                    return;
                }
            }
        }));
    }

    /// One polling pass over every subscription. `false` once torn down.
    async fn poll_once(&self, epoch: u64) -> bool {
        let Some(targets) = self.with_live(epoch, |inner| {
            inner
                .registry
                .keys()
                .map(|id| (id.clone(), inner.cursors.get(id).cloned()))
                .collect::<Vec<_>>()
        }) else {
            return false;
        };

        for (conversation_id, cursor) in targets {
            let after = cursor.clone().flatten();
            match self.poller.poll(&self.session_id, &conversation_id, after.as_deref()).await {
                Ok(messages) if cursor.is_none() => {
                    // First poll: existing history is not new to the subscriber.
                    let last = messages.last().map(|m| m.id.clone());
                    let recorded = self.with_live(epoch, |inner| {
                        inner.consecutive_poll_failures = 0;
                        if inner.registry.contains_key(&conversation_id) {
                            inner.cursors.entry(conversation_id.clone()).or_insert(last);
                        }
                    });
                    if recorded.is_none() {
                        return false;
                    }
                    debug!(conversation_id = %conversation_id, skipped = messages.len(), "poll baseline recorded");
                }
                Ok(messages) => {
                    if self.with_live(epoch, |inner| inner.consecutive_poll_failures = 0).is_none() {
                        return false;
                    }
                    for message in messages {
                        if !self.deliver_message(epoch, message) {
                            return false;
                        }
                    }
                }
                Err(e) => {
                    let Some(failures) = self.with_live(epoch, |inner| {
                        inner.consecutive_poll_failures += 1;
                        inner.consecutive_poll_failures
                    }) else {
                        return false;
                    };
                    debug!(conversation_id = %conversation_id, failures, error = %e, "poll failed; retrying next tick");
                    self.emit(TransportEvent::PollFailed { conversation_id, consecutive_failures: failures });
                }
            }
        }
        true
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Route a message to its subscriber. `false` once torn down.
    fn deliver_message(&self, epoch: u64, message: ChatMessage) -> bool {
        let Some(handler) = self.with_live(epoch, |inner| {
            let handler = inner.registry.get(&message.conversation_id).map(|r| Arc::clone(&r.on_message));
            if handler.is_some() {
                inner.cursors.insert(message.conversation_id.clone(), Some(message.id.clone()));
            }
            handler
        }) else {
            return false;
        };
        match handler {
            Some(handler) => handler(message),
            None => debug!(conversation_id = %message.conversation_id, "message for unsubscribed conversation dropped"),
        }
        true
    }

    fn deliver_typing(&self, epoch: u64, typing: TypingIndicator) -> bool {
        let Some(handler) = self.with_live(epoch, |inner| {
            inner.registry.get(&typing.conversation_id).and_then(|r| r.on_typing.clone())
        }) else {
            return false;
        };
        if let Some(handler) = handler {
            handler(typing);
        }
        true
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    fn unsubscribe(&self, conversation_id: &str, token: u64) {
        let mut inner = self.lock();
        if !inner.registry.get(conversation_id).is_some_and(|r| r.token == token) {
            return;
        }
        inner.registry.remove(conversation_id);
        inner.cursors.remove(conversation_id);
        debug!(conversation_id, remaining = inner.registry.len(), "unsubscribed");
        if inner.registry.is_empty() {
            self.teardown(&mut inner);
        }
    }

    fn teardown(&self, inner: &mut Inner) {
        inner.epoch += 1;
        inner.tasks.abort_all();
        inner.outbound = None;
        inner.cursors.clear();
        inner.reconnect_attempts = 0;
        inner.consecutive_poll_failures = 0;
        self.set_mode(inner, DeliveryMode::Idle);
    }
}

fn send_directive(outbound: &mpsc::UnboundedSender<String>, directive: &Directive) {
    match encode_directive(directive) {
        Ok(text) => {
            let _ = outbound.send(text);
        }
        Err(e) => warn!(error = %e, "dropping unencodable directive"),
    }
}
