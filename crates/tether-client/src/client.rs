//! The public client facade.
//!
//! [`RealtimeClient`] is a cheap handle (`Clone` shares one connection).
//! A single driver task owns the socket; the handle talks to it through
//! shared tables guarded by short `parking_lot` critical sections:
//!
//! - `link`: state, outbound queue, and the write channel into the driver.
//!   The state check and the queue push happen under the same lock, so a
//!   frame is either written on the live connection or flushed on the next
//!   one, never both and never lost in between.
//! - `correlator`: in-flight requests.
//! - `registry`: channel handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tether_core::protocol::stamp_payload;
use tether_core::{ClientError, ClientMessage, RequestId, Result, SessionId, SubscriptionId};
use tether_settings::{ClientSettings, OfflineRequestPolicy};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, trace, warn};

use crate::correlator::Correlator;
use crate::credentials::{CredentialPrompt, CredentialSources, CredentialStore};
use crate::driver::Driver;
use crate::queue::{Enqueued, OutboundQueue};
use crate::registry::{ChannelRegistry, RemoveOutcome};
use crate::state::{ClientEvent, ConnectionSnapshot, ConnectionState};
use crate::transport::{Connector, WsConnector};

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

/// Connection-scoped mutable state.
pub(crate) struct Link {
    pub(crate) state: ConnectionState,
    pub(crate) session_id: Option<SessionId>,
    pub(crate) user_id: Option<String>,
    pub(crate) credential: Option<String>,
    pub(crate) last_activity: Option<DateTime<Utc>>,
    pub(crate) reconnect_attempts: u32,
    pub(crate) queue: OutboundQueue,
    /// Write channel into the driver. Present only while connected.
    pub(crate) outbound: Option<mpsc::UnboundedSender<String>>,
    /// Why the last connection ended, until the next `connect()`.
    pub(crate) last_error: Option<ClientError>,
    pub(crate) disposed: bool,
}

/// What to do with a frame that cannot be written right now.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Offline {
    Queue,
    Reject,
}

/// One `connect()` in flight. `task` is `None` while the credential is
/// still being resolved.
struct DriverHandle {
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl DriverHandle {
    fn is_active(&self) -> bool {
        self.task.as_ref().is_none_or(|task| !task.is_finished())
    }
}

pub(crate) struct Shared {
    pub(crate) settings: ClientSettings,
    pub(crate) connector: Arc<dyn Connector>,
    credentials: CredentialSources,
    pub(crate) link: Mutex<Link>,
    pub(crate) correlator: Mutex<Correlator>,
    pub(crate) registry: Mutex<ChannelRegistry>,
    events: Mutex<Option<broadcast::Sender<ClientEvent>>>,
    /// Serializes connect/disconnect/dispose.
    lifecycle: tokio::sync::Mutex<Option<DriverHandle>>,
}

impl Shared {
    pub(crate) fn emit(&self, event: ClientEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            // No receivers is fine.
            let _ = tx.send(event);
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut link = self.link.lock();
        if link.state != state {
            debug!(from = %link.state, to = %state, "connection state");
            link.state = state;
        }
    }

    pub(crate) fn touch(&self) {
        self.link.lock().last_activity = Some(Utc::now());
    }

    fn is_disposed(&self) -> bool {
        self.link.lock().disposed
    }

    /// Write `payload` on the live connection, or apply `offline`.
    pub(crate) fn dispatch(&self, payload: String, offline: Offline) -> Result<()> {
        let mut link = self.link.lock();
        if link.disposed {
            return Err(ClientError::Disposed);
        }
        let payload = match (&link.outbound, link.state) {
            (Some(tx), ConnectionState::Connected) => match tx.send(payload) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(payload)) => payload,
            },
            _ => payload,
        };
        match offline {
            Offline::Reject => Err(ClientError::NotConnected {
                state: link.state.to_string(),
            }),
            Offline::Queue => match link.queue.push(payload)? {
                Enqueued::Appended => {
                    trace!(queued = link.queue.len(), "message queued");
                    Ok(())
                }
                Enqueued::Evicted(oldest) => {
                    metrics::counter!("realtime_messages_dropped_total", "reason" => "queue_overflow")
                        .increment(1);
                    warn!(
                        age = ?oldest.enqueued_at.elapsed(),
                        "outbound queue full, dropped oldest message"
                    );
                    Ok(())
                }
            },
        }
    }

    /// Send a subscribe/unsubscribe envelope if connected.
    ///
    /// While offline nothing is sent; the driver resubscribes every live
    /// channel when the next connection is established.
    fn send_control(&self, message: &ClientMessage) {
        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, kind = message.kind(), "failed to serialize control message");
                return;
            }
        };
        let link = self.link.lock();
        match (&link.outbound, link.state) {
            (Some(tx), ConnectionState::Connected) => {
                let _ = tx.send(payload);
            }
            _ => trace!(kind = message.kind(), "offline, channel sync deferred"),
        }
    }

    fn unsubscribe(&self, channel: &str, id: &SubscriptionId) {
        let outcome = self.registry.lock().remove(channel, id);
        match outcome {
            RemoveOutcome::RemovedLast => {
                debug!(channel, "last handler removed");
                self.send_control(&ClientMessage::Unsubscribe {
                    channels: vec![channel.to_owned()],
                });
            }
            RemoveOutcome::Removed => trace!(channel, "handler removed"),
            RemoveOutcome::NotFound => {}
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Configures a [`RealtimeClient`].
pub struct ClientBuilder {
    settings: ClientSettings,
    connector: Option<Arc<dyn Connector>>,
    credentials: CredentialSources,
}

impl ClientBuilder {
    /// Replace the socket connector (defaults to [`WsConnector`]).
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Persisted credential source.
    #[must_use]
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = self.credentials.with_store(store);
        self
    }

    /// Interactive credential source.
    #[must_use]
    pub fn credential_prompt(mut self, prompt: Arc<dyn CredentialPrompt>) -> Self {
        self.credentials = self.credentials.with_prompt(prompt);
        self
    }

    /// Build the client. Nothing connects until [`RealtimeClient::connect`].
    pub fn build(self) -> RealtimeClient {
        let (events, _) = broadcast::channel(self.settings.event_buffer_size.max(1));
        let queue = OutboundQueue::new(&self.settings.queue);
        let shared = Shared {
            connector: self.connector.unwrap_or_else(|| Arc::new(WsConnector)),
            credentials: self.credentials,
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                session_id: None,
                user_id: None,
                credential: None,
                last_activity: None,
                reconnect_attempts: 0,
                queue,
                outbound: None,
                last_error: None,
                disposed: false,
            }),
            correlator: Mutex::new(Correlator::new()),
            registry: Mutex::new(ChannelRegistry::new()),
            events: Mutex::new(Some(events)),
            lifecycle: tokio::sync::Mutex::new(None),
            settings: self.settings,
        };
        RealtimeClient {
            shared: Arc::new(shared),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// Realtime protocol client.
///
/// Create one per process and share it by cloning. Call
/// [`dispose`](Self::dispose) when done; dropping the last handle does not
/// stop a running connection.
#[derive(Clone)]
pub struct RealtimeClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("url", &self.shared.settings.server_url)
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl RealtimeClient {
    /// Client over WebSocket with no credential store or prompt.
    pub fn new(settings: ClientSettings) -> Self {
        Self::builder(settings).build()
    }

    /// Start configuring a client.
    pub fn builder(settings: ClientSettings) -> ClientBuilder {
        ClientBuilder {
            settings,
            connector: None,
            credentials: CredentialSources::new(),
        }
    }

    /// Settings the client was built with.
    pub fn settings(&self) -> &ClientSettings {
        &self.shared.settings
    }

    /// Open the connection and wait until it is usable.
    ///
    /// Resolves once the welcome message arrives. Fails with
    /// [`ClientError::Authentication`] (before opening any socket) when no
    /// credential can be resolved, and with the terminal error when the
    /// connection cannot be established within the reconnect budget.
    /// Calling it while a connection is live or in progress waits on that
    /// connection instead of opening another.
    #[instrument(skip_all, fields(url = %self.shared.settings.server_url))]
    pub async fn connect(&self, credential: Option<String>) -> Result<()> {
        let shared = &self.shared;
        let cancel = {
            let mut lifecycle = shared.lifecycle.lock().await;
            if shared.is_disposed() {
                return Err(ClientError::Disposed);
            }
            if lifecycle.as_ref().is_some_and(DriverHandle::is_active) {
                if let Some(credential) = credential.filter(|c| !c.trim().is_empty()) {
                    shared.link.lock().credential = Some(credential);
                }
                drop(lifecycle);
                return self.wait_until_connected().await;
            }
            {
                let mut link = shared.link.lock();
                link.last_error = None;
                link.reconnect_attempts = 0;
            }
            shared.set_state(ConnectionState::Connecting);
            let cancel = CancellationToken::new();
            *lifecycle = Some(DriverHandle {
                task: None,
                cancel: cancel.clone(),
            });
            cancel
        };

        // The prompt may wait on a human; disconnect() must not.
        let remembered = shared.link.lock().credential.clone();
        let resolved = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(ClientError::Cancelled("disconnect requested".into()));
            }
            resolved = shared.credentials.resolve(credential, remembered) => resolved,
        };

        let ready = {
            let mut lifecycle = shared.lifecycle.lock().await;
            if cancel.is_cancelled() || shared.is_disposed() {
                return Err(ClientError::Cancelled("disconnect requested".into()));
            }
            let (credential, source) = match resolved {
                Ok(resolved) => resolved,
                Err(e) => {
                    *lifecycle = None;
                    {
                        let mut link = shared.link.lock();
                        link.state = ConnectionState::Disconnected;
                        link.last_error = Some(e.clone());
                    }
                    warn!(error = %e, "no credential for connect");
                    shared.emit(ClientEvent::Error(e.clone()));
                    shared.emit(ClientEvent::Disconnected {
                        error: Some(e.clone()),
                    });
                    return Err(e);
                }
            };
            debug!(?source, "credential resolved");
            shared.link.lock().credential = Some(credential);

            let (ready_tx, ready_rx) = oneshot::channel();
            let driver = Driver::new(Arc::clone(shared), cancel.clone(), ready_tx);
            let span = info_span!("realtime_driver", url = %shared.settings.server_url);
            let task = tokio::spawn(driver.run().instrument(span));
            *lifecycle = Some(DriverHandle {
                task: Some(task),
                cancel,
            });
            ready_rx
        };
        ready
            .await
            .unwrap_or_else(|_| Err(ClientError::Cancelled("connection driver stopped".into())))
    }

    async fn wait_until_connected(&self) -> Result<()> {
        let mut events = self.events();
        loop {
            match self.connection_state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => {
                    let last_error = self.shared.link.lock().last_error.clone();
                    return Err(last_error.unwrap_or_else(|| ClientError::NotConnected {
                        state: ConnectionState::Disconnected.to_string(),
                    }));
                }
                _ => {}
            }
            match events.recv().await {
                Ok(ClientEvent::Connected { .. }) => return Ok(()),
                Ok(ClientEvent::Disconnected { error }) => {
                    return Err(error.unwrap_or_else(|| {
                        ClientError::Cancelled("disconnect requested".into())
                    }));
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(ClientError::Disposed),
            }
        }
    }

    /// Close the connection with a normal closure.
    ///
    /// Pending requests fail with [`ClientError::Cancelled`]; no reconnect is
    /// attempted. Queued messages and subscriptions are kept for the next
    /// [`connect`](Self::connect). Safe to call in any state.
    #[instrument(skip_all)]
    pub async fn disconnect(&self) {
        self.shutdown(ClientError::Cancelled("disconnect requested".into()))
            .await;
    }

    async fn shutdown(&self, reason: ClientError) {
        let shared = &self.shared;
        let mut lifecycle = shared.lifecycle.lock().await;
        let previous = self.connection_state();

        if let Some(driver) = lifecycle.take() {
            driver.cancel.cancel();
            if let Some(task) = driver.task {
                if !task.is_finished() {
                    shared.set_state(ConnectionState::Closing);
                }
                if let Err(e) = task.await {
                    warn!(error = %e, "connection driver panicked");
                }
            }
        }
        {
            let mut link = shared.link.lock();
            if previous != ConnectionState::Disconnected {
                link.last_error = Some(reason.clone());
            }
            link.state = ConnectionState::Disconnected;
            link.session_id = None;
            link.outbound = None;
            link.reconnect_attempts = 0;
        }
        let failed = shared.correlator.lock().fail_all(&reason);
        if previous != ConnectionState::Disconnected {
            info!(failed_requests = failed, "disconnected");
            shared.emit(ClientEvent::Disconnected { error: None });
        }
    }

    /// Disconnect and release everything. Idempotent.
    ///
    /// Afterwards subscriptions are gone, the queue is empty, event receivers
    /// see the channel close, and every operation fails with
    /// [`ClientError::Disposed`].
    #[instrument(skip_all)]
    pub async fn dispose(&self) {
        let first = {
            let mut link = self.shared.link.lock();
            !std::mem::replace(&mut link.disposed, true)
        };
        self.shutdown(ClientError::Cancelled("client disposed".into()))
            .await;
        if first {
            self.shared.registry.lock().clear();
            self.shared.link.lock().queue.clear();
            let _ = self.shared.events.lock().take();
            info!("client disposed");
        }
    }

    /// Send a fire-and-forget message.
    ///
    /// A `timestamp` is added to object payloads lacking one. While not
    /// connected the message is queued and flushed, in order, after the next
    /// welcome.
    pub fn send(&self, message: Value) -> Result<()> {
        let payload = serde_json::to_string(&stamp_payload(message))?;
        self.shared.dispatch(payload, Offline::Queue)
    }

    /// Call `method` and wait for its response.
    ///
    /// Fails with [`ClientError::Timeout`] if no response arrives within
    /// `timeout`; a response arriving later is discarded. Offline behaviour
    /// follows `requests.offlinePolicy`. A queued request that times out or
    /// is dropped before the next connection is withdrawn from the queue.
    #[instrument(skip(self, params, timeout))]
    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let shared = &self.shared;
        if shared.is_disposed() {
            return Err(ClientError::Disposed);
        }
        let (request_id, mut settled) = shared.correlator.lock().register(method, params.clone());
        let mut guard = PendingGuard {
            shared,
            id: Some(request_id.clone()),
            queued: None,
        };

        let payload = ClientMessage::Request {
            id: request_id.clone(),
            method: method.to_owned(),
            params,
        }
        .to_json()?;
        let offline = match shared.settings.requests.offline_policy {
            OfflineRequestPolicy::FailFast => Offline::Reject,
            OfflineRequestPolicy::Queue => {
                guard.queued = Some(payload.clone());
                Offline::Queue
            }
        };
        shared.dispatch(payload, offline)?;
        metrics::counter!("realtime_requests_total").increment(1);
        debug!(%request_id, "request sent");

        let outcome = match tokio::time::timeout(timeout, &mut settled).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let expired = shared.correlator.lock().remove(&request_id).is_some();
                if expired {
                    guard.withdraw_queued();
                    guard.disarm();
                    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                    metrics::counter!("realtime_request_timeouts_total").increment(1);
                    warn!(%request_id, timeout_ms, "request timed out");
                    return Err(ClientError::Timeout {
                        request_id: request_id.into_inner(),
                        method: method.to_owned(),
                        timeout_ms,
                    });
                }
                // Settled concurrently; the value is already on its way.
                settled.await
            }
        };
        guard.disarm();
        outcome.unwrap_or_else(|_| Err(ClientError::Cancelled("request abandoned".into())))
    }

    /// [`request`](Self::request) with `requests.defaultTimeoutMs`.
    pub async fn request_default(&self, method: &str, params: Value) -> Result<Value> {
        let timeout = self.shared.settings.requests.default_timeout();
        self.request(method, params, timeout).await
    }

    /// Register `handler` for pushes on `channel`.
    ///
    /// The first handler on a channel sends a `subscribe` envelope when
    /// connected; otherwise the channel is subscribed on the next welcome.
    pub fn subscribe<F>(&self, channel: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if self.shared.is_disposed() {
            warn!(channel, "subscribe on disposed client ignored");
            return Subscription {
                shared: Weak::new(),
                channel: channel.to_owned(),
                id: SubscriptionId::new(),
                disposed: AtomicBool::new(true),
            };
        }
        let outcome = self.shared.registry.lock().add(channel, Arc::new(handler));
        if outcome.first_on_channel {
            debug!(channel, "first handler registered");
            self.shared.send_control(&ClientMessage::Subscribe {
                channels: vec![channel.to_owned()],
            });
        }
        Subscription {
            shared: Arc::downgrade(&self.shared),
            channel: channel.to_owned(),
            id: outcome.id,
            disposed: AtomicBool::new(false),
        }
    }

    /// Point-in-time snapshot.
    pub fn state(&self) -> ConnectionSnapshot {
        let pending_requests = self.shared.correlator.lock().len();
        let channels = self.shared.registry.lock().active_channels();
        let link = self.shared.link.lock();
        ConnectionSnapshot {
            state: link.state,
            session_id: link.session_id.clone(),
            user_id: link.user_id.clone(),
            has_credential: link.credential.is_some(),
            last_activity: link.last_activity,
            reconnect_attempts: link.reconnect_attempts,
            pending_requests,
            queued_messages: link.queue.len(),
            channels,
        }
    }

    /// Current state only.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.link.lock().state
    }

    /// Subscribe to lifecycle events.
    ///
    /// After [`dispose`](Self::dispose) the returned receiver is already
    /// closed.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        if let Some(tx) = self.shared.events.lock().as_ref() {
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(1);
        drop(tx);
        rx
    }
}

/// Removes an abandoned request from the table, and its envelope from the
/// outbound queue, when the caller drops the `request()` future.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: Option<RequestId>,
    /// Envelope that may still sit in the outbound queue.
    queued: Option<String>,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.id = None;
        self.queued = None;
    }

    fn withdraw_queued(&mut self) {
        if let Some(payload) = self.queued.take() {
            if self.shared.link.lock().queue.remove(&payload) {
                debug!("unsent request withdrawn from queue");
            }
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if self.shared.correlator.lock().remove(&id).is_some() {
                debug!(request_id = %id, "request abandoned");
            }
            self.withdraw_queued();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to one channel registration.
///
/// Dropping it does not unsubscribe; call [`dispose`](Self::dispose).
#[must_use = "the handler stays registered until dispose() is called"]
pub struct Subscription {
    shared: Weak<Shared>,
    channel: String,
    id: SubscriptionId,
    disposed: AtomicBool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Subscription {
    /// Channel this handler listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Registration id.
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Whether [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Remove the handler. Idempotent.
    ///
    /// Removing the channel's last handler sends an `unsubscribe` envelope
    /// when connected.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.unsubscribe(&self.channel, &self.id);
        }
    }
}
