//! Connection driver.
//!
//! One task per `connect()`, owning the socket for its whole life:
//! open, authenticate, pump frames until the connection ends, then either
//! back off and go around again or stop. Every state transition after
//! `connect()` returns happens here.

use std::sync::Arc;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tether_core::{ClientError, ClientMessage, Result, ServerMessage, SessionId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::client::Shared;
use crate::heartbeat::{Beat, HeartbeatMonitor};
use crate::queue::QueuedMessage;
use crate::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::router::{Routed, Router};
use crate::state::{ClientEvent, ConnectionState};
use crate::transport::{CloseInfo, Frame, FrameSink, Socket};

/// Identity assigned by the welcome message.
struct Welcome {
    session_id: SessionId,
    user_id: Option<String>,
}

/// How one connection ended.
enum SessionEnd {
    /// `disconnect()` or `dispose()` cancelled the driver.
    Cancelled,
    /// The connection failed or was lost.
    Failed(ClientError),
}

pub(crate) struct Driver {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    policy: ReconnectPolicy,
    ready: Option<oneshot::Sender<Result<()>>>,
}

impl Driver {
    pub(crate) fn new(
        shared: Arc<Shared>,
        cancel: CancellationToken,
        ready: oneshot::Sender<Result<()>>,
    ) -> Self {
        let policy = ReconnectPolicy::new(shared.settings.reconnect.clone());
        Self {
            shared,
            cancel,
            policy,
            ready: Some(ready),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let failure = match self.run_session().await {
                SessionEnd::Cancelled => {
                    debug!("driver cancelled");
                    self.settle_ready(Err(ClientError::Cancelled("disconnect requested".into())));
                    return;
                }
                SessionEnd::Failed(failure) => failure,
            };

            if failure.is_terminal() || !self.shared.settings.auto_reconnect {
                self.terminate(failure);
                return;
            }
            warn!(error = %failure, "connection lost");
            self.shared.emit(ClientEvent::Error(failure));

            match self.policy.next_decision() {
                ReconnectDecision::Retry { attempt, delay } => {
                    {
                        let mut link = self.shared.link.lock();
                        link.state = ConnectionState::Reconnecting;
                        link.reconnect_attempts = attempt;
                    }
                    metrics::counter!("realtime_reconnects_total").increment(1);
                    info!(attempt, ?delay, "reconnecting");
                    self.shared.emit(ClientEvent::Reconnecting { attempt, delay });
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.cancel.cancelled() => {
                            self.settle_ready(Err(ClientError::Cancelled("disconnect requested".into())));
                            return;
                        }
                    }
                }
                ReconnectDecision::Exhausted { attempts } => {
                    self.terminate(ClientError::ConnectionExhausted { attempts });
                    return;
                }
            }
        }
    }

    /// Open, authenticate, and pump one connection.
    #[instrument(skip_all, fields(attempt = self.policy.attempts()))]
    async fn run_session(&mut self) -> SessionEnd {
        self.shared.set_state(ConnectionState::Connecting);
        let handshake_timeout = self.shared.settings.handshake_timeout();
        let handshake = tokio::time::timeout(handshake_timeout, self.open_and_authenticate());

        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return SessionEnd::Cancelled,
            result = handshake => result,
        };
        let (socket, welcome) = match result {
            Ok(Ok(established)) => established,
            Ok(Err(e)) => return SessionEnd::Failed(e),
            Err(_) => {
                return SessionEnd::Failed(ClientError::Transport(format!(
                    "handshake timed out after {}ms",
                    handshake_timeout.as_millis()
                )));
            }
        };
        self.pump(socket, welcome).await
    }

    async fn open_and_authenticate(&self) -> Result<(Socket, Welcome)> {
        let url = &self.shared.settings.server_url;
        let mut socket = self.shared.connector.connect(url).await?;
        metrics::counter!("realtime_connects_total").increment(1);
        self.shared.set_state(ConnectionState::Authenticating);

        let token = self
            .shared
            .link
            .lock()
            .credential
            .clone()
            .ok_or_else(|| ClientError::Authentication("no credential resolved".into()))?;
        let frame = ClientMessage::Authenticate { token }.to_json()?;
        socket.sink.send(Frame::Text(frame)).await?;

        // Nothing is application data until the welcome arrives.
        loop {
            let frame = socket.stream.next().await.ok_or_else(|| {
                ClientError::Transport("connection closed during handshake".into())
            })??;
            match frame {
                Frame::Text(text) => match ServerMessage::decode(&text) {
                    Ok(ServerMessage::ConnectionEstablished {
                        connection_id,
                        user_id,
                    }) => {
                        return Ok((
                            socket,
                            Welcome {
                                session_id: connection_id,
                                user_id,
                            },
                        ));
                    }
                    Ok(ServerMessage::Error { code, message }) => {
                        return Err(ClientError::Authentication(match code {
                            Some(code) => format!("server rejected credential [{code}]: {message}"),
                            None => format!("server rejected credential: {message}"),
                        }));
                    }
                    Ok(other) => debug!(kind = other.kind(), "ignoring frame before welcome"),
                    Err(e) => warn!(error = %e, "dropping malformed frame during handshake"),
                },
                Frame::Close(info) => return Err(closed_by_server(info)),
                Frame::Ping(_) | Frame::Pong(_) => {}
            }
        }
    }

    /// Move into Connected: the write channel opens and the queue is taken
    /// under the same lock, so every queued frame precedes every frame sent
    /// through the channel.
    fn enter_connected(
        &mut self,
        welcome: &Welcome,
    ) -> (mpsc::UnboundedReceiver<String>, Vec<QueuedMessage>) {
        self.policy.reset();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut link = self.shared.link.lock();
        link.state = ConnectionState::Connected;
        link.session_id = Some(welcome.session_id.clone());
        link.user_id.clone_from(&welcome.user_id);
        link.reconnect_attempts = 0;
        link.last_activity = Some(Utc::now());
        link.outbound = Some(tx);
        (rx, link.queue.drain())
    }

    /// Close the write channel and requeue anything accepted but not written.
    fn leave_connected(&self, outbound: &mut mpsc::UnboundedReceiver<String>, mut unsent: Vec<String>) {
        let mut link = self.shared.link.lock();
        link.outbound = None;
        link.session_id = None;
        while let Ok(payload) = outbound.try_recv() {
            unsent.push(payload);
        }
        if !unsent.is_empty() {
            debug!(count = unsent.len(), "requeueing unsent frames");
            link.queue.requeue_front(unsent);
        }
    }

    async fn pump(&mut self, mut socket: Socket, welcome: Welcome) -> SessionEnd {
        let (mut outbound, drained) = self.enter_connected(&welcome);
        let flushed = drained.len();

        let mut unsent: Vec<String> = Vec::new();
        let mut backlog = drained.into_iter().map(|m| m.payload);
        while let Some(payload) = backlog.next() {
            if let Err(e) = socket.sink.send(Frame::Text(payload.clone())).await {
                unsent.push(payload);
                unsent.extend(backlog);
                self.leave_connected(&mut outbound, unsent);
                return SessionEnd::Failed(e);
            }
        }

        let channels = self.shared.registry.lock().active_channels();
        if !channels.is_empty() {
            let resubscribe = ClientMessage::Subscribe {
                channels: channels.clone(),
            };
            if let Err(e) = send_message(&mut socket.sink, &resubscribe).await {
                self.leave_connected(&mut outbound, unsent);
                return SessionEnd::Failed(e);
            }
        }

        info!(
            session_id = %welcome.session_id,
            flushed,
            channels = channels.len(),
            "connected"
        );
        self.shared.emit(ClientEvent::Connected {
            session_id: welcome.session_id.clone(),
        });
        self.settle_ready(Ok(()));

        let mut heartbeat = HeartbeatMonitor::new(&self.shared.settings.heartbeat, Instant::now());
        let period = heartbeat.interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    let close = Frame::Close(Some(CloseInfo::normal("client disconnect")));
                    if let Err(e) = socket.sink.send(close).await {
                        debug!(error = %e, "close frame not delivered");
                    }
                    break SessionEnd::Cancelled;
                }
                frame = socket.stream.next() => match frame {
                    Some(Ok(frame)) => {
                        heartbeat.record_activity(Instant::now());
                        self.shared.touch();
                        if let Err(e) = self.handle_frame(frame, &mut socket.sink).await {
                            break SessionEnd::Failed(e);
                        }
                    }
                    Some(Err(e)) => break SessionEnd::Failed(e),
                    None => {
                        break SessionEnd::Failed(ClientError::Transport(
                            "connection closed by peer".into(),
                        ));
                    }
                },
                Some(payload) = outbound.recv() => {
                    if let Err(e) = socket.sink.send(Frame::Text(payload.clone())).await {
                        unsent.push(payload);
                        break SessionEnd::Failed(e);
                    }
                }
                _ = ticker.tick() => match heartbeat.on_tick(Instant::now()) {
                    Beat::Ping => {
                        trace!("heartbeat ping");
                        if let Err(e) = send_message(&mut socket.sink, &ClientMessage::Ping).await {
                            break SessionEnd::Failed(e);
                        }
                    }
                    Beat::Dead { silent_for } => {
                        warn!(?silent_for, "heartbeat missed, closing socket");
                        let _ = socket.sink.close().await;
                        break SessionEnd::Failed(ClientError::Transport(format!(
                            "no traffic for {}ms",
                            silent_for.as_millis()
                        )));
                    }
                },
            }
        };

        self.leave_connected(&mut outbound, unsent);
        end
    }

    /// Handle one inbound frame. An error ends the connection.
    async fn handle_frame(&self, frame: Frame, sink: &mut FrameSink) -> Result<()> {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Ping(_) | Frame::Pong(_) => return Ok(()),
            Frame::Close(info) => return Err(closed_by_server(info)),
        };
        let message = match ServerMessage::decode(&text) {
            Ok(message) => message,
            Err(e) => {
                metrics::counter!("realtime_messages_dropped_total", "reason" => "malformed")
                    .increment(1);
                warn!(error = %e, "dropping malformed frame");
                return Ok(());
            }
        };
        trace!(kind = message.kind(), "inbound");

        match Router::new(&self.shared.correlator, &self.shared.registry).route(message) {
            Routed::PingReceived => send_message(sink, &ClientMessage::Pong).await?,
            Routed::ServerError(e) => {
                warn!(error = %e, "server reported error");
                self.shared.emit(ClientEvent::Error(e));
            }
            Routed::UnexpectedWelcome => debug!("ignoring repeated welcome"),
            Routed::Settled(_)
            | Routed::LateResponse(_)
            | Routed::Delivered { .. }
            | Routed::PongReceived
            | Routed::Ignored(_) => {}
        }
        Ok(())
    }

    /// Stop for good: fail everything pending and report the error.
    fn terminate(&mut self, failure: ClientError) {
        {
            let mut link = self.shared.link.lock();
            link.state = ConnectionState::Disconnected;
            link.session_id = None;
            link.outbound = None;
            link.last_error = Some(failure.clone());
            if matches!(failure, ClientError::Authentication(_)) {
                // Force re-resolution on the next connect().
                link.credential = None;
            }
        }
        let failed = self.shared.correlator.lock().fail_all(&failure);
        error!(error = %failure, code = failure.code(), failed_requests = failed, "connection terminated");
        self.shared.emit(ClientEvent::Error(failure.clone()));
        self.shared.emit(ClientEvent::Disconnected {
            error: Some(failure.clone()),
        });
        self.settle_ready(Err(failure));
    }

    fn settle_ready(&mut self, result: Result<()>) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(result);
        }
    }
}

async fn send_message(sink: &mut FrameSink, message: &ClientMessage) -> Result<()> {
    sink.send(Frame::Text(message.to_json()?)).await
}

fn closed_by_server(info: Option<CloseInfo>) -> ClientError {
    ClientError::Transport(match info {
        Some(info) => format!("server closed connection ({}: {})", info.code, info.reason),
        None => "server closed connection".into(),
    })
}
