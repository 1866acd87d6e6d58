//! Per-connection lifecycle
//!
//! Each socket gets one read loop (this task) and one write task. Every frame
//! headed for the client, whether a reply or a fan-out from another
//! connection, goes through the same unbounded channel, so writes are
//! serialized. The read loop refreshes an idle deadline on every received
//! message and sends a PING on a fixed interval.
//!
//! ```text
//! PendingTicket ──▶ Upgrading ──▶ Open ──▶ Closing ──▶ Closed
//!       └───────────────┴──────────────────────▲
//! ```

use crate::core::{
    ErrorKind, SessionIdentity, SockError, SocketAction, SocketId, SocketMessage, Ticket,
};
use crate::registry::{Frame, FrameSender};
use crate::server::host::{SockHost, encode_frame, json_frame};
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, SinkExt, StreamExt};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Registry timeouts in a row before the connection gives up
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// How long teardown waits for queued frames to flush
const WRITER_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake checked, ticket not yet consumed
    PendingTicket,
    /// Ticket consumed, connection not yet recorded everywhere
    Upgrading,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_advance(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (PendingTicket, Upgrading)
                | (PendingTicket, Closing)
                | (Upgrading, Open)
                | (Upgrading, Closing)
                | (Open, Closing)
                | (Closing, Closed)
        )
    }

    pub fn advance(&mut self, next: ConnectionState) -> Result<(), SockError> {
        if !self.can_advance(next) {
            return Err(SockError::Internal(format!(
                "illegal connection transition {:?} -> {:?}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }

    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a close frame
    Client,
    /// The transport ended or failed
    Disconnected,
    /// Nothing received within the idle timeout
    Idle,
    /// Registry commands kept timing out
    Unresponsive,
    /// Ticket rejected after upgrade
    Rejected,
    /// Frame handling panicked
    Fault,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Client => "client",
            CloseReason::Disconnected => "disconnected",
            CloseReason::Idle => "idle",
            CloseReason::Unresponsive => "unresponsive",
            CloseReason::Rejected => "rejected",
            CloseReason::Fault => "fault",
        }
    }

    fn close_code(self) -> u16 {
        match self {
            CloseReason::Client | CloseReason::Disconnected | CloseReason::Idle => {
                close_code::NORMAL
            }
            CloseReason::Unresponsive => close_code::AGAIN,
            CloseReason::Rejected => close_code::POLICY,
            CloseReason::Fault => close_code::ERROR,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One open socket as the orchestrator sees it
pub(super) struct Connection {
    pub(super) host: Arc<SockHost>,
    pub(super) session: SessionIdentity,
    pub(super) connection_id: String,
    pub(super) socket_id: SocketId,
    outbound: FrameSender,
    state: ConnectionState,
    timeouts: u32,
}

impl Connection {
    fn new(
        host: Arc<SockHost>,
        session: SessionIdentity,
        ticket: &Ticket,
        outbound: FrameSender,
    ) -> Self {
        let socket_id = SocketId::new(session.sub.clone(), ticket.connection_id.clone());
        Self {
            host,
            session,
            connection_id: ticket.connection_id.clone(),
            socket_id,
            outbound,
            state: ConnectionState::PendingTicket,
            timeouts: 0,
        }
    }

    pub(super) fn state(&self) -> ConnectionState {
        self.state
    }

    /// Queue a frame for this socket; false once the writer is gone
    pub(super) fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    pub(super) fn reply(&self, message: &SocketMessage) -> Result<(), SockError> {
        let frame = encode_frame(message)?;
        if !self.send(frame) {
            tracing::debug!(connection_id = %self.connection_id, "reply dropped, writer closed");
        }
        Ok(())
    }

    pub(super) fn reply_json<T: serde::Serialize>(
        &self,
        action: SocketAction,
        topic: &str,
        value: &T,
    ) -> Result<(), SockError> {
        let frame = json_frame(action, topic, value)?;
        self.send(frame);
        Ok(())
    }

    /// Tell the client a request failed
    pub(super) fn reply_error(&self, topic: &str, error: &SockError) -> Result<(), SockError> {
        self.reply_json(SocketAction::Error, topic, &error.to_response())
    }

    /// Consume the ticket and record the connection with the store and cache
    async fn open(&mut self, ticket: &Ticket) -> Result<(), SockError> {
        let subscriber = self
            .host
            .registry
            .create_connection(&self.session.sub, ticket, self.outbound.clone())
            .await?;
        self.state.advance(ConnectionState::Upgrading)?;
        self.session = subscriber.session;

        self.host
            .store
            .init_connection(&self.session, &self.connection_id)
            .await?;
        if let Err(e) = self.host.cache.register_socket(&self.socket_id).await {
            tracing::warn!(socket_id = %self.socket_id, error = %e, "failed to register socket");
        }

        self.state.advance(ConnectionState::Open)?;
        tracing::debug!(
            connection_id = %self.connection_id,
            user_sub = %self.session.sub,
            "connection open"
        );
        Ok(())
    }

    async fn read_loop(&mut self, stream: &mut SplitStream<WebSocket>) -> CloseReason {
        let config = self.host.config.clone();
        let idle = config.idle_timeout();
        let ping_every = config.ping_interval();

        let ping_frame = match encode_frame(&SocketMessage::new(SocketAction::PING, "")) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "cannot encode keepalive frame");
                return CloseReason::Disconnected;
            }
        };

        let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadline = Instant::now() + idle;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return CloseReason::Idle,
                _ = ping.tick() => {
                    if !self.send(ping_frame.clone()) {
                        return CloseReason::Disconnected;
                    }
                }
                next = stream.next() => {
                    let message = match next {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            tracing::debug!(
                                connection_id = %self.connection_id,
                                error = %e,
                                "websocket read error"
                            );
                            return CloseReason::Disconnected;
                        }
                        None => return CloseReason::Disconnected,
                    };
                    deadline = Instant::now() + idle;

                    let raw = match &message {
                        Message::Binary(bytes) => Some(&bytes[..]),
                        Message::Text(text) => Some(text.as_bytes()),
                        Message::Close(_) => return CloseReason::Client,
                        Message::Ping(_) | Message::Pong(_) => None,
                    };
                    if let Some(raw) = raw {
                        let Some(result) = contained(self.handle_frame(raw)).await else {
                            tracing::error!(
                                connection_id = %self.connection_id,
                                "frame handler panicked"
                            );
                            return CloseReason::Fault;
                        };
                        if self.record_result(result) {
                            return CloseReason::Unresponsive;
                        }
                    }
                }
            }
        }
    }

    /// Log a per-frame failure; true when the connection should close
    fn record_result(&mut self, result: Result<(), SockError>) -> bool {
        let id = &self.connection_id;
        let Err(error) = result else {
            self.timeouts = 0;
            return false;
        };
        match error.kind() {
            ErrorKind::Timeout => {
                self.timeouts += 1;
                tracing::warn!(
                    connection_id = %id,
                    timeouts = self.timeouts,
                    error = %error,
                    "frame timed out"
                );
                return self.timeouts >= MAX_CONSECUTIVE_TIMEOUTS;
            }
            ErrorKind::Input => {
                tracing::debug!(connection_id = %id, error = %error, "dropping frame")
            }
            ErrorKind::Auth => {
                tracing::debug!(connection_id = %id, error = %error, "frame not authorized")
            }
            ErrorKind::NotFound => {
                tracing::debug!(connection_id = %id, error = %error, "frame target gone")
            }
            ErrorKind::TransientIo => {
                tracing::warn!(connection_id = %id, error = %error, "frame failed")
            }
            ErrorKind::Fatal => {
                tracing::error!(connection_id = %id, error = %error, "frame failed")
            }
        }
        self.timeouts = 0;
        false
    }

    /// Undo everything `open` recorded and tell peers this socket left
    async fn release(&mut self) {
        let host = self.host.clone();

        if let Err(e) = host
            .registry
            .delete_connection(&self.session.sub, &self.connection_id)
            .await
        {
            tracing::warn!(
                connection_id = %self.connection_id,
                error = %e,
                "failed to delete connection"
            );
        }

        let removed = match host.cache.handle_unsub(&self.socket_id).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(socket_id = %self.socket_id, error = %e, "failed to untrack socket");
                Default::default()
            }
        };

        for (topic, remaining) in removed {
            if let Err(e) = self.notify_departure(&topic, remaining).await {
                tracing::warn!(topic = %topic, error = %e, "failed to notify participants");
            }
        }

        if let Err(e) = host
            .store
            .remove_connection(&self.session, &self.connection_id)
            .await
        {
            tracing::warn!(
                connection_id = %self.connection_id,
                error = %e,
                "failed to remove connection row"
            );
        }
    }

    /// UNSUBSCRIBE_TOPIC notice then a participant snapshot to whoever is left
    pub(super) async fn notify_departure(
        &self,
        topic: &str,
        remaining: crate::core::Targets,
    ) -> Result<(), SockError> {
        let local = self.host.registry.get_topic_targets(topic).await?;
        let mut targets = remaining.union(&local);
        targets.remove(&self.connection_id);
        if targets.is_empty() {
            return Ok(());
        }

        let notice = SocketMessage::new(SocketAction::UnsubscribeTopic, topic)
            .with_payload(self.socket_id.to_string());
        self.host
            .deliver(topic, &targets, encode_frame(&notice)?)
            .await?;
        self.host
            .push_participants(&self.session, topic, &targets)
            .await?;
        Ok(())
    }

    async fn teardown(
        &mut self,
        reason: CloseReason,
        close: oneshot::Sender<CloseReason>,
        mut writer: JoinHandle<()>,
    ) {
        if let Err(e) = self.state.advance(ConnectionState::Closing) {
            tracing::error!(
                connection_id = %self.connection_id,
                error = %e,
                "teardown out of order"
            );
            return;
        }
        tracing::debug!(
            connection_id = %self.connection_id,
            user_sub = %self.session.sub,
            reason = %reason,
            "closing connection"
        );

        self.release().await;

        let _ = close.send(reason);
        if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }

        if let Err(e) = self.state.advance(ConnectionState::Closed) {
            tracing::error!(
                connection_id = %self.connection_id,
                error = %e,
                "teardown out of order"
            );
        }
    }
}

/// Drive one upgraded socket from ticket consumption to close
pub(super) async fn serve(
    socket: WebSocket,
    host: Arc<SockHost>,
    session: SessionIdentity,
    ticket: Ticket,
) {
    let (mut sink, mut stream) = socket.split();
    let (outbound, frames) = mpsc::unbounded_channel();
    let mut conn = Connection::new(host, session, &ticket, outbound);

    if let Err(e) = conn.open(&ticket).await {
        tracing::debug!(connection_id = %conn.connection_id, error = %e, "handshake rejected");
        let consumed = conn.state() == ConnectionState::Upgrading;
        if conn.state.advance(ConnectionState::Closing).is_ok() && consumed {
            conn.release().await;
        }
        reject(&mut sink, &e).await;
        let _ = conn.state.advance(ConnectionState::Closed);
        return;
    }

    let (close_tx, close_rx) = oneshot::channel();
    let writer = tokio::spawn(write_loop(sink, frames, close_rx));

    let reason = conn.read_loop(&mut stream).await;
    conn.teardown(reason, close_tx, writer).await;
}

/// Await a frame handler; `None` when it panicked
async fn contained<F: Future>(handler: F) -> Option<F::Output> {
    AssertUnwindSafe(handler).catch_unwind().await.ok()
}

async fn reject(sink: &mut SplitSink<WebSocket, Message>, error: &SockError) {
    if let Ok(frame) = json_frame(SocketAction::Error, "", &error.to_response()) {
        let _ = sink.send(to_message(&frame)).await;
    }
    let _ = sink.send(close_message(CloseReason::Rejected)).await;
    let _ = sink.close().await;
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut close: oneshot::Receiver<CloseReason>,
) {
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if sink.send(to_message(&frame)).await.is_err() {
                    return;
                }
            }
            reason = &mut close => {
                while let Ok(frame) = frames.try_recv() {
                    if sink.send(to_message(&frame)).await.is_err() {
                        return;
                    }
                }
                let reason = reason.unwrap_or(CloseReason::Disconnected);
                let _ = sink.send(close_message(reason)).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

/// Frames that are valid UTF-8 go out as text, anything else as binary
fn to_message(frame: &Frame) -> Message {
    match std::str::from_utf8(frame) {
        Ok(text) => Message::Text(text.to_owned().into()),
        Err(_) => Message::Binary(frame.to_vec().into()),
    }
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.close_code(),
        reason: reason.as_str().into(),
    }))
}
