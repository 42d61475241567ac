//! One connected attendee.
//!
//! A session owns nothing of the meeting: it decodes inbound commands and
//! forwards them over the meeting's action channel, and it drains two
//! bounded queues (regular outbound traffic and a single-slot disconnect
//! reason) onto the socket. The reader and writer halves run as separate
//! tasks; whichever exits first drags the other down through the socket.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{interval, timeout, timeout_at, Instant};

use crate::meeting::{MeetingHandle, UserAction};
use crate::ws::protocol::{self, DecodeError, Inbound, Outbound};

/// Keepalive ping cadence on the write path.
const PING_INTERVAL: Duration = Duration::from_secs(60);
/// Deadline for any single socket write.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// The reader gives up unless a pong arrives within this window.
const READ_DEADLINE: Duration = Duration::from_secs(90);
/// Outbound queue bound; broadcasts past it are dropped, never awaited.
const OUTBOUND_QUEUE: usize = 100;

/// Identity resolved from the membership key during registration. Set
/// exactly once by the meeting driver and immutable afterwards; the only
/// thing the session reader consults for its admin gate.
#[derive(Debug, Clone)]
pub struct Identity {
    pub authid: i32,
    pub keyid: i32,
    pub name: String,
    pub admin: bool,
}

pub struct Session {
    meeting: MeetingHandle,
    token: String,
    first_message: i32,
    remote: String,
    outbound_tx: mpsc::Sender<Outbound>,
    disconnect_tx: mpsc::Sender<String>,
    identity: OnceLock<Identity>,
}

/// Receiver halves owned by the writer task.
pub struct SessionReceivers {
    outbound: mpsc::Receiver<Outbound>,
    disconnect: mpsc::Receiver<String>,
}

impl Session {
    pub fn new(
        meeting: MeetingHandle,
        token: String,
        first_message: i32,
        remote: String,
    ) -> (Arc<Self>, SessionReceivers) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
        let session = Arc::new(Self {
            meeting,
            token,
            first_message,
            remote,
            outbound_tx,
            disconnect_tx,
            identity: OnceLock::new(),
        });
        let receivers = SessionReceivers {
            outbound: outbound_rx,
            disconnect: disconnect_rx,
        };
        (session, receivers)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn first_message(&self) -> i32 {
        self.first_message
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn set_identity(&self, identity: Identity) {
        let _ = self.identity.set(identity);
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    /// Queue a message for the socket. Never blocks the caller: a full
    /// queue drops the message with a log line.
    pub fn send(&self, message: Outbound) {
        match self.outbound_tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(token = %self.token, "send queue full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(token = %self.token, "send queue closed, dropping message");
            }
        }
    }

    pub fn send_error(&self, msg: &str) {
        self.send(Outbound::error(msg));
    }

    /// Ask the writer to close this session. The slot holds one reason; a
    /// second pending disconnect is dropped.
    pub fn push_disconnect(&self, reason: &str) {
        let _ = self.disconnect_tx.try_send(reason.to_string());
    }

    /// Decode one raw inbound frame and forward whatever it yields.
    pub(crate) async fn handle_inbound(self: &Arc<Self>, raw: &str) {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(token = %self.token, error = %err, "failed to parse json on connection");
                return;
            }
        };
        match protocol::decode(&value) {
            Ok(Some(command)) => self.dispatch(command).await,
            Ok(None) => {}
            Err(DecodeError::Ignored(reason)) => {
                tracing::warn!(token = %self.token, "{reason}");
            }
            Err(DecodeError::Rejected(msg)) => self.send_error(msg),
        }
    }

    async fn dispatch(self: &Arc<Self>, command: Inbound) {
        let action = match command {
            Inbound::Message { message } => UserAction::Message {
                session: self.clone(),
                message,
            },
            Inbound::Vote { question, vote } => UserAction::Vote {
                session: self.clone(),
                question,
                vote,
            },
            Inbound::Open => {
                if !self.admin_check("open meeting") {
                    return;
                }
                UserAction::OpenFinish {
                    session: self.clone(),
                    open: true,
                }
            }
            Inbound::Finish => {
                if !self.admin_check("finish meeting") {
                    return;
                }
                UserAction::OpenFinish {
                    session: self.clone(),
                    open: false,
                }
            }
            Inbound::NewPoll {
                question,
                answers,
                minutes,
            } => {
                if !self.admin_check("create new poll") {
                    return;
                }
                UserAction::NewPoll {
                    session: self.clone(),
                    question,
                    answers,
                    minutes,
                }
            }
            Inbound::AbortPoll => {
                if !self.admin_check("abort running poll") {
                    return;
                }
                UserAction::AbortPoll {
                    session: self.clone(),
                }
            }
            Inbound::Kick { user, canrejoin } => {
                if !self.admin_check("kick another user") {
                    return;
                }
                UserAction::KickUser {
                    session: self.clone(),
                    target: user,
                    canrejoin,
                }
            }
        };

        // Bounded action channel: a flooding client parks here instead of
        // growing a queue.
        let _ = self.meeting.actions.send(action).await;
    }

    /// Admin gate for privileged commands. Identity is installed once at
    /// registration, so reading it from the reader task is safe.
    fn admin_check(&self, what: &str) -> bool {
        let identity = self.identity.get();
        let admin = identity.map(|i| i.admin).unwrap_or(false);
        if !admin {
            let name = identity.map(|i| i.name.as_str()).unwrap_or("");
            tracing::warn!(member = name, "attempt by non-admin to {what}");
            self.send_error("Permission denied");
        }
        admin
    }
}

/// Read path: decode frames until the socket dies or the pong deadline
/// lapses, then unregister from the meeting.
pub async fn run_reader(session: Arc<Session>, mut stream: SplitStream<WebSocket>) {
    let mut deadline = Instant::now() + READ_DEADLINE;
    loop {
        match timeout_at(deadline, stream.next()).await {
            Err(_) => {
                tracing::info!(token = %session.token(), "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                tracing::info!(token = %session.token(), error = %err, "failed to read on connection");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => session.handle_inbound(text.as_str()).await,
            Ok(Some(Ok(Message::Pong(_)))) => {
                deadline = Instant::now() + READ_DEADLINE;
            }
            Ok(Some(Ok(Message::Close(_)))) => break,
            // Pings are answered by the socket layer itself; binary frames
            // have no meaning here.
            Ok(Some(Ok(_))) => {}
        }
    }

    let _ = session.meeting.unregister.send(session.clone()).await;
    tracing::debug!(token = %session.token(), "connection closed in reading");
}

/// Write path: drain the disconnect slot, the outbound queue and the ping
/// ticker onto the socket. Dropping the sink on exit closes the socket,
/// which in turn ends the reader.
pub async fn run_writer(
    session: Arc<Session>,
    mut sink: SplitSink<WebSocket, Message>,
    mut receivers: SessionReceivers,
) {
    let mut ping = interval(PING_INTERVAL);
    // The first tick completes immediately; skip it.
    ping.tick().await;

    loop {
        tokio::select! {
            reason = receivers.disconnect.recv() => {
                if let Some(reason) = reason {
                    tracing::info!(token = %session.token(), %reason, "disconnecting session");
                    if let Err(err) = write_json(&mut sink, &Outbound::disconnect(&reason)).await {
                        tracing::warn!(token = %session.token(), error = %err, "error writing disconnect message");
                    }
                } else {
                    let _ = timeout(WRITE_DEADLINE, sink.send(Message::Close(None))).await;
                }
                break;
            }
            message = receivers.outbound.recv() => {
                match message {
                    Some(message) => {
                        if let Err(err) = write_json(&mut sink, &message).await {
                            tracing::info!(token = %session.token(), error = %err, "error writing to socket");
                            break;
                        }
                    }
                    None => {
                        let _ = timeout(WRITE_DEADLINE, sink.send(Message::Close(None))).await;
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                match timeout(WRITE_DEADLINE, sink.send(Message::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }

    tracing::debug!(token = %session.token(), "connection closed in writing");
}

async fn write_json(
    sink: &mut SplitSink<WebSocket, Message>,
    payload: &Outbound,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(payload).map_err(axum::Error::new)?;
    match timeout(WRITE_DEADLINE, sink.send(Message::Text(text.into()))).await {
        Ok(result) => result,
        Err(elapsed) => Err(axum::Error::new(elapsed)),
    }
}
