//! Per-connected-client state held by the server (spec §4.3): selected
//! subprotocol, subscription table, client-advertised channel table,
//! parameter-update subscription set, connection-graph subscription flag.
//!
//! A [`ClientSession`] owns the connection's outbound queue and is never
//! handed to application code directly; application handlers instead
//! receive a cheap, cloneable [`SessionHandle`] and route sends back
//! through the server (spec §5 shared-resource policy).

use std::collections::{HashMap, HashSet};

use log::warn;
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::ws::Message;

use crate::error::{ProtocolError, Result};
use crate::protocol::json::{ClientChannel, ServerMessage};
use crate::subscriptions::SubscriptionTable;

pub type SessionId = Uuid;

/// A lightweight, `Clone`-able reference to a connected client, handed to
/// application handlers in place of the session itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: SessionId,
    pub name: String,
}

/// The connection's lifecycle state (spec §4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// Per-connection server-side state for one client.
pub struct ClientSession {
    pub id: SessionId,
    pub name: String,
    pub state: SessionState,
    out_tx: mpsc::Sender<Message>,
    /// This client's own subscription ids, bound to server channel ids.
    /// Scoped to this session: subscription ids are only unique per
    /// client (spec §3).
    pub subscriptions: SubscriptionTable,
    /// Channels this client has advertised to the server, keyed by the
    /// client-chosen id.
    pub advertisements: HashMap<u32, ClientChannel>,
    pub parameter_subscriptions: HashSet<String>,
    pub connection_graph_subscribed: bool,
}

impl ClientSession {
    pub fn new(name: impl Into<String>, out_tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            state: SessionState::Handshaking,
            out_tx,
            subscriptions: SubscriptionTable::new(),
            advertisements: HashMap::new(),
            parameter_subscriptions: HashSet::new(),
            connection_graph_subscribed: false,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            name: self.name.clone(),
        }
    }

    /// Marks the handshake complete; only valid transition into `Open`.
    pub fn open(&mut self) {
        self.state = SessionState::Open;
    }

    pub fn begin_closing(&mut self) {
        self.state = SessionState::Closing;
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Sends a JSON control frame. Non-blocking: a full outbound queue
    /// logs and returns `TransportClosed` rather than blocking the caller
    /// (spec §5 backpressure policy — one slow client must not stall
    /// others).
    pub fn send_json(&self, message: &ServerMessage) -> Result<()> {
        let text = message
            .to_json()
            .map_err(|e| ProtocolError::ParseError(e.to_string()))?;
        self.try_send(Message::text(text))
    }

    /// Sends a pre-framed binary payload (produced by `protocol::binary`).
    pub fn send_binary(&self, frame: Vec<u8>) -> Result<()> {
        self.try_send(Message::binary(frame))
    }

    pub fn send_close(&self, reason: &str) -> Result<()> {
        self.try_send(Message::close_with(1001u16, reason.to_string()))
    }

    fn try_send(&self, message: Message) -> Result<()> {
        match self.out_tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "client {} ({}) outbound queue full; dropping frame",
                    self.name, self.id
                );
                Err(ProtocolError::TransportClosed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ProtocolError::TransportClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (ClientSession, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        (ClientSession::new("test-client", tx), rx)
    }

    #[test]
    fn new_session_starts_handshaking_then_opens() {
        let (mut s, _rx) = session();
        assert_eq!(s.state, SessionState::Handshaking);
        s.open();
        assert_eq!(s.state, SessionState::Open);
    }

    #[tokio::test]
    async fn send_json_delivers_to_queue() {
        let (s, mut rx) = session();
        s.send_json(&ServerMessage::Status {
            level: crate::protocol::json::StatusLevel::Info,
            message: "hi".into(),
            id: None,
        })
        .unwrap();
        let msg = rx.recv().await.unwrap();
        assert!(msg.is_text());
    }

    #[test]
    fn full_queue_is_reported_not_blocked() {
        let (tx, _rx) = mpsc::channel(1);
        let s = ClientSession::new("slow-client", tx);
        s.send_binary(vec![1]).unwrap();
        let err = s.send_binary(vec![2]).unwrap_err();
        assert!(matches!(err, ProtocolError::TransportClosed));
    }
}
