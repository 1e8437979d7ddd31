//! The closed error taxonomy for the protocol engine.
//!
//! Wire-level and registry errors are represented here as a typed enum so
//! callers can match on `kind` instead of parsing strings. Application
//! handlers (service calls, asset fetches, parameter get/set) still return
//! `anyhow::Result`, which the session layer wraps into
//! [`ProtocolError::ApplicationError`] before turning it into a wire
//! response.

use thiserror::Error;

/// Errors produced by the wire codec, the registries, and the session
/// managers.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The underlying transport is gone; sends on it will never complete.
    #[error("transport closed")]
    TransportClosed,

    /// The WebSocket handshake selected a subprotocol other than
    /// `foxglove.websocket.v1`. Fatal for the connection.
    #[error("subprotocol mismatch: expected foxglove.websocket.v1, got {0:?}")]
    SubprotocolMismatch(Option<String>),

    /// An inbound frame was malformed JSON, the wrong shape, or too short
    /// to hold its fixed binary header.
    #[error("parse error: {0}")]
    ParseError(String),

    /// A binary frame carried an opcode outside the closed set.
    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    /// A peer used a feature whose gating capability was never declared.
    #[error("capability not declared: {0}")]
    CapabilityMissing(&'static str),

    /// A `MessageData`/`subscribe` referenced a channel id the registry
    /// does not know.
    #[error("unknown channel id: {0}")]
    UnknownChannel(u32),

    /// An `unsubscribe` referenced a subscription id the session does not
    /// hold.
    #[error("unknown subscription id: {0}")]
    UnknownSubscription(u32),

    /// A service call referenced a service id the registry does not know.
    #[error("unknown service id: {0}")]
    UnknownService(u32),

    /// `ClientMessageData` referenced a client channel id the session did
    /// not advertise.
    #[error("unknown client channel id: {0}")]
    UnknownClientChannel(u32),

    /// An id collided with one that is already active (subscription id or
    /// client-advertised channel id).
    #[error("duplicate id: {0}")]
    DuplicateId(u32),

    /// An unknown `FetchAssetResponse.status` byte (>= 2 is reserved).
    #[error("unknown fetch-asset status: {0}")]
    UnknownStatus(u8),

    /// Raised by an application-provided handler for a service call, an
    /// asset fetch, or a parameter get/set.
    #[error("application error: {0}")]
    ApplicationError(#[from] anyhow::Error),

    /// The registry was asked to remove an id it has never held.
    #[error("not found: {0}")]
    NotFound(u32),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
