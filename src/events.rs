//! Explicit callback registration in place of a dynamic, string-keyed
//! event emitter (spec §9 design note).
//!
//! Server-side application callbacks are a trait ([`ServerHandler`]) with
//! no-op/pass-through defaults, invoked synchronously from the
//! frame-dispatch context (spec §5) — implementations that need to block
//! must hand off to their own worker. Client-engine events, which have no
//! application-supplied logic to run, are instead a plain typed enum
//! delivered over a channel.

use crate::error::ProtocolError;
use crate::protocol::json::{ClientChannel, ConnectionGraphUpdate, Parameter, Service};
use crate::session::SessionHandle;

pub use crate::protocol::json::Channel;

/// Application callbacks for the server-side session manager. Every
/// method has a default so implementors only override what they use.
pub trait ServerHandler: Send + Sync + 'static {
    /// A channel went from zero to one subscriber across all clients.
    fn on_subscribe(&self, _channel_id: u32) {}

    /// A channel went from one to zero subscribers across all clients.
    fn on_unsubscribe(&self, _channel_id: u32) {}

    fn on_client_advertise(&self, _session: SessionHandle, _channel: ClientChannel) {}

    fn on_client_unadvertise(&self, _session: SessionHandle, _channel_id: u32) {}

    /// A client published on one of its own advertised channels.
    fn on_message(&self, _session: SessionHandle, _channel: ClientChannel, _payload: Vec<u8>) {}

    /// Returns the requested parameters (missing names are simply
    /// omitted from the result).
    fn on_get_parameters(
        &self,
        _session: SessionHandle,
        _names: Vec<String>,
        _id: Option<String>,
    ) -> Vec<Parameter> {
        Vec::new()
    }

    /// Applies the requested parameter updates and returns the resulting
    /// values to echo back to the caller (spec §9(iii): a `setParameters`
    /// without an `id` may go unanswered; returning an empty vec signals
    /// "no acknowledgement needed" to the caller in `server.rs`).
    fn on_set_parameters(
        &self,
        _session: SessionHandle,
        parameters: Vec<Parameter>,
        _id: Option<String>,
    ) -> Vec<Parameter> {
        parameters
    }

    /// Invokes a service call. `Err` becomes a wire `serviceCallFailure`.
    fn on_service_call(
        &self,
        _session: SessionHandle,
        _service_id: u32,
        _call_id: u32,
        _encoding: String,
        _payload: Vec<u8>,
    ) -> anyhow::Result<(String, Vec<u8>)> {
        Err(anyhow::anyhow!("no service handler registered"))
    }

    /// Fetches an asset by URI. `Err` becomes a `FetchAssetResponse` with
    /// `status: 1` and the error's message.
    fn on_fetch_asset(
        &self,
        _session: SessionHandle,
        _uri: String,
        _request_id: u32,
    ) -> anyhow::Result<Vec<u8>> {
        Err(anyhow::anyhow!("no asset handler registered"))
    }

    fn on_client_connected(&self, _session: SessionHandle) {}

    fn on_client_disconnected(&self, _session: SessionHandle) {}

    /// A protocol-level error in an inbound frame that isn't otherwise
    /// surfaced as a wire reply (e.g. a publish on a client channel id the
    /// session never advertised). Application failures from a service call
    /// or asset fetch are not routed here — those already come back
    /// through that call's own `Result`.
    fn on_error(&self, _session: SessionHandle, _error: ProtocolError) {}
}

/// A no-op handler for servers that don't need any callbacks (e.g. a pure
/// publisher with no services/parameters/assets).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHandler;

impl ServerHandler for NullHandler {}

/// Typed events emitted by the client engine (spec §4.4). Delivered over
/// an `mpsc` channel rather than a callback trait, since there is no
/// application-supplied *behavior* attached to them beyond "observe and
/// react".
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    Open,
    Close,
    Error(String),
    ServerInfo {
        name: String,
        capabilities: Vec<String>,
        supported_encodings: Vec<String>,
        metadata: std::collections::HashMap<String, String>,
        session_id: String,
    },
    Status {
        level: u8,
        message: String,
        id: Option<String>,
    },
    RemoveStatus {
        status_ids: Vec<String>,
    },
    Advertise {
        channels: Vec<Channel>,
    },
    Unadvertise {
        channel_ids: Vec<u32>,
    },
    Message {
        subscription_id: u32,
        timestamp_ns: u64,
        payload: Vec<u8>,
    },
    Time {
        timestamp_ns: u64,
    },
    AdvertiseServices {
        services: Vec<Service>,
    },
    UnadvertiseServices {
        service_ids: Vec<u32>,
    },
    ParameterValues {
        parameters: Vec<Parameter>,
        id: Option<String>,
    },
    ServiceCallResponse {
        service_id: u32,
        call_id: u32,
        encoding: String,
        payload: Vec<u8>,
    },
    ServiceCallFailure {
        service_id: u32,
        call_id: u32,
        message: String,
    },
    ConnectionGraphUpdate(ConnectionGraphUpdate),
    FetchAssetResponse {
        request_id: u32,
        result: Result<Vec<u8>, String>,
    },
}
