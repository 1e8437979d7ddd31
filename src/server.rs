//! Server Session Manager (spec §4.3 outbound API, §4.2 registry
//! orchestration): aggregates [`ClientSession`]s, owns first-subscribe /
//! last-unsubscribe edge detection, broadcasts advertise/unadvertise, and
//! dispatches inbound frames to an application-supplied [`ServerHandler`].
//!
//! Mirrors the teacher's `FoxgloveWebSocket` shape (a handful of
//! `Arc<RwLock<_>>` fields behind a cheaply-`Clone`-able struct, served
//! over `warp`), generalized to the full v1 wire contract.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;
use warp::ws::WebSocket;
use warp::Filter;

use crate::capability::{Capability, CapabilitySet};
use crate::error::{ProtocolError, Result};
use crate::events::ServerHandler;
use crate::protocol::binary::{FetchAssetResponse, MessageData, ServerBinaryFrame, Time};
use crate::protocol::json::{
    Channel, ClientMessage, ConnectionGraphUpdate, Frame, NewChannel, NewService, Parameter,
    Service, ServerMessage, StatusLevel,
};
use crate::protocol::SUBPROTOCOL;
use crate::registry::{ChannelRegistry, ServiceRegistry};
use crate::session::{ClientSession, SessionId};

/// Outbound queue depth for a single client. Matches the teacher's
/// hard-coded `mpsc::channel(10)`, generalized to a configurable value.
const DEFAULT_SEND_QUEUE_DEPTH: usize = 32;

struct ServerState<H> {
    name: String,
    capabilities: CapabilitySet,
    supported_encodings: Vec<String>,
    metadata: HashMap<String, String>,
    session_id: String,
    channels: RwLock<ChannelRegistry>,
    services: RwLock<ServiceRegistry>,
    sessions: RwLock<HashMap<SessionId, ClientSession>>,
    /// Cross-session aggregate used purely for first-subscribe /
    /// last-unsubscribe edge detection (spec §4.3 invariant 2). Each
    /// session's own `subscriptions` table is the source of truth for
    /// "is session S subscribed to channel C"; this is the union.
    channel_subscribers: RwLock<HashMap<u32, HashSet<SessionId>>>,
    handler: Arc<H>,
}

/// The server-side half of the protocol: aggregates connected clients,
/// owns the channel/service registries, and exposes the broadcast API of
/// spec §4.3.
pub struct FoxgloveServer<H: ServerHandler> {
    state: Arc<ServerState<H>>,
}

impl<H: ServerHandler> Clone for FoxgloveServer<H> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

/// Configuration surface for a new server (spec §6).
pub struct ServerOptions {
    pub name: String,
    pub capabilities: CapabilitySet,
    pub supported_encodings: Vec<String>,
    pub metadata: HashMap<String, String>,
    /// Stable within one process lifetime; distinct after restart.
    /// Defaults to a fresh random value if not overridden.
    pub session_id: Option<String>,
}

impl ServerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: CapabilitySet::default(),
            supported_encodings: Vec::new(),
            metadata: HashMap::new(),
            session_id: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = CapabilitySet::new(capabilities);
        self
    }

    pub fn with_supported_encodings(mut self, encodings: impl IntoIterator<Item = String>) -> Self {
        self.supported_encodings = encodings.into_iter().collect();
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

impl<H: ServerHandler> FoxgloveServer<H> {
    pub fn new(options: ServerOptions, handler: H) -> Self {
        let session_id = options
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().as_hyphenated().to_string());
        Self {
            state: Arc::new(ServerState {
                name: options.name,
                capabilities: options.capabilities,
                supported_encodings: options.supported_encodings,
                metadata: options.metadata,
                session_id,
                channels: RwLock::new(ChannelRegistry::new()),
                services: RwLock::new(ServiceRegistry::new()),
                sessions: RwLock::new(HashMap::new()),
                channel_subscribers: RwLock::new(HashMap::new()),
                handler: Arc::new(handler),
            }),
        }
    }

    fn require_capability(&self, capability: Capability) -> Result<()> {
        if self.state.capabilities.contains(capability) {
            Ok(())
        } else {
            Err(ProtocolError::CapabilityMissing(capability.as_str()))
        }
    }

    // -- registry / broadcast API (spec §4.2, §4.3) -------------------

    pub async fn add_channel(&self, new_channel: NewChannel) -> Channel {
        let channel = {
            let mut channels = self.state.channels.write().await;
            channels.add_channel(new_channel)
        };
        debug!("advertising new channel {} ({})", channel.id, channel.topic);
        self.broadcast_json(&ServerMessage::Advertise {
            channels: vec![channel.clone()],
        })
        .await;
        channel
    }

    pub async fn remove_channel(&self, channel_id: u32) -> Result<()> {
        self.state.channels.write().await.remove_channel(channel_id)?;

        let mut sessions = self.state.sessions.write().await;
        for session in sessions.values_mut() {
            session.subscriptions.remove_all_for_channel(channel_id);
        }
        drop(sessions);

        let had_subscribers = {
            let mut aggregate = self.state.channel_subscribers.write().await;
            aggregate
                .remove(&channel_id)
                .map(|set| !set.is_empty())
                .unwrap_or(false)
        };
        if had_subscribers {
            self.state.handler.on_unsubscribe(channel_id);
        }

        self.broadcast_json(&ServerMessage::Unadvertise {
            channel_ids: vec![channel_id],
        })
        .await;
        Ok(())
    }

    pub async fn add_service(&self, new_service: NewService) -> Result<Service> {
        self.require_capability(Capability::Services)?;
        let service = self.state.services.write().await.add_service(new_service);
        self.broadcast_json(&ServerMessage::AdvertiseServices {
            services: vec![service.clone()],
        })
        .await;
        Ok(service)
    }

    pub async fn remove_service(&self, service_id: u32) -> Result<()> {
        self.require_capability(Capability::Services)?;
        self.state.services.write().await.remove_service(service_id)?;
        self.broadcast_json(&ServerMessage::UnadvertiseServices {
            service_ids: vec![service_id],
        })
        .await;
        Ok(())
    }

    pub async fn broadcast_time(&self, timestamp_ns: u64) -> Result<()> {
        self.require_capability(Capability::Time)?;
        let frame = Time { timestamp_ns }.encode();
        for session in self.state.sessions.read().await.values() {
            let _ = session.send_binary(frame.clone());
        }
        Ok(())
    }

    /// Frames `MessageData` once and patches only the subscription-id
    /// slot per recipient (spec §5/§9 broadcast byte layout), so one slow
    /// client's full queue can't stall the others.
    pub async fn broadcast_message(
        &self,
        channel_id: u32,
        timestamp_ns: u64,
        payload: &[u8],
    ) -> Result<()> {
        if !self.state.channels.read().await.contains(channel_id) {
            return Err(ProtocolError::UnknownChannel(channel_id));
        }
        let (template, offset) = MessageData::encode_template(timestamp_ns, payload);
        for session in self.state.sessions.read().await.values() {
            for subscription_id in session.subscriptions.subscribers_of(channel_id) {
                let mut buf = template.clone();
                MessageData::patch_subscription_id(&mut buf, offset, subscription_id);
                let _ = session.send_binary(buf);
            }
        }
        Ok(())
    }

    pub async fn publish_parameter_values(
        &self,
        parameters: Vec<Parameter>,
        id: Option<String>,
        target: Option<SessionId>,
    ) {
        let names: HashSet<&str> = parameters.iter().map(|p| p.name.as_str()).collect();
        let sessions = self.state.sessions.read().await;
        match target {
            Some(session_id) => {
                if let Some(session) = sessions.get(&session_id) {
                    let _ = session.send_json(&ServerMessage::ParameterValues {
                        parameters: parameters.clone(),
                        id: id.clone(),
                    });
                }
            }
            None => {
                for session in sessions.values() {
                    let subscribed = session
                        .parameter_subscriptions
                        .iter()
                        .any(|s| names.contains(s.as_str()));
                    if subscribed {
                        let _ = session.send_json(&ServerMessage::ParameterValues {
                            parameters: parameters.clone(),
                            id: id.clone(),
                        });
                    }
                }
            }
        }
    }

    /// Shorthand for "push only names each session has subscribed to".
    pub async fn update_parameter_values(&self, parameters: Vec<Parameter>) {
        self.publish_parameter_values(parameters, None, None).await;
    }

    pub async fn send_service_call_response(
        &self,
        session_id: SessionId,
        service_id: u32,
        call_id: u32,
        encoding: String,
        payload: Vec<u8>,
    ) -> Result<()> {
        let sessions = self.state.sessions.read().await;
        let session = sessions
            .get(&session_id)
            .ok_or(ProtocolError::TransportClosed)?;
        let frame = crate::protocol::binary::ServiceCallResponse {
            service_id,
            call_id,
            encoding,
            payload,
        }
        .encode();
        session.send_binary(frame)
    }

    pub async fn send_service_call_failure(
        &self,
        session_id: SessionId,
        service_id: u32,
        call_id: u32,
        message: String,
    ) -> Result<()> {
        let sessions = self.state.sessions.read().await;
        let session = sessions
            .get(&session_id)
            .ok_or(ProtocolError::TransportClosed)?;
        session.send_json(&ServerMessage::ServiceCallFailure {
            service_id,
            call_id,
            message,
        })
    }

    pub async fn send_fetch_asset_response(
        &self,
        session_id: SessionId,
        response: FetchAssetResponse,
    ) -> Result<()> {
        let sessions = self.state.sessions.read().await;
        let session = sessions
            .get(&session_id)
            .ok_or(ProtocolError::TransportClosed)?;
        session.send_binary(response.encode())
    }

    pub async fn publish_connection_graph_update(
        &self,
        update: ConnectionGraphUpdate,
    ) -> Result<()> {
        self.require_capability(Capability::ConnectionGraph)?;
        let message = ServerMessage::ConnectionGraphUpdate(update);
        for session in self.state.sessions.read().await.values() {
            if session.connection_graph_subscribed {
                let _ = session.send_json(&message);
            }
        }
        Ok(())
    }

    pub async fn publish_status(&self, level: StatusLevel, message: String, id: Option<String>) {
        self.broadcast_json(&ServerMessage::Status { level, message, id })
            .await;
    }

    pub async fn remove_status(&self, status_ids: Vec<String>) {
        self.broadcast_json(&ServerMessage::RemoveStatus { status_ids })
            .await;
    }

    async fn broadcast_json(&self, message: &ServerMessage) {
        for session in self.state.sessions.read().await.values() {
            let _ = session.send_json(message);
        }
    }

    // -- transport integration -----------------------------------------

    /// Serves connecting clients on `addr` via `warp`, rejecting any
    /// handshake that doesn't select `foxglove.websocket.v1`.
    pub async fn serve(&self, addr: impl Into<SocketAddr>) {
        let server = self.clone();
        let route = warp::path::end()
            .and(warp::ws())
            .and(warp::header::optional::<String>("Sec-WebSocket-Protocol"))
            .map(move |ws: warp::ws::Ws, requested_subprotocol: Option<String>| {
                let server = server.clone();
                if requested_subprotocol.as_deref() != Some(SUBPROTOCOL) {
                    // Reject: close immediately after upgrade without ever
                    // opening a session (spec §4.3: "accept only
                    // foxglove.websocket.v1; otherwise reject the
                    // handshake").
                    return ws
                        .on_upgrade(|socket| async move {
                            let _ = socket.close().await;
                        })
                        .into_response();
                }
                warp::reply::with_header(
                    ws.on_upgrade(move |socket| server.client_connected(socket)),
                    "Sec-WebSocket-Protocol",
                    SUBPROTOCOL,
                )
                .into_response()
            });
        warp::serve(route).run(addr).await;
    }

    async fn client_connected(&self, ws: WebSocket) {
        let (mut out_sink, mut out_stream) = ws.split();
        let (tx, rx) = mpsc::channel(DEFAULT_SEND_QUEUE_DEPTH);
        let mut rx = ReceiverStream::new(rx);

        tokio::task::spawn(async move {
            while let Some(message) = rx.next().await {
                if let Err(e) = out_sink.send(message).await {
                    error!("websocket send failed: {e}");
                    break;
                }
            }
        });

        let mut session = ClientSession::new(format!("client-{}", Uuid::new_v4()), tx);
        let id = session.id;
        info!("client {} ({}) connected", session.name, id);

        if let Err(e) = self.send_initial_snapshot(&session).await {
            error!("failed to initialize client {id}: {e}");
            return;
        }
        session.open();
        let handle = session.handle();
        self.state.sessions.write().await.insert(id, session);
        self.state.handler.on_client_connected(handle);

        while let Some(result) = out_stream.next().await {
            let message = match result {
                Ok(m) => m,
                Err(e) => {
                    warn!("websocket recv error for {id}: {e}");
                    break;
                }
            };
            if message.is_close() {
                break;
            }
            if message.is_text() {
                self.handle_client_text(id, message.to_str().unwrap_or("")).await;
            } else if message.is_binary() {
                self.handle_client_binary(id, message.as_bytes()).await;
            }
        }

        self.disconnect(id).await;
    }

    async fn send_initial_snapshot(&self, session: &ClientSession) -> Result<()> {
        session.send_json(&ServerMessage::ServerInfo {
            name: self.state.name.clone(),
            capabilities: self.state.capabilities.as_wire_tokens(),
            supported_encodings: self.state.supported_encodings.clone(),
            metadata: self.state.metadata.clone(),
            session_id: self.state.session_id.clone(),
            extra: serde_json::Map::new(),
        })?;

        let channels = self.state.channels.read().await;
        if !channels.is_empty() {
            session.send_json(&ServerMessage::Advertise {
                channels: channels.iter().cloned().collect(),
            })?;
        }
        drop(channels);

        if self.state.capabilities.contains(Capability::Services) {
            let services = self.state.services.read().await;
            if !services.is_empty() {
                session.send_json(&ServerMessage::AdvertiseServices {
                    services: services.iter().cloned().collect(),
                })?;
            }
        }
        Ok(())
    }

    async fn disconnect(&self, id: SessionId) {
        let removed = self.state.sessions.write().await.remove(&id);
        let Some(mut session) = removed else {
            return;
        };
        session.begin_closing();
        let channel_ids: Vec<u32> = session.subscriptions.iter().map(|(_, c)| c).collect();
        let mut aggregate = self.state.channel_subscribers.write().await;
        let mut newly_unsubscribed = Vec::new();
        for channel_id in channel_ids {
            if let Some(set) = aggregate.get_mut(&channel_id) {
                set.remove(&id);
                if set.is_empty() {
                    aggregate.remove(&channel_id);
                    newly_unsubscribed.push(channel_id);
                }
            }
        }
        drop(aggregate);
        for channel_id in newly_unsubscribed {
            self.state.handler.on_unsubscribe(channel_id);
        }
        session.close();
        info!("client {} ({}) disconnected", session.name, id);
        self.state.handler.on_client_disconnected(session.handle());
    }

    // -- inbound dispatch (spec §4.3) -----------------------------------

    async fn handle_client_text(&self, session_id: SessionId, text: &str) {
        let frame = match ClientMessage::from_json(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("malformed JSON from {session_id}: {e}");
                return;
            }
        };
        let message = match frame {
            Frame::Known(message) => message,
            Frame::UnknownOp { op, .. } => {
                debug!("unknown op {op:?} from {session_id}, ignoring");
                return;
            }
        };
        self.dispatch_client_message(session_id, message).await;
    }

    async fn dispatch_client_message(&self, session_id: SessionId, message: ClientMessage) {
        match message {
            ClientMessage::Subscribe { subscriptions } => {
                for entry in subscriptions {
                    self.handle_subscribe(session_id, entry.id, entry.channel_id)
                        .await;
                }
            }
            ClientMessage::Unsubscribe { subscription_ids } => {
                for subscription_id in subscription_ids {
                    self.handle_unsubscribe(session_id, subscription_id).await;
                }
            }
            ClientMessage::Advertise { channels } => {
                if self.require_capability(Capability::ClientPublish).is_err() {
                    self.reply_status(
                        session_id,
                        StatusLevel::Error,
                        "clientPublish capability not declared".into(),
                    )
                    .await;
                    return;
                }
                for channel in channels {
                    self.handle_client_advertise(session_id, channel).await;
                }
            }
            ClientMessage::Unadvertise { channel_ids } => {
                for channel_id in channel_ids {
                    self.handle_client_unadvertise(session_id, channel_id).await;
                }
            }
            ClientMessage::GetParameters { parameter_names, id } => {
                self.handle_get_parameters(session_id, parameter_names, id)
                    .await;
            }
            ClientMessage::SetParameters { parameters, id } => {
                self.handle_set_parameters(session_id, parameters, id).await;
            }
            ClientMessage::SubscribeParameterUpdates { parameter_names } => {
                self.toggle_parameter_subscription(session_id, parameter_names, true)
                    .await;
            }
            ClientMessage::UnsubscribeParameterUpdates { parameter_names } => {
                self.toggle_parameter_subscription(session_id, parameter_names, false)
                    .await;
            }
            ClientMessage::SubscribeConnectionGraph => {
                self.toggle_connection_graph(session_id, true).await;
            }
            ClientMessage::UnsubscribeConnectionGraph => {
                self.toggle_connection_graph(session_id, false).await;
            }
            ClientMessage::FetchAsset { uri, request_id } => {
                self.handle_fetch_asset(session_id, uri, request_id).await;
            }
        }
    }

    async fn reply_status(&self, session_id: SessionId, level: StatusLevel, message: String) {
        if let Some(session) = self.state.sessions.read().await.get(&session_id) {
            let _ = session.send_json(&ServerMessage::Status {
                level,
                message,
                id: None,
            });
        }
    }

    async fn handle_subscribe(&self, session_id: SessionId, subscription_id: u32, channel_id: u32) {
        if !self.state.channels.read().await.contains(channel_id) {
            self.reply_status(
                session_id,
                StatusLevel::Warning,
                format!("subscribe to unknown channel id {channel_id}; ignoring"),
            )
            .await;
            return;
        }

        let mut sessions = self.state.sessions.write().await;
        let Some(session) = sessions.get_mut(&session_id) else {
            return;
        };
        if session.subscriptions.contains_id(subscription_id) {
            drop(sessions);
            self.reply_status(
                session_id,
                StatusLevel::Error,
                format!("subscription id {subscription_id} was already used; ignoring"),
            )
            .await;
            return;
        }
        if session.subscriptions.subscribers_of(channel_id).next().is_some() {
            drop(sessions);
            self.reply_status(
                session_id,
                StatusLevel::Error,
                format!("already subscribed to channel id {channel_id}; ignoring"),
            )
            .await;
            return;
        }
        session.subscriptions.insert(subscription_id, channel_id);
        drop(sessions);

        let first_subscriber = {
            let mut aggregate = self.state.channel_subscribers.write().await;
            let set = aggregate.entry(channel_id).or_default();
            let was_empty = set.is_empty();
            set.insert(session_id);
            was_empty
        };
        if first_subscriber {
            self.state.handler.on_subscribe(channel_id);
        }
    }

    async fn handle_unsubscribe(&self, session_id: SessionId, subscription_id: u32) {
        let mut sessions = self.state.sessions.write().await;
        let Some(session) = sessions.get_mut(&session_id) else {
            return;
        };
        let Some(channel_id) = session.subscriptions.remove(subscription_id) else {
            drop(sessions);
            self.reply_status(
                session_id,
                StatusLevel::Warning,
                format!("unsubscribe of unknown subscription id {subscription_id}; ignoring"),
            )
            .await;
            return;
        };
        drop(sessions);

        let last_unsubscribe = {
            let mut aggregate = self.state.channel_subscribers.write().await;
            if let Some(set) = aggregate.get_mut(&channel_id) {
                set.remove(&session_id);
                if set.is_empty() {
                    aggregate.remove(&channel_id);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if last_unsubscribe {
            self.state.handler.on_unsubscribe(channel_id);
        }
    }

    async fn handle_client_advertise(
        &self,
        session_id: SessionId,
        channel: crate::protocol::json::ClientChannel,
    ) {
        let mut sessions = self.state.sessions.write().await;
        let Some(session) = sessions.get_mut(&session_id) else {
            return;
        };
        if session.advertisements.contains_key(&channel.id) {
            drop(sessions);
            self.reply_status(
                session_id,
                StatusLevel::Error,
                format!("client channel id {} already advertised; ignoring", channel.id),
            )
            .await;
            return;
        }
        session.advertisements.insert(channel.id, channel.clone());
        let handle = session.handle();
        drop(sessions);
        self.state.handler.on_client_advertise(handle, channel);
    }

    async fn handle_client_unadvertise(&self, session_id: SessionId, channel_id: u32) {
        let mut sessions = self.state.sessions.write().await;
        let Some(session) = sessions.get_mut(&session_id) else {
            return;
        };
        if session.advertisements.remove(&channel_id).is_none() {
            debug!("unadvertise of unknown client channel {channel_id} from {session_id}, dropping");
            return;
        }
        let handle = session.handle();
        drop(sessions);
        self.state.handler.on_client_unadvertise(handle, channel_id);
    }

    async fn handle_get_parameters(
        &self,
        session_id: SessionId,
        names: Vec<String>,
        id: Option<String>,
    ) {
        if self.require_capability(Capability::Parameters).is_err() {
            self.reply_status(
                session_id,
                StatusLevel::Error,
                "parameters capability not declared".into(),
            )
            .await;
            return;
        }
        let handle = {
            let sessions = self.state.sessions.read().await;
            match sessions.get(&session_id) {
                Some(s) => s.handle(),
                None => return,
            }
        };
        let values = self.state.handler.on_get_parameters(handle, names, id.clone());
        if let Some(session) = self.state.sessions.read().await.get(&session_id) {
            let _ = session.send_json(&ServerMessage::ParameterValues {
                parameters: values,
                id,
            });
        }
    }

    async fn handle_set_parameters(
        &self,
        session_id: SessionId,
        parameters: Vec<Parameter>,
        id: Option<String>,
    ) {
        if self.require_capability(Capability::Parameters).is_err() {
            self.reply_status(
                session_id,
                StatusLevel::Error,
                "parameters capability not declared".into(),
            )
            .await;
            return;
        }
        let handle = {
            let sessions = self.state.sessions.read().await;
            match sessions.get(&session_id) {
                Some(s) => s.handle(),
                None => return,
            }
        };
        let result = self
            .state
            .handler
            .on_set_parameters(handle, parameters, id.clone());
        // Push to every session subscribed to these names (cross-client
        // consistency), then separately ack the caller directly if it
        // supplied a correlator (spec §9(iii) open question).
        self.update_parameter_values(result.clone()).await;
        if let Some(id) = id {
            if let Some(session) = self.state.sessions.read().await.get(&session_id) {
                let _ = session.send_json(&ServerMessage::ParameterValues {
                    parameters: result,
                    id: Some(id),
                });
            }
        }
    }

    async fn toggle_parameter_subscription(
        &self,
        session_id: SessionId,
        names: Vec<String>,
        subscribe: bool,
    ) {
        if self
            .require_capability(Capability::ParametersSubscribe)
            .is_err()
        {
            self.reply_status(
                session_id,
                StatusLevel::Error,
                "parametersSubscribe capability not declared".into(),
            )
            .await;
            return;
        }
        let mut sessions = self.state.sessions.write().await;
        if let Some(session) = sessions.get_mut(&session_id) {
            if subscribe {
                session.parameter_subscriptions.extend(names);
            } else {
                for name in names {
                    session.parameter_subscriptions.remove(&name);
                }
            }
        }
    }

    async fn toggle_connection_graph(&self, session_id: SessionId, subscribed: bool) {
        if self.require_capability(Capability::ConnectionGraph).is_err() {
            self.reply_status(
                session_id,
                StatusLevel::Error,
                "connectionGraph capability not declared".into(),
            )
            .await;
            return;
        }
        if let Some(session) = self.state.sessions.write().await.get_mut(&session_id) {
            session.connection_graph_subscribed = subscribed;
        }
    }

    async fn handle_fetch_asset(&self, session_id: SessionId, uri: String, request_id: u32) {
        if self.require_capability(Capability::Assets).is_err() {
            self.reply_status(
                session_id,
                StatusLevel::Error,
                "assets capability not declared".into(),
            )
            .await;
            return;
        }
        let handle = {
            let sessions = self.state.sessions.read().await;
            match sessions.get(&session_id) {
                Some(s) => s.handle(),
                None => return,
            }
        };
        let response = match self.state.handler.on_fetch_asset(handle, uri, request_id) {
            Ok(data) => FetchAssetResponse::success(request_id, data),
            Err(e) => FetchAssetResponse::error(request_id, e.to_string()),
        };
        if let Some(session) = self.state.sessions.read().await.get(&session_id) {
            let _ = session.send_binary(response.encode());
        }
    }

    async fn handle_client_binary(&self, session_id: SessionId, data: &[u8]) {
        use crate::protocol::binary::ClientBinaryFrame;
        let frame = match ClientBinaryFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("malformed binary frame from {session_id}: {e}");
                return;
            }
        };
        match frame {
            ClientBinaryFrame::ClientMessageData(msg) => {
                if self.require_capability(Capability::ClientPublish).is_err() {
                    warn!("{session_id} sent ClientMessageData without clientPublish capability");
                    return;
                }
                let (handle, channel) = {
                    let sessions = self.state.sessions.read().await;
                    let Some(session) = sessions.get(&session_id) else {
                        return;
                    };
                    let handle = session.handle();
                    let Some(channel) = session.advertisements.get(&msg.channel_id).cloned() else {
                        warn!(
                            "{session_id} published on unknown client channel {}",
                            msg.channel_id
                        );
                        self.state
                            .handler
                            .on_error(handle, ProtocolError::UnknownClientChannel(msg.channel_id));
                        return;
                    };
                    (handle, channel)
                };
                self.state.handler.on_message(handle, channel, msg.payload);
            }
            ClientBinaryFrame::ServiceCallRequest(req) => {
                if self.require_capability(Capability::Services).is_err() {
                    warn!("{session_id} sent ServiceCallRequest without services capability");
                    return;
                }
                if !self.state.services.read().await.contains(req.service_id) {
                    let _ = self
                        .send_service_call_failure(
                            session_id,
                            req.service_id,
                            req.call_id,
                            "unknown service id".into(),
                        )
                        .await;
                    return;
                }
                let handle = {
                    let sessions = self.state.sessions.read().await;
                    match sessions.get(&session_id) {
                        Some(s) => s.handle(),
                        None => return,
                    }
                };
                let result = self.state.handler.on_service_call(
                    handle,
                    req.service_id,
                    req.call_id,
                    req.encoding,
                    req.payload,
                );
                match result {
                    Ok((encoding, payload)) => {
                        let _ = self
                            .send_service_call_response(
                                session_id,
                                req.service_id,
                                req.call_id,
                                encoding,
                                payload,
                            )
                            .await;
                    }
                    Err(e) => {
                        let _ = self
                            .send_service_call_failure(
                                session_id,
                                req.service_id,
                                req.call_id,
                                e.to_string(),
                            )
                            .await;
                    }
                }
            }
        }
    }
}

// Parsing a server binary frame is also exposed for tests/tools that want
// to sanity-check what `broadcast_message`/`broadcast_time` produced.
#[allow(dead_code)]
fn parse_server_binary(data: &[u8]) -> Result<ServerBinaryFrame> {
    ServerBinaryFrame::decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::protocol::json::NewChannel;
    use crate::session::SessionHandle;

    #[derive(Default)]
    struct RecordingHandler {
        subscribed: StdMutex<Vec<u32>>,
        unsubscribed: StdMutex<Vec<u32>>,
        errors: StdMutex<Vec<String>>,
    }

    impl ServerHandler for RecordingHandler {
        fn on_subscribe(&self, channel_id: u32) {
            self.subscribed.lock().unwrap().push(channel_id);
        }

        fn on_unsubscribe(&self, channel_id: u32) {
            self.unsubscribed.lock().unwrap().push(channel_id);
        }

        fn on_error(&self, _session: SessionHandle, error: ProtocolError) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    fn sample_channel() -> NewChannel {
        NewChannel {
            topic: "foo".into(),
            encoding: "bar".into(),
            schema_name: "Foo".into(),
            schema: "some data".into(),
            schema_encoding: None,
        }
    }

    async fn attach_session(server: &FoxgloveServer<RecordingHandler>) -> (SessionId, mpsc::Receiver<warp::ws::Message>) {
        let (tx, rx) = mpsc::channel(16);
        let session = ClientSession::new("test-client", tx);
        let id = session.id;
        server.send_initial_snapshot(&session).await.unwrap();
        let mut session = session;
        session.open();
        server.state.sessions.write().await.insert(id, session);
        (id, rx)
    }

    // S1: fresh server, no channels — client sees only serverInfo.
    #[tokio::test]
    async fn s1_empty_server_sends_only_server_info() {
        let server = FoxgloveServer::new(ServerOptions::new("foo"), RecordingHandler::default());
        let (_id, mut rx) = attach_session(&server).await;

        let first = rx.recv().await.unwrap();
        assert!(first.to_str().unwrap().starts_with(r#"{"op":"serverInfo""#));
        assert!(first.to_str().unwrap().contains(r#""name":"foo""#));
        assert!(first.to_str().unwrap().contains(r#""capabilities":[]"#));

        // no further frames queued
        assert!(rx.try_recv().is_err());
    }

    // S2: channel exists before connect, subscribe fires the edge, then a
    // broadcast reaches the subscriber as the exact documented byte layout.
    #[tokio::test]
    async fn s2_advertise_subscribe_and_broadcast() {
        let server = FoxgloveServer::new(ServerOptions::new("foo"), RecordingHandler::default());
        let channel = server.add_channel(sample_channel()).await;
        assert_eq!(channel.id, 1);

        let (id, mut rx) = attach_session(&server).await;
        let _server_info = rx.recv().await.unwrap();
        let advertise = rx.recv().await.unwrap();
        assert!(advertise.to_str().unwrap().starts_with(r#"{"op":"advertise""#));

        server.handle_subscribe(id, 1, 1).await;
        assert_eq!(
            server.state.handler.subscribed.lock().unwrap().as_slice(),
            &[1]
        );

        server.broadcast_message(1, 42, &[1, 2, 3]).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(
            frame.as_bytes(),
            &[0x01, 1, 0, 0, 0, 42, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3]
        );
    }

    // S3: a duplicate subscription id is rejected with a status error and
    // does not re-fire the subscribe edge.
    #[tokio::test]
    async fn s3_duplicate_subscription_id_is_rejected() {
        let server = FoxgloveServer::new(ServerOptions::new("foo"), RecordingHandler::default());
        server.add_channel(sample_channel()).await;
        let (id, mut rx) = attach_session(&server).await;
        let _ = rx.recv().await.unwrap(); // serverInfo
        let _ = rx.recv().await.unwrap(); // advertise

        server.handle_subscribe(id, 1, 1).await;
        server.handle_subscribe(id, 1, 1).await;

        let status = rx.recv().await.unwrap();
        let text = status.to_str().unwrap();
        assert!(text.starts_with(r#"{"op":"status""#));
        assert!(text.contains(r#""level":2"#));
        assert_eq!(
            server.state.handler.subscribed.lock().unwrap().as_slice(),
            &[1]
        );
    }

    #[tokio::test]
    async fn duplicate_channel_subscription_under_a_new_id_is_rejected() {
        let server = FoxgloveServer::new(ServerOptions::new("foo"), RecordingHandler::default());
        server.add_channel(sample_channel()).await;
        let (id, mut rx) = attach_session(&server).await;
        let _ = rx.recv().await.unwrap(); // serverInfo
        let _ = rx.recv().await.unwrap(); // advertise

        server.handle_subscribe(id, 1, 1).await;
        server.handle_subscribe(id, 2, 1).await;

        let status = rx.recv().await.unwrap();
        let text = status.to_str().unwrap();
        assert!(text.starts_with(r#"{"op":"status""#));
        assert!(text.contains(r#""level":2"#));
        assert!(text.contains("already subscribed"));
        assert_eq!(
            server.state.handler.subscribed.lock().unwrap().as_slice(),
            &[1]
        );

        // only the first subscription id is live; a broadcast reaches the
        // client exactly once.
        server.broadcast_message(1, 42, &[1, 2, 3]).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(
            frame.into_data(),
            vec![0x01, 1, 0, 0, 0, 42, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3]
        );
        assert!(rx.try_recv().is_err());
    }

    // S4: two clients subscribing/unsubscribing to the same channel only
    // fire the edge event on the first subscribe and the last unsubscribe.
    #[tokio::test]
    async fn s4_edge_detection_across_multiple_clients() {
        let server = FoxgloveServer::new(ServerOptions::new("foo"), RecordingHandler::default());
        server.add_channel(sample_channel()).await;
        let (a, mut rx_a) = attach_session(&server).await;
        let (b, mut rx_b) = attach_session(&server).await;
        let _ = rx_a.recv().await.unwrap();
        let _ = rx_a.recv().await.unwrap();
        let _ = rx_b.recv().await.unwrap();
        let _ = rx_b.recv().await.unwrap();

        server.handle_subscribe(a, 1, 1).await;
        server.handle_subscribe(b, 1, 1).await;
        assert_eq!(
            server.state.handler.subscribed.lock().unwrap().as_slice(),
            &[1]
        );

        server.handle_unsubscribe(a, 1).await;
        assert!(server.state.handler.unsubscribed.lock().unwrap().is_empty());
        server.handle_unsubscribe(b, 1).await;
        assert_eq!(
            server.state.handler.unsubscribed.lock().unwrap().as_slice(),
            &[1]
        );
    }

    // S5: a time broadcast reaches every connected client as the documented
    // byte layout.
    #[tokio::test]
    async fn s5_broadcast_time_reaches_all_clients() {
        let options = ServerOptions::new("foo").with_capabilities([Capability::Time]);
        let server = FoxgloveServer::new(options, RecordingHandler::default());
        let (_id, mut rx) = attach_session(&server).await;
        let _ = rx.recv().await.unwrap(); // serverInfo

        server.broadcast_time(42).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.as_bytes(), &[0x02, 42, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn broadcast_time_without_capability_is_rejected() {
        let server = FoxgloveServer::new(ServerOptions::new("foo"), RecordingHandler::default());
        let err = server.broadcast_time(1).await.unwrap_err();
        assert!(matches!(err, ProtocolError::CapabilityMissing("time")));
    }

    #[tokio::test]
    async fn removing_a_channel_drops_its_subscriptions_and_fires_unsubscribe() {
        let server = FoxgloveServer::new(ServerOptions::new("foo"), RecordingHandler::default());
        let channel = server.add_channel(sample_channel()).await;
        let (id, mut rx) = attach_session(&server).await;
        let _ = rx.recv().await.unwrap();
        let _ = rx.recv().await.unwrap();
        server.handle_subscribe(id, 1, channel.id).await;

        server.remove_channel(channel.id).await.unwrap();
        assert_eq!(
            server.state.handler.unsubscribed.lock().unwrap().as_slice(),
            &[channel.id]
        );
        let unadvertise = rx.recv().await.unwrap();
        assert!(unadvertise.to_str().unwrap().starts_with(r#"{"op":"unadvertise""#));
    }

    #[tokio::test]
    async fn publishing_on_unknown_client_channel_fires_on_error() {
        let options = ServerOptions::new("foo").with_capabilities([Capability::ClientPublish]);
        let server = FoxgloveServer::new(options, RecordingHandler::default());
        let (id, mut rx) = attach_session(&server).await;
        let _ = rx.recv().await.unwrap(); // serverInfo

        let frame = crate::protocol::binary::ClientMessageData {
            channel_id: 999,
            payload: vec![1, 2, 3],
        }
        .encode();
        server.handle_client_binary(id, &frame).await;

        let errors = server.state.handler.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("999"), "{}", errors[0]);
    }
}
