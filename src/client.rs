//! Client Engine (spec §4.4): connects to a `foxglove.websocket.v1` server
//! over `tokio-tungstenite`, validates the negotiated subprotocol, and
//! demultiplexes frames into a stream of [`ClientEvent`]s.
//!
//! Unlike the server side, there is no application-supplied behavior to
//! invoke per frame, so this is a thin state machine plus two pump tasks
//! (one for the outbound queue, one for the inbound demux) rather than a
//! handler trait — matching the teacher's `client_connected` task-pump
//! shape, turned inside out for the client role.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::capability::{Capability, CapabilitySet};
use crate::error::{ProtocolError, Result};
use crate::events::ClientEvent;
use crate::protocol::binary::{ClientMessageData, ServerBinaryFrame, ServiceCallRequest};
use crate::protocol::json::{ClientMessage, Frame, Parameter, ServerMessage};
use crate::protocol::SUBPROTOCOL;

const EVENT_QUEUE_DEPTH: usize = 256;
const OUTBOUND_QUEUE_DEPTH: usize = 64;

struct EngineState {
    out_tx: mpsc::Sender<WsMessage>,
    next_subscription_id: AtomicU32,
    next_client_channel_id: AtomicU32,
    next_call_id: AtomicU32,
    next_request_id: AtomicU32,
    capabilities: StdRwLock<CapabilitySet>,
    /// Call ids issued by `send_service_call_request` with no response yet.
    pending_calls: StdMutex<HashSet<u32>>,
    /// Request ids issued by `fetch_asset` with no response yet.
    pending_asset_requests: StdMutex<HashSet<u32>>,
}

/// A connected client session. Cheaply `Clone`-able; every clone shares
/// the same outbound queue and id counters.
pub struct ClientEngine {
    state: Arc<EngineState>,
}

impl Clone for ClientEngine {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl ClientEngine {
    /// Opens a connection to `url`, requiring the peer select
    /// `foxglove.websocket.v1`. Returns the engine handle plus the event
    /// stream; spawns the read/write pump tasks on the current runtime.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<ClientEvent>)> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ProtocolError::ParseError(e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SUBPROTOCOL),
        );

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| ProtocolError::ParseError(e.to_string()))?;

        let negotiated = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        if negotiated.as_deref() != Some(SUBPROTOCOL) {
            return Err(ProtocolError::SubprotocolMismatch(negotiated));
        }

        let (mut sink, mut stream) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(OUTBOUND_QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::channel::<ClientEvent>(EVENT_QUEUE_DEPTH);

        let state = Arc::new(EngineState {
            out_tx,
            next_subscription_id: AtomicU32::new(0),
            next_client_channel_id: AtomicU32::new(1),
            next_call_id: AtomicU32::new(0),
            next_request_id: AtomicU32::new(0),
            capabilities: StdRwLock::new(CapabilitySet::default()),
            pending_calls: StdMutex::new(HashSet::new()),
            pending_asset_requests: StdMutex::new(HashSet::new()),
        });

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    warn!("client websocket send failed: {e}");
                    break;
                }
            }
        });

        {
            let state = state.clone();
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                while let Some(result) = stream.next().await {
                    let message = match result {
                        Ok(m) => m,
                        Err(e) => {
                            let _ = events_tx.send(ClientEvent::Error(e.to_string())).await;
                            break;
                        }
                    };
                    if message.is_close() {
                        let _ = events_tx.send(ClientEvent::Close).await;
                        break;
                    }
                    if message.is_text() {
                        let Ok(text) = message.into_text() else {
                            continue;
                        };
                        handle_text(&state, &text, &events_tx).await;
                    } else if message.is_binary() {
                        handle_binary(&state, message.into_data(), &events_tx).await;
                    }
                }
            });
        }

        let _ = events_tx.send(ClientEvent::Open).await;

        Ok((Self { state }, events_rx))
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.state.capabilities.read().unwrap().clone()
    }

    fn require_capability(&self, capability: Capability) -> Result<()> {
        if self.state.capabilities.read().unwrap().contains(capability) {
            Ok(())
        } else {
            Err(ProtocolError::CapabilityMissing(capability.as_str()))
        }
    }

    fn send_text(&self, message: &ClientMessage) -> Result<()> {
        let text = message
            .to_json()
            .map_err(|e| ProtocolError::ParseError(e.to_string()))?;
        self.try_send(WsMessage::Text(text))
    }

    fn try_send(&self, message: WsMessage) -> Result<()> {
        self.state
            .out_tx
            .try_send(message)
            .map_err(|_| ProtocolError::TransportClosed)
    }

    /// Subscribes to `channel_id`, allocating a fresh subscription id
    /// (monotonic from 0, spec §4.4).
    pub fn subscribe(&self, channel_id: u32) -> Result<u32> {
        let subscription_id = self.state.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.send_text(&ClientMessage::Subscribe {
            subscriptions: vec![crate::protocol::json::SubscriptionEntry {
                id: subscription_id,
                channel_id,
            }],
        })?;
        Ok(subscription_id)
    }

    pub fn unsubscribe(&self, subscription_id: u32) -> Result<()> {
        self.send_text(&ClientMessage::Unsubscribe {
            subscription_ids: vec![subscription_id],
        })
    }

    /// Advertises a new client-published channel, allocating a fresh
    /// client channel id (monotonic from 1).
    pub fn advertise(
        &self,
        topic: String,
        encoding: String,
        schema_name: String,
        schema: Option<String>,
        schema_encoding: Option<String>,
    ) -> Result<u32> {
        self.require_capability(Capability::ClientPublish)?;
        let channel_id = self.state.next_client_channel_id.fetch_add(1, Ordering::SeqCst);
        self.send_text(&ClientMessage::Advertise {
            channels: vec![crate::protocol::json::ClientChannel {
                id: channel_id,
                topic,
                encoding,
                schema_name,
                schema,
                schema_encoding,
            }],
        })?;
        Ok(channel_id)
    }

    pub fn unadvertise(&self, channel_id: u32) -> Result<()> {
        self.require_capability(Capability::ClientPublish)?;
        self.send_text(&ClientMessage::Unadvertise {
            channel_ids: vec![channel_id],
        })
    }

    pub fn send_message(&self, channel_id: u32, payload: Vec<u8>) -> Result<()> {
        self.require_capability(Capability::ClientPublish)?;
        let frame = ClientMessageData { channel_id, payload }.encode();
        self.try_send(WsMessage::Binary(frame))
    }

    pub fn get_parameters(&self, parameter_names: Vec<String>, id: Option<String>) -> Result<()> {
        self.require_capability(Capability::Parameters)?;
        self.send_text(&ClientMessage::GetParameters { parameter_names, id })
    }

    pub fn set_parameters(&self, parameters: Vec<Parameter>, id: Option<String>) -> Result<()> {
        self.require_capability(Capability::Parameters)?;
        self.send_text(&ClientMessage::SetParameters { parameters, id })
    }

    pub fn subscribe_parameter_updates(&self, parameter_names: Vec<String>) -> Result<()> {
        self.require_capability(Capability::ParametersSubscribe)?;
        self.send_text(&ClientMessage::SubscribeParameterUpdates { parameter_names })
    }

    pub fn unsubscribe_parameter_updates(&self, parameter_names: Vec<String>) -> Result<()> {
        self.require_capability(Capability::ParametersSubscribe)?;
        self.send_text(&ClientMessage::UnsubscribeParameterUpdates { parameter_names })
    }

    pub fn subscribe_connection_graph(&self) -> Result<()> {
        self.require_capability(Capability::ConnectionGraph)?;
        self.send_text(&ClientMessage::SubscribeConnectionGraph)
    }

    pub fn unsubscribe_connection_graph(&self) -> Result<()> {
        self.require_capability(Capability::ConnectionGraph)?;
        self.send_text(&ClientMessage::UnsubscribeConnectionGraph)
    }

    /// Sends a service call request, allocating a fresh call id. The
    /// response (or failure) arrives later as a [`ClientEvent`].
    pub fn send_service_call_request(
        &self,
        service_id: u32,
        encoding: String,
        payload: Vec<u8>,
    ) -> Result<u32> {
        self.require_capability(Capability::Services)?;
        let call_id = self.state.next_call_id.fetch_add(1, Ordering::SeqCst);
        let frame = ServiceCallRequest {
            service_id,
            call_id,
            encoding,
            payload,
        }
        .encode();
        self.try_send(WsMessage::Binary(frame))?;
        self.state.pending_calls.lock().unwrap().insert(call_id);
        Ok(call_id)
    }

    /// Requests an asset by URI, allocating a fresh request id. The result
    /// arrives later as a [`ClientEvent::FetchAssetResponse`].
    pub fn fetch_asset(&self, uri: String) -> Result<u32> {
        self.require_capability(Capability::Assets)?;
        let request_id = self.state.next_request_id.fetch_add(1, Ordering::SeqCst);
        self.send_text(&ClientMessage::FetchAsset { uri, request_id })?;
        self.state
            .pending_asset_requests
            .lock()
            .unwrap()
            .insert(request_id);
        Ok(request_id)
    }
}

async fn handle_text(state: &Arc<EngineState>, text: &str, events_tx: &mpsc::Sender<ClientEvent>) {
    let frame = match ServerMessage::from_json(text) {
        Ok(frame) => frame,
        Err(e) => {
            let _ = events_tx
                .send(ClientEvent::Error(format!("malformed control frame: {e}")))
                .await;
            return;
        }
    };
    let message = match frame {
        Frame::Known(message) => message,
        Frame::UnknownOp { op, .. } => {
            debug!("unknown op {op:?} from server, ignoring");
            return;
        }
    };

    let event = match message {
        ServerMessage::ServerInfo {
            name,
            capabilities,
            supported_encodings,
            metadata,
            session_id,
            ..
        } => {
            *state.capabilities.write().unwrap() = CapabilitySet::from_wire_tokens(&capabilities);
            Some(ClientEvent::ServerInfo {
                name,
                capabilities,
                supported_encodings,
                metadata,
                session_id,
            })
        }
        ServerMessage::Status { level, message, id } => Some(ClientEvent::Status {
            level: level as u8,
            message,
            id,
        }),
        ServerMessage::RemoveStatus { status_ids } => Some(ClientEvent::RemoveStatus { status_ids }),
        ServerMessage::Advertise { channels } => Some(ClientEvent::Advertise { channels }),
        ServerMessage::Unadvertise { channel_ids } => Some(ClientEvent::Unadvertise { channel_ids }),
        ServerMessage::ParameterValues { parameters, id } => {
            Some(ClientEvent::ParameterValues { parameters, id })
        }
        ServerMessage::AdvertiseServices { services } => {
            Some(ClientEvent::AdvertiseServices { services })
        }
        ServerMessage::UnadvertiseServices { service_ids } => {
            Some(ClientEvent::UnadvertiseServices { service_ids })
        }
        ServerMessage::ConnectionGraphUpdate(update) => {
            Some(ClientEvent::ConnectionGraphUpdate(update))
        }
        ServerMessage::ServiceCallFailure {
            service_id,
            call_id,
            message,
        } => {
            if take_pending_call(state, call_id) {
                Some(ClientEvent::ServiceCallFailure {
                    service_id,
                    call_id,
                    message,
                })
            } else {
                warn!("dropping serviceCallFailure for unknown call id {call_id}");
                None
            }
        }
    };
    if let Some(event) = event {
        let _ = events_tx.send(event).await;
    }
}

fn take_pending_call(state: &Arc<EngineState>, call_id: u32) -> bool {
    state.pending_calls.lock().unwrap().remove(&call_id)
}

fn take_pending_asset_request(state: &Arc<EngineState>, request_id: u32) -> bool {
    state
        .pending_asset_requests
        .lock()
        .unwrap()
        .remove(&request_id)
}

async fn handle_binary(state: &Arc<EngineState>, data: Vec<u8>, events_tx: &mpsc::Sender<ClientEvent>) {
    let frame = match ServerBinaryFrame::decode(&data) {
        Ok(frame) => frame,
        Err(e) => {
            let _ = events_tx
                .send(ClientEvent::Error(format!("malformed binary frame: {e}")))
                .await;
            return;
        }
    };
    let event = match frame {
        ServerBinaryFrame::MessageData(m) => Some(ClientEvent::Message {
            subscription_id: m.subscription_id,
            timestamp_ns: m.timestamp_ns,
            payload: m.payload,
        }),
        ServerBinaryFrame::Time(t) => Some(ClientEvent::Time {
            timestamp_ns: t.timestamp_ns,
        }),
        ServerBinaryFrame::ServiceCallResponse(r) => {
            if take_pending_call(state, r.call_id) {
                Some(ClientEvent::ServiceCallResponse {
                    service_id: r.service_id,
                    call_id: r.call_id,
                    encoding: r.encoding,
                    payload: r.payload,
                })
            } else {
                warn!("dropping serviceCallResponse for unknown call id {}", r.call_id);
                None
            }
        }
        ServerBinaryFrame::FetchAssetResponse(r) => {
            if !take_pending_asset_request(state, r.request_id) {
                warn!(
                    "dropping fetchAssetResponse for unknown request id {}",
                    r.request_id
                );
                return;
            }
            use crate::protocol::binary::FetchAssetStatus;
            let result = match r.status {
                FetchAssetStatus::Success => Ok(r.data),
                FetchAssetStatus::Error => Err(r.error_message),
            };
            Some(ClientEvent::FetchAssetResponse {
                request_id: r.request_id,
                result,
            })
        }
    };
    if let Some(event) = event {
        let _ = events_tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::binary::{FetchAssetResponse, ServiceCallResponse};
    use crate::protocol::json::ServerMessage;

    fn test_state() -> Arc<EngineState> {
        let (out_tx, _out_rx) = mpsc::channel(8);
        Arc::new(EngineState {
            out_tx,
            next_subscription_id: AtomicU32::new(0),
            next_client_channel_id: AtomicU32::new(1),
            next_call_id: AtomicU32::new(0),
            next_request_id: AtomicU32::new(0),
            capabilities: StdRwLock::new(CapabilitySet::default()),
            pending_calls: StdMutex::new(HashSet::new()),
            pending_asset_requests: StdMutex::new(HashSet::new()),
        })
    }

    #[tokio::test]
    async fn unmatched_service_call_response_is_dropped() {
        let state = test_state();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let frame = ServiceCallResponse {
            service_id: 1,
            call_id: 99,
            encoding: "json".into(),
            payload: vec![1, 2, 3],
        }
        .encode();
        handle_binary(&state, frame, &events_tx).await;
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn matched_service_call_response_is_forwarded_once() {
        let state = test_state();
        state.pending_calls.lock().unwrap().insert(99);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let frame = ServiceCallResponse {
            service_id: 1,
            call_id: 99,
            encoding: "json".into(),
            payload: vec![1, 2, 3],
        }
        .encode();
        handle_binary(&state, frame.clone(), &events_tx).await;
        assert!(matches!(
            events_rx.try_recv().unwrap(),
            ClientEvent::ServiceCallResponse { call_id: 99, .. }
        ));

        // a duplicate/late response for the same id is no longer pending.
        handle_binary(&state, frame, &events_tx).await;
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unmatched_fetch_asset_response_is_dropped() {
        let state = test_state();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let frame = FetchAssetResponse::success(7, vec![1]).encode();
        handle_binary(&state, frame, &events_tx).await;
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unmatched_service_call_failure_is_dropped() {
        let state = test_state();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let text = ServerMessage::ServiceCallFailure {
            service_id: 1,
            call_id: 42,
            message: "boom".into(),
        }
        .to_json()
        .unwrap();
        handle_text(&state, &text, &events_tx).await;
        assert!(events_rx.try_recv().is_err());
    }
}
