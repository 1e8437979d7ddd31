//! End-to-end coverage of the literal scenarios in spec §8, driven over a
//! real loopback WebSocket connection: a `FoxgloveServer` bound to a fixed
//! port, and a `ClientEngine` connecting to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use foxglove_ws_protocol::capability::Capability;
use foxglove_ws_protocol::events::{ClientEvent, ServerHandler};
use foxglove_ws_protocol::protocol::json::{NewChannel, NewService, ServiceMessageSchema};
use foxglove_ws_protocol::server::{FoxgloveServer, ServerOptions};
use foxglove_ws_protocol::{ClientEngine, SessionHandle};

async fn recv_timeout(events: &mut tokio::sync::mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("client event stream closed unexpectedly")
}

#[derive(Default)]
struct RecordingHandler {
    subscribed: AtomicBool,
}

impl ServerHandler for RecordingHandler {
    fn on_subscribe(&self, _channel_id: u32) {
        self.subscribed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct EchoServiceHandler;

impl ServerHandler for EchoServiceHandler {
    fn on_service_call(
        &self,
        _session: SessionHandle,
        _service_id: u32,
        _call_id: u32,
        encoding: String,
        _payload: Vec<u8>,
    ) -> anyhow::Result<(String, Vec<u8>)> {
        Ok((encoding, vec![4, 5, 6]))
    }

    fn on_fetch_asset(
        &self,
        _session: SessionHandle,
        uri: String,
        _request_id: u32,
    ) -> anyhow::Result<Vec<u8>> {
        if uri == "package://foo/known.urdf" {
            Ok(vec![4, 5, 6])
        } else {
            Err(anyhow::anyhow!("not found"))
        }
    }
}

// S1: a bare server with no channels sends only serverInfo on connect.
#[tokio::test]
async fn s1_server_info_with_no_channels() {
    let server = FoxgloveServer::new(
        ServerOptions::new("foo"),
        foxglove_ws_protocol::events::NullHandler,
    );
    tokio::spawn({
        let server = server.clone();
        async move { server.serve(([127, 0, 0, 1], 18765)).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_client, mut events) = ClientEngine::connect("ws://127.0.0.1:18765")
        .await
        .unwrap();
    assert_eq!(recv_timeout(&mut events).await, ClientEvent::Open);
    match recv_timeout(&mut events).await {
        ClientEvent::ServerInfo { name, capabilities, .. } => {
            assert_eq!(name, "foo");
            assert!(capabilities.is_empty());
        }
        other => panic!("expected ServerInfo, got {other:?}"),
    }
}

// S2/S4: advertise before connect, subscribe fires the edge, broadcast
// reaches the subscriber with the documented byte layout.
#[tokio::test]
async fn s2_advertise_subscribe_and_broadcast_message() {
    let handler = Arc::new(RecordingHandler::default());
    let server = FoxgloveServer::new(ServerOptions::new("foo"), RecordingHandlerWrapper(handler.clone()));
    let channel = server
        .add_channel(NewChannel {
            topic: "foo".into(),
            encoding: "bar".into(),
            schema_name: "Foo".into(),
            schema: "some data".into(),
            schema_encoding: None,
        })
        .await;
    assert_eq!(channel.id, 1);

    tokio::spawn({
        let server = server.clone();
        async move { server.serve(([127, 0, 0, 1], 18766)).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (client, mut events) = ClientEngine::connect("ws://127.0.0.1:18766").await.unwrap();
    assert_eq!(recv_timeout(&mut events).await, ClientEvent::Open);
    let _server_info = recv_timeout(&mut events).await;
    match recv_timeout(&mut events).await {
        ClientEvent::Advertise { channels } => assert_eq!(channels[0].id, 1),
        other => panic!("expected Advertise, got {other:?}"),
    }

    let subscription_id = client.subscribe(1).unwrap();
    assert_eq!(subscription_id, 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handler.subscribed.load(Ordering::SeqCst));

    server.broadcast_message(1, 42, &[1, 2, 3]).await.unwrap();
    match recv_timeout(&mut events).await {
        ClientEvent::Message {
            subscription_id,
            timestamp_ns,
            payload,
        } => {
            assert_eq!(subscription_id, 0);
            assert_eq!(timestamp_ns, 42);
            assert_eq!(payload, vec![1, 2, 3]);
        }
        other => panic!("expected Message, got {other:?}"),
    }
}

// Thin adapter so one Arc<RecordingHandler> can be shared between the test
// body (to observe the edge) and the server (which needs an owned H).
struct RecordingHandlerWrapper(Arc<RecordingHandler>);
impl ServerHandler for RecordingHandlerWrapper {
    fn on_subscribe(&self, channel_id: u32) {
        self.0.on_subscribe(channel_id);
    }
}

// S5: broadcastTime reaches every connected client.
#[tokio::test]
async fn s5_broadcast_time() {
    let options = ServerOptions::new("foo").with_capabilities([Capability::Time]);
    let server = FoxgloveServer::new(options, foxglove_ws_protocol::events::NullHandler);
    tokio::spawn({
        let server = server.clone();
        async move { server.serve(([127, 0, 0, 1], 18767)).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_client, mut events) = ClientEngine::connect("ws://127.0.0.1:18767").await.unwrap();
    assert_eq!(recv_timeout(&mut events).await, ClientEvent::Open);
    let _server_info = recv_timeout(&mut events).await;

    server.broadcast_time(42).await.unwrap();
    match recv_timeout(&mut events).await {
        ClientEvent::Time { timestamp_ns } => assert_eq!(timestamp_ns, 42),
        other => panic!("expected Time, got {other:?}"),
    }
}

// S6: a service call request/response round trip.
#[tokio::test]
async fn s6_service_call_round_trip() {
    let options = ServerOptions::new("foo").with_capabilities([Capability::Services]);
    let server = FoxgloveServer::new(options, EchoServiceHandler);
    server
        .add_service(NewService {
            name: "echo".into(),
            kind: "test".into(),
            request: Some(ServiceMessageSchema {
                encoding: "json".into(),
                schema_name: "Req".into(),
                schema_encoding: None,
                schema: "{}".into(),
            }),
            response: Some(ServiceMessageSchema {
                encoding: "json".into(),
                schema_name: "Resp".into(),
                schema_encoding: None,
                schema: "{}".into(),
            }),
            request_schema: None,
            response_schema: None,
        })
        .await
        .unwrap();
    tokio::spawn({
        let server = server.clone();
        async move { server.serve(([127, 0, 0, 1], 18768)).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (client, mut events) = ClientEngine::connect("ws://127.0.0.1:18768").await.unwrap();
    assert_eq!(recv_timeout(&mut events).await, ClientEvent::Open);
    let _server_info = recv_timeout(&mut events).await;
    let _advertise_services = recv_timeout(&mut events).await;

    let call_id = client
        .send_service_call_request(1, "json".into(), vec![1, 2, 3])
        .unwrap();
    assert_eq!(call_id, 0);
    match recv_timeout(&mut events).await {
        ClientEvent::ServiceCallResponse {
            service_id,
            call_id,
            encoding,
            payload,
        } => {
            assert_eq!(service_id, 1);
            assert_eq!(call_id, 0);
            assert_eq!(encoding, "json");
            assert_eq!(payload, vec![4, 5, 6]);
        }
        other => panic!("expected ServiceCallResponse, got {other:?}"),
    }
}

// S7: fetchAsset success and failure.
#[tokio::test]
async fn s7_fetch_asset_success_and_failure() {
    let options = ServerOptions::new("foo").with_capabilities([Capability::Assets]);
    let server = FoxgloveServer::new(options, EchoServiceHandler);
    tokio::spawn({
        let server = server.clone();
        async move { server.serve(([127, 0, 0, 1], 18769)).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (client, mut events) = ClientEngine::connect("ws://127.0.0.1:18769").await.unwrap();
    assert_eq!(recv_timeout(&mut events).await, ClientEvent::Open);
    let _server_info = recv_timeout(&mut events).await;

    let request_id = client.fetch_asset("package://foo/known.urdf".into()).unwrap();
    match recv_timeout(&mut events).await {
        ClientEvent::FetchAssetResponse { request_id: id, result } => {
            assert_eq!(id, request_id);
            assert_eq!(result, Ok(vec![4, 5, 6]));
        }
        other => panic!("expected FetchAssetResponse, got {other:?}"),
    }

    let request_id = client.fetch_asset("package://foo/missing.urdf".into()).unwrap();
    match recv_timeout(&mut events).await {
        ClientEvent::FetchAssetResponse { request_id: id, result } => {
            assert_eq!(id, request_id);
            assert_eq!(result, Err("not found".to_string()));
        }
        other => panic!("expected FetchAssetResponse, got {other:?}"),
    }
}
