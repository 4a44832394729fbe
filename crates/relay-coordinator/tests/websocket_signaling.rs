//! End-to-end tests for the WebSocket signaling endpoint.
//!
//! Serves `signaling_router` on an ephemeral port and talks to it with a
//! real WebSocket client.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_coordinator::actors::{ActorMetrics, SessionCoordinator};
use relay_coordinator::signaling::signaling_router;
use relay_test_utils::{
    client_dtls, registries_with, registry_settings, vp8_capabilities, vp8_rtp_parameters,
    MockRelay,
};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Server and Client
// ============================================================================

async fn start_server(relay: &MockRelay) -> (SocketAddr, SessionCoordinator) {
    let coordinator = SessionCoordinator::new(
        registries_with(relay, registry_settings()),
        ActorMetrics::new(),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = signaling_router(coordinator.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, coordinator)
}

/// Signaling client that parks notifications while waiting for responses.
struct SignalingClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    notifications: VecDeque<Value>,
}

impl SignalingClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/signaling"))
            .await
            .expect("WebSocket connect failed");
        Self {
            stream,
            next_id: 0,
            notifications: VecDeque::new(),
        }
    }

    async fn send_text(&mut self, text: String) {
        self.stream.send(Message::Text(text)).await.unwrap();
    }

    async fn next_frame(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(FRAME_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("read failed");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Send a request and return its response frame.
    async fn request(&mut self, method: &str, data: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id;
        self.send_text(json!({ "id": id, "method": method, "data": data }).to_string())
            .await;
        self.response_for(id).await
    }

    async fn response_for(&mut self, id: u64) -> Value {
        loop {
            let frame = self.next_frame().await;
            match frame["type"].as_str() {
                Some("response") if frame["id"] == json!(id) => return frame,
                Some("notification") => self.notifications.push_back(frame),
                _ => panic!("unexpected frame: {frame}"),
            }
        }
    }

    async fn notification(&mut self) -> Value {
        if let Some(frame) = self.notifications.pop_front() {
            return frame;
        }
        let frame = self.next_frame().await;
        assert_eq!(frame["type"], "notification", "unexpected frame: {frame}");
        frame
    }

    async fn ok(&mut self, method: &str, data: Value) -> Value {
        let frame = self.request(method, data).await;
        assert_eq!(frame["ok"], json!(true), "{method} failed: {frame}");
        frame["data"].clone()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_publish_and_consume_over_websocket() {
    let relay = MockRelay::default();
    let (addr, _coordinator) = start_server(&relay).await;

    let mut alice = SignalingClient::connect(addr).await;
    let caps = alice.ok("getRouterRtpCapabilities", Value::Null).await;
    assert!(caps["codecs"].is_array());

    let transport = alice.ok("createProducerTransport", json!({})).await;
    assert!(transport["id"].is_string());
    assert!(transport.get("iceParameters").is_some());
    assert!(transport.get("iceCandidates").is_some());
    assert!(transport.get("dtlsParameters").is_some());

    let ack = alice
        .ok(
            "connectProducerTransport",
            json!({ "dtlsParameters": client_dtls() }),
        )
        .await;
    assert_eq!(ack, Value::Null);

    let produced = alice
        .ok(
            "produce",
            json!({ "kind": "video", "rtpParameters": vp8_rtp_parameters() }),
        )
        .await;
    let producer_id = produced["id"].clone();
    assert!(producer_id.is_string());

    let mut bob = SignalingClient::connect(addr).await;
    let announced = bob.notification().await;
    assert_eq!(announced["method"], "newProducer");
    assert_eq!(announced["data"]["producerId"], producer_id);
    assert_eq!(announced["data"]["kind"], "video");

    bob.ok("createConsumerTransport", json!({})).await;
    bob.ok(
        "connectConsumerTransport",
        json!({ "dtlsParameters": client_dtls() }),
    )
    .await;
    let consumed = bob
        .ok(
            "consume",
            json!({ "producerId": producer_id, "rtpCapabilities": vp8_capabilities() }),
        )
        .await;
    assert_eq!(consumed["producerId"], producer_id);
    assert_eq!(consumed["kind"], "video");
    assert_eq!(consumed["type"], "simple");
    assert_eq!(consumed["paused"], json!(true));
    assert_eq!(consumed["producerPaused"], json!(true));
    assert!(consumed["rtpParameters"].is_object());

    assert_eq!(bob.ok("resume", json!({})).await, Value::Null);
}

#[tokio::test]
async fn test_new_producer_is_pushed_to_connected_clients() {
    let relay = MockRelay::default();
    let (addr, _coordinator) = start_server(&relay).await;

    let mut bob = SignalingClient::connect(addr).await;
    // Make sure bob's session exists before alice produces
    bob.ok("getRouterRtpCapabilities", Value::Null).await;

    let mut alice = SignalingClient::connect(addr).await;
    alice.ok("createProducerTransport", json!({})).await;
    alice
        .ok(
            "connectProducerTransport",
            json!({ "dtlsParameters": client_dtls() }),
        )
        .await;
    let produced = alice
        .ok(
            "produce",
            json!({ "kind": "audio", "rtpParameters": vp8_rtp_parameters() }),
        )
        .await;

    let pushed = bob.notification().await;
    assert_eq!(pushed["method"], "newProducer");
    assert_eq!(pushed["data"]["producerId"], produced["id"]);
    assert_eq!(pushed["data"]["kind"], "audio");
}

#[tokio::test]
async fn test_error_frames_carry_codes() {
    let relay = MockRelay::default();
    let (addr, _coordinator) = start_server(&relay).await;
    let mut client = SignalingClient::connect(addr).await;

    let frame = client.request("teleport", json!({})).await;
    assert_eq!(frame["ok"], json!(false));
    assert_eq!(frame["error"]["code"], "InvalidRequest");
    assert!(frame.get("data").is_none());

    let frame = client
        .request(
            "connectConsumerTransport",
            json!({ "dtlsParameters": client_dtls() }),
        )
        .await;
    assert_eq!(frame["error"]["code"], "UnknownTransport");

    let frame = client.request("resume", json!({})).await;
    assert_eq!(frame["error"]["code"], "NoActiveConsumer");

    client.ok("createProducerTransport", json!({})).await;
    let frame = client
        .request(
            "produce",
            json!({ "kind": "video", "rtpParameters": vp8_rtp_parameters() }),
        )
        .await;
    assert_eq!(frame["error"]["code"], "TransportNotReady");

    // The session survives every error above
    client.ok("getRouterRtpCapabilities", Value::Null).await;
}

#[tokio::test]
async fn test_unidentified_frames_are_ignored() {
    let relay = MockRelay::default();
    let (addr, _coordinator) = start_server(&relay).await;
    let mut client = SignalingClient::connect(addr).await;

    client.send_text("not json".to_string()).await;
    client
        .send_text(json!({ "method": "resume" }).to_string())
        .await;

    // The next answered frame belongs to the next identified request
    let frame = client.request("getRouterRtpCapabilities", Value::Null).await;
    assert_eq!(frame["id"], json!(1));
    assert_eq!(frame["ok"], json!(true));
}

#[tokio::test]
async fn test_responses_follow_request_order() {
    // The first request is still at the relay when the others arrive
    let relay = MockRelay::builder()
        .call_delay(Duration::from_millis(200))
        .build();
    let (addr, _coordinator) = start_server(&relay).await;
    let mut client = SignalingClient::connect(addr).await;

    // Pipeline without waiting for responses
    for (id, method) in [
        (1, "createProducerTransport"),
        (2, "getRouterRtpCapabilities"),
        (3, "teleport"),
        (4, "createConsumerTransport"),
    ] {
        client
            .send_text(json!({ "id": id, "method": method }).to_string())
            .await;
    }

    for (expected, ok) in [(1, true), (2, true), (3, false), (4, true)] {
        let frame = client.next_frame().await;
        assert_eq!(frame["type"], "response");
        assert_eq!(frame["id"], json!(expected));
        assert_eq!(frame["ok"], json!(ok), "unexpected frame: {frame}");
    }
}

#[tokio::test]
async fn test_invalid_frame_waits_behind_slow_request() {
    let relay = MockRelay::builder()
        .call_delay(Duration::from_millis(300))
        .build();
    let (addr, _coordinator) = start_server(&relay).await;
    let mut client = SignalingClient::connect(addr).await;

    client
        .send_text(json!({ "id": 1, "method": "createProducerTransport" }).to_string())
        .await;
    client
        .send_text(json!({ "id": 2, "method": "bogus" }).to_string())
        .await;

    let first = client.next_frame().await;
    assert_eq!(first["id"], json!(1));
    assert_eq!(first["ok"], json!(true));

    let second = client.next_frame().await;
    assert_eq!(second["id"], json!(2));
    assert_eq!(second["ok"], json!(false));
    assert_eq!(second["error"]["code"], "InvalidRequest");
}

#[tokio::test]
async fn test_client_close_releases_session() {
    let relay = MockRelay::default();
    let (addr, coordinator) = start_server(&relay).await;

    let mut client = SignalingClient::connect(addr).await;
    client.ok("createProducerTransport", json!({})).await;
    assert_eq!(relay.transport_count(), 1);
    assert_eq!(coordinator.status().await.unwrap().session_count, 1);

    client.stream.close(None).await.unwrap();

    // Cleanup runs after the server observes the close
    let released = async {
        loop {
            if coordinator.status().await.unwrap().session_count == 0
                && relay.transport_count() == 0
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(FRAME_TIMEOUT, released)
        .await
        .expect("session was not released");
}

#[tokio::test]
async fn test_connection_rejected_after_stop_accepting() {
    let relay = MockRelay::default();
    let (addr, coordinator) = start_server(&relay).await;
    coordinator.stop_accepting("draining").await.unwrap();

    let mut client = SignalingClient::connect(addr).await;
    let next = tokio::time::timeout(FRAME_TIMEOUT, client.stream.next())
        .await
        .expect("timed out waiting for close");
    match next {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("expected close, got {other:?}"),
    }
}
