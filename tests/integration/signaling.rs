// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for relay signaling.
//!
//! Runs a real relay server on `127.0.0.1:0` and connects `RelaySignaling`
//! clients (and a raw WebSocket client where the wire shape matters).
//!
//! These tests validate:
//! - A payload from one member reaches every other member, never the sender
//! - The relay forwards the payload JSON verbatim
//! - Malformed payloads are skipped without breaking the connection
//! - Closing a client ends its receive stream and empties its room

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peerdrop::signaling::{DEFAULT_CONNECT_TIMEOUT, RelaySignaling, SignalingChannel, SignalingError};
use peerdrop_proto::signal::{IceCandidate, SessionDescription, SignalPayload};
use peerdrop_relay::relay::{RelayState, start_server_with_state};
use tokio_tungstenite::tungstenite::Message;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_relay() -> (String, Arc<RelayState>) {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (format!("ws://{addr}/ws"), state)
}

async fn client(url: &str) -> RelaySignaling {
    RelaySignaling::connect(url, DEFAULT_CONNECT_TIMEOUT)
        .await
        .unwrap()
}

/// Wait until the relay has registered `count` members in `room`.
async fn wait_for_members(state: &RelayState, room: &str, count: usize) {
    tokio::time::timeout(RECV_TIMEOUT, async {
        while state.room_members(room).await.len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("room {room} never reached {count} members"));
}

async fn recv(client: &RelaySignaling) -> SignalPayload {
    tokio::time::timeout(RECV_TIMEOUT, client.recv())
        .await
        .expect("timed out waiting for payload")
        .unwrap()
}

async fn assert_silent(client: &RelaySignaling) {
    let result = tokio::time::timeout(Duration::from_millis(200), client.recv()).await;
    assert!(result.is_err(), "unexpected payload: {result:?}");
}

#[tokio::test]
async fn payload_reaches_every_other_member_but_not_sender() {
    let (url, state) = start_relay().await;
    let a = client(&url).await;
    let b = client(&url).await;
    let c = client(&url).await;

    a.send("room", &SignalPayload::Join).await.unwrap();
    wait_for_members(&state, "room", 1).await;
    b.send("room", &SignalPayload::Join).await.unwrap();
    assert_eq!(recv(&a).await, SignalPayload::Join);
    wait_for_members(&state, "room", 2).await;
    c.send("room", &SignalPayload::Join).await.unwrap();
    assert_eq!(recv(&a).await, SignalPayload::Join);
    assert_eq!(recv(&b).await, SignalPayload::Join);

    let offer = SignalPayload::Offer {
        sdp: SessionDescription::offer("v=0\r\n"),
    };
    a.send("room", &offer).await.unwrap();

    assert_eq!(recv(&b).await, offer);
    assert_eq!(recv(&c).await, offer);
    assert_silent(&a).await;
}

#[tokio::test]
async fn rooms_are_isolated() {
    let (url, state) = start_relay().await;
    let a = client(&url).await;
    let b = client(&url).await;

    a.send("one", &SignalPayload::Join).await.unwrap();
    b.send("two", &SignalPayload::Join).await.unwrap();
    wait_for_members(&state, "one", 1).await;
    wait_for_members(&state, "two", 1).await;

    a.send("one", &SignalPayload::Join).await.unwrap();
    assert_silent(&b).await;
}

#[tokio::test]
async fn relay_forwards_payload_json_verbatim() {
    let (url, state) = start_relay().await;
    let (mut raw, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    raw.send(Message::Text(
        r#"{"type":"join","room":"r1","payload":{"type":"join"}}"#.into(),
    ))
    .await
    .unwrap();
    wait_for_members(&state, "r1", 1).await;

    let sender = client(&url).await;
    let candidate = IceCandidate {
        candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    };
    sender
        .send("r1", &SignalPayload::Ice { candidate })
        .await
        .unwrap();

    let frame = tokio::time::timeout(RECV_TIMEOUT, raw.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text) = frame else {
        panic!("expected text frame, got {frame:?}");
    };
    assert_eq!(
        text.as_str(),
        r#"{"type":"ice","candidate":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":null}}"#
    );
}

#[tokio::test]
async fn malformed_payload_is_skipped() {
    let (url, state) = start_relay().await;
    let receiver = client(&url).await;
    receiver.send("r1", &SignalPayload::Join).await.unwrap();
    wait_for_members(&state, "r1", 1).await;

    let (mut raw, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    raw.send(Message::Text(
        r#"{"type":"offer","room":"r1","payload":{"type":"renegotiate"}}"#.into(),
    ))
    .await
    .unwrap();
    raw.send(Message::Text(
        r#"{"type":"join","room":"r1","payload":"just a string"}"#.into(),
    ))
    .await
    .unwrap();
    raw.send(Message::Text(
        r#"{"type":"join","room":"r1","payload":{"type":"join"}}"#.into(),
    ))
    .await
    .unwrap();

    assert_eq!(recv(&receiver).await, SignalPayload::Join);
    assert!(receiver.is_connected());
}

#[tokio::test]
async fn close_ends_stream_and_leaves_room() {
    let (url, state) = start_relay().await;
    let a = client(&url).await;
    a.send("r1", &SignalPayload::Join).await.unwrap();
    wait_for_members(&state, "r1", 1).await;

    a.close().await;
    assert!(!a.is_connected());
    assert!(matches!(a.recv().await, Err(SignalingError::Closed)));
    assert!(matches!(
        a.send("r1", &SignalPayload::Join).await,
        Err(SignalingError::Closed)
    ));
    wait_for_members(&state, "r1", 0).await;
}
