// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! End-to-end session tests: real relay, relay signaling, loopback peers.
//!
//! Each side runs `spawn_session` exactly as the CLI does, except that the
//! WebRTC peer is replaced by the in-memory loopback pair.
//!
//! These tests validate:
//! - Both sides reach `connected` whichever side enters the room first
//! - A text message is delivered exactly once
//! - A 200 000-byte file arrives in four fragments and is reassembled
//! - A local disconnect closes the remote session too

use std::sync::Arc;
use std::time::Duration;

use peerdrop::channel::loopback::{LoopbackConfig, LoopbackPeer, LoopbackPeerEnd};
use peerdrop::net::{SessionCommand, SessionConfig, SessionEvent, SessionHandle, spawn_session};
use peerdrop::session::{NegotiationState, Role};
use peerdrop::signaling::{DEFAULT_CONNECT_TIMEOUT, RelaySignaling};
use peerdrop::transfer::TransferEvent;
use peerdrop_relay::relay::{RelayState, start_server_with_state};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

async fn start_relay() -> (String, Arc<RelayState>) {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (format!("ws://{addr}/ws"), state)
}

async fn start_session(url: &str, end: LoopbackPeerEnd, room: &str, role: Role) -> SessionHandle {
    let signaling = RelaySignaling::connect(url, DEFAULT_CONNECT_TIMEOUT)
        .await
        .unwrap();
    spawn_session(
        end.peer,
        end.events,
        Arc::new(signaling),
        SessionConfig::new(room, role),
    )
}

async fn wait_for_members(state: &RelayState, room: &str, count: usize) {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while state.room_members(room).await.len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("room {room} never reached {count} members"));
}

/// Collect events until one matches `done`; returns everything seen,
/// including the matching event.
async fn collect_until(
    session: &mut SessionHandle,
    done: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while let Some(event) = session.events.recv().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                return;
            }
        }
        panic!("session ended early: {seen:?}");
    })
    .await
    .unwrap_or_else(|_| panic!("timed out; events so far: {seen:?}"));
    seen
}

fn is_connected(event: &SessionEvent) -> bool {
    *event == SessionEvent::StateChanged(NegotiationState::Connected)
}

fn is_closed(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::Closed { .. })
}

/// Caller enters first, callee joins late and triggers a re-announce.
async fn connected_pair(room: &str) -> (SessionHandle, SessionHandle) {
    let (url, state) = start_relay().await;
    let (a_end, b_end) = LoopbackPeer::pair(LoopbackConfig::default());

    let mut a = start_session(&url, a_end, room, Role::Caller).await;
    wait_for_members(&state, room, 1).await;
    let mut b = start_session(&url, b_end, room, Role::Callee).await;

    collect_until(&mut a, is_connected).await;
    collect_until(&mut b, is_connected).await;
    (a, b)
}

#[tokio::test]
async fn late_callee_connects_and_receives_text_once() {
    let (a, mut b) = connected_pair("r1").await;

    a.commands
        .send(SessionCommand::SendText("hi".into()))
        .await
        .unwrap();

    let events = collect_until(&mut b, |e| {
        matches!(e, SessionEvent::Transfer(TransferEvent::TextReceived { .. }))
    })
    .await;
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Transfer(TransferEvent::TextReceived {
            message: "hi".into()
        }))
    );

    // Nothing else (in particular no second "hi") follows.
    let extra = tokio::time::timeout(Duration::from_millis(200), b.events.recv()).await;
    assert!(extra.is_err(), "unexpected event: {extra:?}");
}

#[tokio::test]
async fn callee_listening_first_gets_offer_directly() {
    let (url, state) = start_relay().await;
    let (a_end, b_end) = LoopbackPeer::pair(LoopbackConfig::default());

    let mut b = start_session(&url, b_end, "r2", Role::Callee).await;
    wait_for_members(&state, "r2", 1).await;
    let mut a = start_session(&url, a_end, "r2", Role::Caller).await;

    let a_events = collect_until(&mut a, is_connected).await;
    let b_events = collect_until(&mut b, is_connected).await;

    assert!(a_events.contains(&SessionEvent::StateChanged(NegotiationState::AwaitingAnswer)));
    assert!(b_events.contains(&SessionEvent::StateChanged(NegotiationState::Answering)));
}

#[tokio::test]
async fn file_is_reassembled_through_sessions() {
    let (a, mut b) = connected_pair("r3").await;

    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let dir = std::env::temp_dir().join(format!("peerdrop-session-{}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let path = dir.join("a.bin");
    tokio::fs::write(&path, &data).await.unwrap();

    a.commands
        .send(SessionCommand::SendFile(path.clone()))
        .await
        .unwrap();

    let events = collect_until(&mut b, |e| {
        matches!(e, SessionEvent::Transfer(TransferEvent::ReceiveComplete(_)))
    })
    .await;

    let progress: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Transfer(TransferEvent::ReceiveProgress { received, .. }) => {
                Some(*received)
            }
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![65_536, 131_072, 196_608, 200_000]);

    let Some(SessionEvent::Transfer(TransferEvent::ReceiveComplete(file))) = events.last() else {
        panic!("expected ReceiveComplete");
    };
    assert_eq!(file.name, "a.bin");
    assert_eq!(file.declared_size, 200_000);
    assert!(!file.truncated);
    assert_eq!(&file.data[..], &data[..]);

    tokio::fs::remove_dir_all(&dir).await.unwrap();
}

#[tokio::test]
async fn send_before_connected_fails_without_closing() {
    let (url, _state) = start_relay().await;
    let (a_end, _b_end) = LoopbackPeer::pair(LoopbackConfig::default());
    let mut a = start_session(&url, a_end, "r4", Role::Caller).await;

    a.commands
        .send(SessionCommand::SendText("too early".into()))
        .await
        .unwrap();
    let events = collect_until(&mut a, |e| matches!(e, SessionEvent::CommandFailed { .. })).await;
    assert!(!events.iter().any(is_closed));
}

#[tokio::test]
async fn disconnect_closes_both_sides() {
    let (mut a, mut b) = connected_pair("r5").await;

    a.commands.send(SessionCommand::Disconnect).await.unwrap();

    let a_events = collect_until(&mut a, is_closed).await;
    assert_eq!(a_events.last(), Some(&SessionEvent::Closed { reason: None }));

    let b_events = collect_until(&mut b, is_closed).await;
    assert!(matches!(
        b_events.last(),
        Some(SessionEvent::Closed { reason: Some(_) })
    ));

    a.task.await.unwrap();
    b.task.await.unwrap();
}

#[tokio::test]
async fn dropping_command_sender_ends_session() {
    let (a, _b) = connected_pair("r6").await;
    let SessionHandle {
        commands,
        mut events,
        task,
    } = a;
    drop(commands);

    let mut last = None;
    while let Some(event) = events.recv().await {
        last = Some(event);
    }
    assert_eq!(last, Some(SessionEvent::Closed { reason: None }));
    task.await.unwrap();
}
