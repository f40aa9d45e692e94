// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation
)]

//! Integration tests for the transfer engine over a loopback channel.
//!
//! The sending end runs in `DrainMode::Manual` where pacing matters, so the
//! test decides when buffered messages reach the receiver.
//!
//! These tests validate:
//! - The 200 000-byte scenario: four fragments (65536 x 3 + 3392)
//! - Backpressure: nothing is sent above the low-water mark, and the chunk
//!   count does not depend on pauses
//! - `file-end` waits for the buffer to drain to zero
//! - Text frames interleave with fragments
//! - Cancellation stops the send for good
//! - One file at a time per channel

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use peerdrop::channel::loopback::{DrainMode, LoopbackChannel, LoopbackConfig, LoopbackEnd};
use peerdrop::channel::{ChannelMessage, DataChannel, PeerEvent};
use peerdrop::transfer::receive::Reassembler;
use peerdrop::transfer::send::FileSender;
use peerdrop::transfer::{ReceivedFile, TransferError, TransferEvent, TransferPolicy};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn pair(drain: DrainMode) -> (LoopbackEnd, LoopbackEnd) {
    LoopbackChannel::pair(LoopbackConfig {
        drain,
        ..LoopbackConfig::default()
    })
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

/// Everything the receiving end has been sent so far.
fn received_messages(end: &mut LoopbackEnd) -> Vec<ChannelMessage> {
    let mut out = Vec::new();
    while let Ok(event) = end.events.try_recv() {
        if let PeerEvent::Message(msg) = event {
            out.push(msg);
        }
    }
    out
}

fn reassemble(messages: Vec<ChannelMessage>) -> Vec<TransferEvent> {
    let mut reassembler = Reassembler::new();
    messages
        .into_iter()
        .flat_map(|m| reassembler.on_message(m))
        .collect()
}

fn completed_file(events: &[TransferEvent]) -> &ReceivedFile {
    events
        .iter()
        .find_map(|e| match e {
            TransferEvent::ReceiveComplete(file) => Some(file),
            _ => None,
        })
        .expect("no ReceiveComplete event")
}

fn fragment_lengths(messages: &[ChannelMessage]) -> Vec<usize> {
    messages
        .iter()
        .filter_map(|m| match m {
            ChannelMessage::Binary(data) => Some(data.len()),
            ChannelMessage::Text(_) => None,
        })
        .collect()
}

fn spawn_send(
    sender: &FileSender<LoopbackChannel>,
    name: &str,
    data: Vec<u8>,
    cancel: &CancellationToken,
) -> (
    JoinHandle<Result<u64, TransferError>>,
    mpsc::UnboundedReceiver<TransferEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = sender.clone();
    let name = name.to_string();
    let cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        let size = data.len() as u64;
        sender
            .send_reader(&name, size, Cursor::new(data), &cancel, &tx)
            .await
    });
    (handle, rx)
}

/// Poll `cond` until it holds.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition never held");
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn two_hundred_kilobyte_file_arrives_in_four_fragments() {
    let (a, mut b) = pair(DrainMode::Immediate);
    let sender = FileSender::new(a.channel, TransferPolicy::default());
    let data = pattern(200_000);
    let (tx, _rx) = mpsc::unbounded_channel();

    sender
        .send_reader("a.bin", 200_000, &data[..], &CancellationToken::new(), &tx)
        .await
        .unwrap();

    let messages = received_messages(&mut b);
    assert_eq!(fragment_lengths(&messages), vec![65_536, 65_536, 65_536, 3_392]);

    let events = reassemble(messages);
    let file = completed_file(&events);
    assert_eq!(file.name, "a.bin");
    assert_eq!(file.data.len(), 200_000);
    assert!(!file.truncated);
    assert_eq!(&file.data[..], &data[..]);
}

#[tokio::test]
async fn zero_byte_file_arrives_empty() {
    let (a, mut b) = pair(DrainMode::Immediate);
    let sender = FileSender::new(a.channel, TransferPolicy::default());
    let (tx, _rx) = mpsc::unbounded_channel();

    sender
        .send_reader("empty.txt", 0, tokio::io::empty(), &CancellationToken::new(), &tx)
        .await
        .unwrap();

    let events = reassemble(received_messages(&mut b));
    let file = completed_file(&events);
    assert!(file.data.is_empty());
    assert!(!file.truncated);
}

#[tokio::test]
async fn file_from_disk_round_trips() {
    let (a, mut b) = pair(DrainMode::Immediate);
    let sender = FileSender::new(a.channel, TransferPolicy::default());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let dir = std::env::temp_dir().join(format!("peerdrop-transfer-{}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let path = dir.join("notes.txt");
    let data = pattern(70_000);
    tokio::fs::write(&path, &data).await.unwrap();

    let sent = sender
        .send_file(&path, &CancellationToken::new(), &tx)
        .await
        .unwrap();
    assert_eq!(sent, 70_000);

    let events = reassemble(received_messages(&mut b));
    let file = completed_file(&events);
    assert_eq!(file.name, "notes.txt");
    assert_eq!(&file.data[..], &data[..]);

    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        last = Some(event);
    }
    assert_eq!(
        last,
        Some(TransferEvent::SendComplete {
            name: "notes.txt".into(),
            size: 70_000
        })
    );

    tokio::fs::remove_dir_all(&dir).await.unwrap();
}

#[tokio::test]
async fn backpressure_pauses_above_low_water_mark() {
    let (a, mut b) = pair(DrainMode::Manual);
    let policy = TransferPolicy {
        chunk_size: 1_000,
        low_water_mark: 2_000,
        ..TransferPolicy::default()
    };
    let sender = FileSender::new(Arc::clone(&a.channel), policy);
    let cancel = CancellationToken::new();
    let (handle, _rx) = spawn_send(&sender, "bp.bin", pattern(10_500), &cancel);

    // file-start + two chunks fit under the mark, the third must wait.
    wait_until(|| a.channel.pending_messages() == 3).await;
    settle().await;
    assert_eq!(a.channel.pending_messages(), 3);
    assert!(!handle.is_finished());

    let mut peak = 0;
    while !handle.is_finished() {
        peak = peak.max(a.channel.buffered_amount().await);
        a.channel.drain_messages(1);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    handle.await.unwrap().unwrap();
    a.channel.drain_all();

    assert!(peak <= 2_000 + 1_000, "buffer peaked at {peak}");

    let messages = received_messages(&mut b);
    let lengths = fragment_lengths(&messages);
    assert_eq!(lengths.len(), 11);
    assert_eq!(lengths.iter().sum::<usize>(), 10_500);

    let events = reassemble(messages);
    assert_eq!(completed_file(&events).data.len(), 10_500);
}

#[tokio::test]
async fn file_end_waits_for_buffer_to_drain() {
    let (a, mut b) = pair(DrainMode::Manual);
    let sender = FileSender::new(Arc::clone(&a.channel), TransferPolicy::default());
    let cancel = CancellationToken::new();
    let (handle, _rx) = spawn_send(&sender, "small", pattern(500), &cancel);

    wait_until(|| a.channel.pending_messages() == 2).await;
    settle().await;
    assert_eq!(a.channel.pending_messages(), 2);
    assert!(!handle.is_finished());

    a.channel.drain_all();
    assert_eq!(handle.await.unwrap().unwrap(), 500);
    assert_eq!(a.channel.pending_messages(), 1);
    a.channel.drain_all();

    let messages = received_messages(&mut b);
    assert_eq!(
        messages.last(),
        Some(&ChannelMessage::Text(r#"{"type":"file-end"}"#.into()))
    );
}

#[tokio::test]
async fn text_interleaves_with_fragments() {
    let (a, mut b) = pair(DrainMode::Manual);
    let policy = TransferPolicy {
        chunk_size: 1_000,
        low_water_mark: 1_500,
        ..TransferPolicy::default()
    };
    let sender = FileSender::new(Arc::clone(&a.channel), policy);
    let cancel = CancellationToken::new();
    let data = pattern(4_000);
    let (handle, _rx) = spawn_send(&sender, "mixed.bin", data.clone(), &cancel);

    wait_until(|| sender.is_busy() && a.channel.pending_messages() >= 2).await;
    sender.send_text("while you wait").await.unwrap();

    a.channel.set_drain_mode(DrainMode::Immediate);
    handle.await.unwrap().unwrap();

    let messages = received_messages(&mut b);
    let text_index = messages
        .iter()
        .position(|m| matches!(m, ChannelMessage::Text(t) if t.contains("while you wait")))
        .unwrap();
    let last_fragment = messages
        .iter()
        .rposition(|m| matches!(m, ChannelMessage::Binary(_)))
        .unwrap();
    assert!(text_index < last_fragment);

    let events = reassemble(messages);
    assert!(events.contains(&TransferEvent::TextReceived {
        message: "while you wait".into()
    }));
    assert_eq!(&completed_file(&events).data[..], &data[..]);
}

#[tokio::test]
async fn cancellation_stops_further_chunks() {
    let (a, mut b) = pair(DrainMode::Manual);
    let policy = TransferPolicy {
        chunk_size: 1_000,
        low_water_mark: 1_500,
        ..TransferPolicy::default()
    };
    let sender = FileSender::new(Arc::clone(&a.channel), policy);
    let cancel = CancellationToken::new();
    let (handle, mut rx) = spawn_send(&sender, "c.bin", pattern(8_000), &cancel);

    wait_until(|| a.channel.pending_messages() == 3).await;
    cancel.cancel();
    assert!(matches!(
        handle.await.unwrap(),
        Err(TransferError::Cancelled)
    ));

    // Backpressure clearing afterwards must not resume the send.
    a.channel.drain_all();
    settle().await;
    assert_eq!(a.channel.pending_messages(), 0);
    assert!(!sender.is_busy());

    let messages = received_messages(&mut b);
    assert_eq!(fragment_lengths(&messages), vec![1_000, 1_000]);
    assert!(!messages.iter().any(|m| matches!(m, ChannelMessage::Text(t) if t.contains("file-end"))));

    let mut failed = false;
    while let Ok(event) = rx.try_recv() {
        failed |= matches!(event, TransferEvent::SendFailed { .. });
    }
    assert!(failed);
}

#[tokio::test]
async fn second_file_is_rejected_while_busy() {
    let (a, _b) = pair(DrainMode::Manual);
    let sender = FileSender::new(Arc::clone(&a.channel), TransferPolicy::default());
    let cancel = CancellationToken::new();
    let (handle, _rx) = spawn_send(&sender, "first", pattern(100), &cancel);

    wait_until(|| sender.is_busy()).await;
    let (tx, _rx2) = mpsc::unbounded_channel();
    let second = sender
        .send_reader("second", 3, &b"abc"[..], &cancel, &tx)
        .await;
    assert!(matches!(second, Err(TransferError::Busy)));

    a.channel.set_drain_mode(DrainMode::Immediate);
    handle.await.unwrap().unwrap();
    assert!(!sender.is_busy());
}

#[tokio::test]
async fn channel_closing_mid_transfer_fails_the_send() {
    let (a, b) = pair(DrainMode::Manual);
    let policy = TransferPolicy {
        chunk_size: 1_000,
        low_water_mark: 1_500,
        ..TransferPolicy::default()
    };
    let sender = FileSender::new(Arc::clone(&a.channel), policy);
    let cancel = CancellationToken::new();
    let (handle, _rx) = spawn_send(&sender, "x.bin", pattern(8_000), &cancel);

    wait_until(|| a.channel.pending_messages() == 3).await;
    b.channel.close().await;

    assert!(matches!(
        handle.await.unwrap(),
        Err(TransferError::Channel(_))
    ));
}
