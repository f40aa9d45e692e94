// Test-specific lint overrides: property tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::cast_possible_truncation
)]

//! Property tests for chunking and reassembly.
//!
//! Uses proptest to verify, for arbitrary sizes and chunk sizes:
//! 1. Fragment lengths sum to the file size.
//! 2. A chunked send produces exactly `ceil(S / C)` fragments.
//! 3. The reassembled bytes equal the original and `received == S`.
//! 4. On arbitrary message sequences, progress counts exactly the bytes since
//!    the last `file-start` and orphan fragments are dropped.

use peerdrop::channel::loopback::{LoopbackChannel, LoopbackConfig};
use peerdrop::channel::{ChannelMessage, PeerEvent};
use peerdrop::transfer::receive::Reassembler;
use peerdrop::transfer::send::FileSender;
use peerdrop::transfer::{TransferEvent, TransferPolicy};
use proptest::prelude::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Send `data` over a fresh loopback pair and return what the far end saw.
fn send_through_loopback(data: &[u8], policy: TransferPolicy) -> Vec<ChannelMessage> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    runtime.block_on(async {
        let (a, mut b) = LoopbackChannel::pair(LoopbackConfig::default());
        let sender = FileSender::new(a.channel, policy);
        let (tx, _rx) = mpsc::unbounded_channel();
        sender
            .send_reader("p.bin", data.len() as u64, data, &CancellationToken::new(), &tx)
            .await
            .unwrap();

        let mut messages = Vec::new();
        while let Ok(event) = b.events.try_recv() {
            if let PeerEvent::Message(msg) = event {
                messages.push(msg);
            }
        }
        messages
    })
}

fn arb_message() -> impl Strategy<Value = ChannelMessage> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..64)
            .prop_map(|v| ChannelMessage::Binary(v.into())),
        ("[a-z.]{0,8}", 0u64..256).prop_map(|(name, size)| ChannelMessage::Text(format!(
            r#"{{"type":"file-start","name":"{name}","size":{size}}}"#
        ))),
        Just(ChannelMessage::Text(r#"{"type":"file-end"}"#.to_string())),
        ".{0,16}".prop_map(|m| ChannelMessage::Text(
            serde_json::json!({"type": "text", "message": m}).to_string()
        )),
        ".{0,16}".prop_map(ChannelMessage::Text),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn chunked_send_reassembles_exactly(
        data in prop::collection::vec(any::<u8>(), 0..20_000),
        chunk_size in 1usize..5_000,
    ) {
        let policy = TransferPolicy {
            chunk_size,
            single_message_threshold: 0,
            ..TransferPolicy::default()
        };
        let messages = send_through_loopback(&data, policy);

        let lengths: Vec<usize> = messages
            .iter()
            .filter_map(|m| match m {
                ChannelMessage::Binary(b) => Some(b.len()),
                ChannelMessage::Text(_) => None,
            })
            .collect();
        prop_assert_eq!(lengths.iter().sum::<usize>(), data.len());
        prop_assert_eq!(lengths.len(), data.len().div_ceil(chunk_size));

        let mut reassembler = Reassembler::new();
        let mut completed = None;
        for message in messages {
            for event in reassembler.on_message(message) {
                if let TransferEvent::ReceiveComplete(file) = event {
                    completed = Some(file);
                }
            }
        }
        let file = completed.unwrap();
        prop_assert_eq!(file.declared_size, data.len() as u64);
        prop_assert!(!file.truncated);
        prop_assert_eq!(&file.data[..], &data[..]);
    }

    #[test]
    fn reassembler_tracks_bytes_since_last_file_start(
        messages in prop::collection::vec(arb_message(), 0..40),
    ) {
        let mut reassembler = Reassembler::new();
        let mut expected: Option<u64> = None;

        for message in messages {
            let kind = classify(&message);
            let events = reassembler.on_message(message);
            match kind {
                Kind::Fragment(len) => match expected.as_mut() {
                    Some(received) => {
                        *received += len;
                        let progressed = matches!(
                            events.as_slice(),
                            [TransferEvent::ReceiveProgress { received: r, .. }] if *r == *received
                        );
                        prop_assert!(progressed);
                    }
                    None => prop_assert!(events.is_empty()),
                },
                Kind::Start => expected = Some(0),
                Kind::End => {
                    match expected.take() {
                        Some(received) => {
                            let finished = matches!(
                                events.as_slice(),
                                [TransferEvent::ReceiveComplete(file)] if file.data.len() as u64 == received
                            );
                            prop_assert!(finished);
                        }
                        None => prop_assert!(events.is_empty()),
                    }
                }
                Kind::Other => {}
            }
        }
        prop_assert_eq!(reassembler.reset().is_some(), expected.is_some());
    }
}

enum Kind {
    Fragment(u64),
    Start,
    End,
    Other,
}

fn classify(message: &ChannelMessage) -> Kind {
    match message {
        ChannelMessage::Binary(data) => Kind::Fragment(data.len() as u64),
        ChannelMessage::Text(text) if text.starts_with(r#"{"type":"file-start""#) => Kind::Start,
        ChannelMessage::Text(text) if text == r#"{"type":"file-end"}"# => Kind::End,
        ChannelMessage::Text(_) => Kind::Other,
    }
}
