//! Property tests for the wire codecs.
//!
//! Uses proptest to verify:
//! 1. Arbitrary text never panics the frame or envelope decoders.
//! 2. Any frame survives encode → decode.
//! 3. Any JSON payload placed in an envelope comes back byte-identical.

use peerdrop_proto::frame::{self, Frame};
use peerdrop_proto::signal;
use proptest::prelude::*;

fn arb_frame() -> impl Strategy<Value = Frame> {
    prop_oneof![
        ".*".prop_map(Frame::text),
        (".*", any::<u64>()).prop_map(|(name, size)| Frame::file_start(name, size)),
        Just(Frame::FileEnd),
    ]
}

/// Small JSON values rendered with arbitrary inner spacing.
fn arb_payload_json() -> impl Strategy<Value = String> {
    prop_oneof![
        any::<i64>().prop_map(|n| n.to_string()),
        "[a-z]{0,12}".prop_map(|s| format!("\"{s}\"")),
        ("[a-z]{1,8}", any::<u32>(), " {0,3}")
            .prop_map(|(k, v, pad)| format!("{{{pad}\"{k}\":{pad}{v}{pad}}}")),
        Just("null".to_string()),
    ]
}

proptest! {
    #[test]
    fn frame_decode_never_panics(text in ".*") {
        let _ = frame::decode(&text);
    }

    #[test]
    fn envelope_decode_never_panics(text in ".*") {
        let _ = signal::decode(&text);
    }

    #[test]
    fn frame_round_trip(original in arb_frame()) {
        let text = frame::encode(&original).unwrap();
        prop_assert_eq!(frame::decode(&text).unwrap(), original);
    }

    #[test]
    fn envelope_payload_is_verbatim(room in "[a-zA-Z0-9 _-]{0,16}", payload in arb_payload_json()) {
        let room_json = serde_json::to_string(&room).unwrap();
        let text = format!(r#"{{"type":"answer","room":{room_json},"payload":{payload}}}"#);
        let msg = signal::decode(&text).unwrap();
        prop_assert_eq!(&msg.room, &room);
        prop_assert_eq!(msg.payload_json(), payload.as_str());
    }
}
