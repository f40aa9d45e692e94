//! Relay wire protocol types.
//!
//! Clients send a [`ControlMessage`] envelope to the relay as a JSON text
//! frame. The relay reads only the envelope (`type`, `room`) and forwards the
//! `payload` JSON verbatim to the other members of the room. The payload is
//! kept as a [`RawValue`] so the relay never parses or re-serializes it.
//!
//! Clients put a [`SignalPayload`] in that payload slot; it is what the remote
//! peer receives.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::codec::{self, CodecError};

/// The negotiation step a control message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    /// Announces membership of a room.
    Join,
    /// Carries the caller's session description.
    Offer,
    /// Carries the callee's session description.
    Answer,
    /// Carries one ICE candidate.
    Ice,
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Join => write!(f, "join"),
            Self::Offer => write!(f, "offer"),
            Self::Answer => write!(f, "answer"),
            Self::Ice => write!(f, "ice"),
        }
    }
}

/// Envelope sent from a client to the relay.
///
/// Wire shape: `{ "type": <kind>, "room": <string>, "payload": <opaque> }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Which negotiation step this message belongs to.
    #[serde(rename = "type")]
    pub kind: ControlKind,
    /// Room the sender addresses (and is registered into).
    pub room: String,
    /// Opaque payload, forwarded byte-for-byte.
    pub payload: Box<RawValue>,
}

impl ControlMessage {
    /// Builds an envelope around a client [`SignalPayload`].
    ///
    /// The envelope kind is derived from the payload variant.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Serialization` if the payload cannot be encoded.
    pub fn wrap(room: impl Into<String>, payload: &SignalPayload) -> Result<Self, CodecError> {
        let raw = serde_json::value::to_raw_value(payload)
            .map_err(|e| CodecError::Serialization(e.to_string()))?;
        Ok(Self {
            kind: payload.kind(),
            room: room.into(),
            payload: raw,
        })
    }

    /// The payload exactly as it appeared on the wire.
    #[must_use]
    pub fn payload_json(&self) -> &str {
        self.payload.get()
    }
}

/// Encodes a [`ControlMessage`] as a JSON string.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if encoding fails.
pub fn encode(msg: &ControlMessage) -> Result<String, CodecError> {
    codec::to_json(msg)
}

/// Decodes a [`ControlMessage`] envelope from a JSON string.
///
/// Only the envelope is validated; the payload may be any JSON value.
///
/// # Errors
///
/// Returns `CodecError::Serialization` for malformed JSON, an unknown `type`,
/// or a missing `room`/`payload` field.
pub fn decode(text: &str) -> Result<ControlMessage, CodecError> {
    codec::from_json(text)
}

/// Session description exchanged in `offer` and `answer` payloads.
///
/// Matches the JSON form of a browser `RTCSessionDescription`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// The SDP body.
    pub sdp: String,
}

impl SessionDescription {
    /// Creates an offer description.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Creates an answer description.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// SDP description kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Initial description from the caller.
    Offer,
    /// Provisional answer.
    Pranswer,
    /// Final description from the callee.
    Answer,
    /// Rollback to the previous stable state.
    Rollback,
}

/// One ICE candidate, in the JSON form of a browser `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The candidate attribute line.
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to.
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment.
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Creates a candidate with only the attribute line set.
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Payload a client places inside a [`ControlMessage`].
///
/// This is what the remote peer receives from the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    /// A peer joined the room.
    Join,
    /// The caller's offer.
    Offer {
        /// Offer description.
        sdp: SessionDescription,
    },
    /// The callee's answer.
    Answer {
        /// Answer description.
        sdp: SessionDescription,
    },
    /// A trickled ICE candidate.
    Ice {
        /// The candidate.
        candidate: IceCandidate,
    },
}

impl SignalPayload {
    /// The envelope kind this payload travels under.
    #[must_use]
    pub const fn kind(&self) -> ControlKind {
        match self {
            Self::Join => ControlKind::Join,
            Self::Offer { .. } => ControlKind::Offer,
            Self::Answer { .. } => ControlKind::Answer,
            Self::Ice { .. } => ControlKind::Ice,
        }
    }
}

/// Decodes a forwarded payload received from the relay.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the text is not a known payload.
pub fn decode_payload(text: &str) -> Result<SignalPayload, CodecError> {
    codec::from_json(text)
}
