//! Peer data-channel frames.
//!
//! Structured frames travel as text messages on the data channel. File bytes
//! travel as untagged binary messages and belong to whichever file the last
//! [`Frame::FileStart`] announced; the two are told apart purely by message
//! kind (text vs. binary), never by a mode flag.

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};

/// A structured frame on the peer data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// A chat message.
    Text {
        /// The message body.
        message: String,
    },
    /// Announces a file; binary fragments follow.
    FileStart {
        /// File name as chosen by the sender.
        name: String,
        /// Declared total size in bytes.
        size: u64,
    },
    /// Marks the end of the announced file.
    FileEnd,
}

impl Frame {
    /// Creates a text frame.
    pub fn text(message: impl Into<String>) -> Self {
        Self::Text {
            message: message.into(),
        }
    }

    /// Creates a file announcement.
    pub fn file_start(name: impl Into<String>, size: u64) -> Self {
        Self::FileStart {
            name: name.into(),
            size,
        }
    }
}

/// Encodes a [`Frame`] as the JSON text sent on the data channel.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if encoding fails.
pub fn encode(frame: &Frame) -> Result<String, CodecError> {
    codec::to_json(frame)
}

/// Decodes a [`Frame`] from a text message.
///
/// # Errors
///
/// Returns `CodecError::Serialization` for malformed JSON, unknown frame
/// types, or missing fields (including a negative or fractional `size`).
pub fn decode(text: &str) -> Result<Frame, CodecError> {
    codec::from_json(text)
}
