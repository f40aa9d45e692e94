//! Transfer engine: framing, pacing and reassembly of text and files.
//!
//! Outgoing data goes through [`send::FileSender`]; incoming channel messages
//! go through [`receive::Reassembler`]. Both report what happened as
//! [`TransferEvent`]s.

pub mod receive;
pub mod send;

use std::time::Duration;

use bytes::Bytes;
use peerdrop_proto::codec::CodecError;

use crate::channel::ChannelError;

/// Pacing policy for outgoing files.
///
/// These are tuning knobs, not protocol constants: the receiver accepts any
/// fragment sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPolicy {
    /// Size of each binary fragment for chunked sends.
    pub chunk_size: usize,
    /// Files smaller than this (and within the channel's message limit) go
    /// out as a single message.
    pub single_message_threshold: u64,
    /// Sending pauses while more than this many bytes are buffered.
    pub low_water_mark: usize,
    /// Upper bound on waiting for the buffer to empty before `file-end`.
    pub drain_timeout: Duration,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            single_message_threshold: 32 * 1024 * 1024,
            low_water_mark: 1024 * 1024,
            drain_timeout: Duration::from_secs(60),
        }
    }
}

/// A file reassembled from the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Name announced by the sender (not sanitized).
    pub name: String,
    /// Size announced in `file-start`.
    pub declared_size: u64,
    /// The bytes that arrived.
    pub data: Bytes,
    /// Whether the byte count differed from the declared size.
    pub truncated: bool,
}

/// Something the transfer engine did or observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// A text message arrived.
    TextReceived {
        /// The message body.
        message: String,
    },
    /// An outgoing file was announced.
    SendStarted {
        /// File name.
        name: String,
        /// File size in bytes.
        size: u64,
    },
    /// An outgoing chunk was accepted by the channel.
    SendProgress {
        /// File name.
        name: String,
        /// Bytes accepted so far.
        sent: u64,
        /// File size in bytes.
        size: u64,
        /// `sent / size`, 1.0 for an empty file.
        fraction: f64,
    },
    /// The whole file was drained and `file-end` sent.
    SendComplete {
        /// File name.
        name: String,
        /// File size in bytes.
        size: u64,
    },
    /// An outgoing file was abandoned.
    SendFailed {
        /// File name, if it was known.
        name: Option<String>,
        /// Why the send stopped.
        reason: String,
    },
    /// An incoming file was announced.
    ReceiveStarted {
        /// File name.
        name: String,
        /// Declared size in bytes.
        size: u64,
    },
    /// An incoming fragment arrived.
    ReceiveProgress {
        /// File name.
        name: String,
        /// Bytes received so far.
        received: u64,
        /// Declared size in bytes.
        size: u64,
        /// `received / size`, 1.0 for an empty file.
        fraction: f64,
    },
    /// An incoming file finished.
    ReceiveComplete(ReceivedFile),
    /// A partially received file was dropped (replaced or disconnected).
    ReceiveDiscarded {
        /// File name.
        name: String,
        /// Bytes received before it was dropped.
        received: u64,
    },
}

/// Errors from the send path.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Another file is already being sent on this channel.
    #[error("a file transfer is already in progress")]
    Busy,

    /// The data channel is not open.
    #[error("data channel is not open")]
    NotOpen,

    /// The path has no usable file name.
    #[error("path has no file name: {0}")]
    InvalidFileName(String),

    /// Reading the source failed.
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel rejected a message.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// A frame could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The send buffer did not empty in time.
    #[error("send buffer did not drain within {0:?}")]
    DrainTimeout(Duration),

    /// The transfer was cancelled.
    #[error("transfer cancelled")]
    Cancelled,
}

/// `done / total` as a fraction; an empty total counts as complete.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn progress_fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        done as f64 / total as f64
    }
}

/// Reduce a peer-supplied file name to a safe single path component.
///
/// Directory parts are stripped, control characters and separators replaced,
/// and names that would be empty or refer to `.`/`..` fall back to
/// `download.bin`.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        "download.bin".to_string()
    } else {
        trimmed.to_string()
    }
}
