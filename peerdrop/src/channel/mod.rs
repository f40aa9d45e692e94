//! Peer transport seams.
//!
//! The negotiator and transfer engine never talk to a concrete WebRTC stack.
//! They drive a [`PeerConnection`] (session descriptions, ICE candidates) and,
//! once it reports the channel open, a [`DataChannel`] (ordered, reliable
//! messages with a flow-controlled send buffer). Implementations:
//! - [`loopback`]: in-memory pair with a simulated send buffer, for tests
//! - [`rtc`]: webrtc-rs `RTCPeerConnection` / `RTCDataChannel`

pub mod loopback;
pub mod rtc;

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use peerdrop_proto::signal::{IceCandidate, SessionDescription};

/// Default maximum message size of an SCTP data channel.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// One message received on the data channel.
///
/// Text and binary messages are distinct on the wire; the reassembler relies
/// on that distinction to tell frames from file fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// A UTF-8 text message (structured frame).
    Text(String),
    /// A binary message (file fragment).
    Binary(Bytes),
}

impl ChannelMessage {
    /// Size of the message body in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    /// Whether the message body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors from data channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel is not open (never opened, or already closed).
    #[error("data channel is closed")]
    Closed,

    /// The message exceeds what the transport accepts in one message.
    #[error("message of {size} bytes exceeds channel limit of {max} bytes")]
    MessageTooLarge {
        /// Attempted message size.
        size: usize,
        /// Transport limit.
        max: usize,
    },

    /// The underlying transport reported an error.
    #[error("data channel transport error: {0}")]
    Transport(String),
}

/// Errors from peer connection operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Creating or applying a session description failed.
    #[error("session description rejected: {0}")]
    Description(String),

    /// An ICE candidate could not be applied.
    #[error("ICE candidate rejected: {0}")]
    Candidate(String),

    /// The data channel could not be created.
    #[error("data channel setup failed: {0}")]
    Channel(String),

    /// The peer connection has been closed.
    #[error("peer connection closed")]
    Closed,

    /// Building the peer connection failed.
    #[error("peer connection setup failed: {0}")]
    Setup(String),
}

/// Events emitted by a [`PeerConnection`] on the receiver returned at
/// construction.
#[derive(Debug)]
pub enum PeerEvent<C> {
    /// A local ICE candidate was gathered and should be sent to the peer.
    LocalCandidate(IceCandidate),
    /// The data channel is open and ready to send.
    ChannelOpen(Arc<C>),
    /// A message arrived on the data channel.
    Message(ChannelMessage),
    /// The data channel closed.
    ChannelClosed,
    /// The connection failed (ICE exhausted, DTLS error, ...).
    Failed(String),
}

/// An ordered, reliable message channel with a flow-controlled send buffer.
///
/// `buffered_amount` is the number of bytes accepted by `send_*` but not yet
/// handed to the network. Sends never block on it; callers pace themselves
/// with [`DataChannel::wait_buffered_amount_at_most`].
pub trait DataChannel: Send + Sync + 'static {
    /// Send a text message.
    fn send_text(&self, text: &str) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Send a binary message.
    fn send_binary(&self, data: Bytes) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Bytes queued for sending.
    fn buffered_amount(&self) -> impl Future<Output = usize> + Send;

    /// Resolve once `buffered_amount() <= threshold`.
    ///
    /// Driven by the transport's edge-triggered "buffered amount low"
    /// notification, not by polling. Resolves immediately if the condition
    /// already holds.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the channel closes while waiting.
    fn wait_buffered_amount_at_most(
        &self,
        threshold: usize,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Largest message the transport accepts.
    fn max_message_size(&self) -> usize;

    /// Whether the channel is currently open.
    fn is_open(&self) -> bool;

    /// Close the channel. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// A peer connection able to negotiate one data channel.
///
/// `create_offer` and `create_answer` also apply the result as the local
/// description, so the returned description can be sent as-is.
pub trait PeerConnection: Send + Sync + 'static {
    /// Data channel type delivered in [`PeerEvent::ChannelOpen`].
    type Channel: DataChannel;

    /// Create the local data channel (caller side).
    fn create_channel(&self, label: &str) -> impl Future<Output = Result<(), PeerError>> + Send;

    /// Create an offer and set it as the local description.
    fn create_offer(&self) -> impl Future<Output = Result<SessionDescription, PeerError>> + Send;

    /// Create an answer to the applied remote offer and set it as the local
    /// description.
    fn create_answer(&self)
    -> impl Future<Output = Result<SessionDescription, PeerError>> + Send;

    /// Apply the remote peer's description.
    fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> impl Future<Output = Result<(), PeerError>> + Send;

    /// Apply one remote ICE candidate. Requires the remote description.
    fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> impl Future<Output = Result<(), PeerError>> + Send;

    /// Tear down the connection and its channel. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
