//! In-memory peer stack for testing.
//!
//! [`LoopbackChannel::pair`] returns two connected data channel endpoints.
//! Each direction owns a simulated send buffer: in [`DrainMode::Immediate`]
//! messages are delivered as soon as they are sent, while in
//! [`DrainMode::Manual`] they queue up (raising `buffered_amount`) until the
//! test drains them. Draining fires the same edge-triggered low-water
//! notification a real SCTP stream would.
//!
//! [`LoopbackPeer::pair`] wraps a channel pair in two fake peer connections
//! that "negotiate" by checking that both sides hold a local and a remote
//! description, then report the channel open to both.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use peerdrop_proto::signal::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::{Notify, mpsc};

use super::{
    ChannelError, ChannelMessage, DEFAULT_MAX_MESSAGE_SIZE, DataChannel, PeerConnection, PeerError,
    PeerEvent,
};

/// Sender half of a loopback event stream.
pub type EventSender = mpsc::UnboundedSender<PeerEvent<LoopbackChannel>>;

/// Receiver half of a loopback event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<PeerEvent<LoopbackChannel>>;

/// How queued outbound messages reach the remote end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainMode {
    /// Deliver on send; `buffered_amount` stays at zero.
    #[default]
    Immediate,
    /// Queue until [`LoopbackChannel::drain_messages`] or
    /// [`LoopbackChannel::drain_all`] is called.
    Manual,
}

/// Loopback transport settings.
#[derive(Debug, Clone, Copy)]
pub struct LoopbackConfig {
    /// Largest message either end accepts.
    pub max_message_size: usize,
    /// Initial drain mode of both directions.
    pub drain: DrainMode,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            drain: DrainMode::Immediate,
        }
    }
}

/// State shared by both ends of a channel pair.
struct Link {
    open: AtomicBool,
    closed: Notify,
}

struct PipeState {
    queue: VecDeque<ChannelMessage>,
    buffered: usize,
    mode: DrainMode,
}

/// One end of an in-memory data channel.
pub struct LoopbackChannel {
    link: Arc<Link>,
    pipe: Mutex<PipeState>,
    drained: Notify,
    /// Event stream of the remote end (messages are delivered here).
    remote: EventSender,
    /// Event stream of this end (close is reported here too).
    local: EventSender,
    max_message_size: usize,
}

impl fmt::Debug for LoopbackChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackChannel")
            .field("open", &self.is_open())
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}

/// A channel end plus the event stream its peer delivers into.
pub struct LoopbackEnd {
    /// The channel.
    pub channel: Arc<LoopbackChannel>,
    /// Messages sent by the other end, and the close notification.
    pub events: EventReceiver,
}

impl LoopbackChannel {
    /// Create two open, connected channel ends.
    #[must_use]
    pub fn pair(config: LoopbackConfig) -> (LoopbackEnd, LoopbackEnd) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let (a, b) = Self::connect(config, tx_a, tx_b);
        (
            LoopbackEnd {
                channel: a,
                events: rx_a,
            },
            LoopbackEnd {
                channel: b,
                events: rx_b,
            },
        )
    }

    fn connect(
        config: LoopbackConfig,
        tx_a: EventSender,
        tx_b: EventSender,
    ) -> (Arc<Self>, Arc<Self>) {
        let link = Arc::new(Link {
            open: AtomicBool::new(true),
            closed: Notify::new(),
        });
        let end = |local: EventSender, remote: EventSender| {
            Arc::new(Self {
                link: Arc::clone(&link),
                pipe: Mutex::new(PipeState {
                    queue: VecDeque::new(),
                    buffered: 0,
                    mode: config.drain,
                }),
                drained: Notify::new(),
                remote,
                local,
                max_message_size: config.max_message_size,
            })
        };
        let a = end(tx_a.clone(), tx_b.clone());
        let b = end(tx_b, tx_a);
        (a, b)
    }

    /// Switch this end's drain mode. Switching to `Immediate` flushes the queue.
    pub fn set_drain_mode(&self, mode: DrainMode) {
        self.pipe.lock().mode = mode;
        if mode == DrainMode::Immediate {
            self.drain_all();
        }
    }

    /// Deliver up to `count` queued messages. Returns how many were delivered.
    pub fn drain_messages(&self, count: usize) -> usize {
        let delivered = {
            let mut pipe = self.pipe.lock();
            let mut delivered = 0;
            while delivered < count {
                let Some(msg) = pipe.queue.pop_front() else {
                    break;
                };
                pipe.buffered -= msg.len();
                let _ = self.remote.send(PeerEvent::Message(msg));
                delivered += 1;
            }
            delivered
        };
        if delivered > 0 {
            self.drained.notify_waiters();
        }
        delivered
    }

    /// Deliver every queued message. Returns how many were delivered.
    pub fn drain_all(&self) -> usize {
        self.drain_messages(usize::MAX)
    }

    /// Number of messages waiting in the simulated send buffer.
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.pipe.lock().queue.len()
    }

    fn enqueue(&self, msg: ChannelMessage) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        if msg.len() > self.max_message_size {
            return Err(ChannelError::MessageTooLarge {
                size: msg.len(),
                max: self.max_message_size,
            });
        }
        let mut pipe = self.pipe.lock();
        match pipe.mode {
            DrainMode::Immediate => {
                self.remote
                    .send(PeerEvent::Message(msg))
                    .map_err(|_| ChannelError::Closed)?;
            }
            DrainMode::Manual => {
                pipe.buffered += msg.len();
                pipe.queue.push_back(msg);
            }
        }
        drop(pipe);
        Ok(())
    }

    fn shut(&self) {
        if self.link.open.swap(false, Ordering::SeqCst) {
            {
                let mut pipe = self.pipe.lock();
                pipe.queue.clear();
                pipe.buffered = 0;
            }
            let _ = self.local.send(PeerEvent::ChannelClosed);
            let _ = self.remote.send(PeerEvent::ChannelClosed);
            self.link.closed.notify_waiters();
            tracing::debug!("loopback channel closed");
        }
    }
}

impl DataChannel for LoopbackChannel {
    async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        self.enqueue(ChannelMessage::Text(text.to_owned()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), ChannelError> {
        self.enqueue(ChannelMessage::Binary(data))
    }

    async fn buffered_amount(&self) -> usize {
        self.pipe.lock().buffered
    }

    async fn wait_buffered_amount_at_most(&self, threshold: usize) -> Result<(), ChannelError> {
        loop {
            let drained = self.drained.notified();
            let closed = self.link.closed.notified();
            tokio::pin!(drained, closed);
            drained.as_mut().enable();
            closed.as_mut().enable();

            if self.pipe.lock().buffered <= threshold {
                return Ok(());
            }
            if !self.is_open() {
                return Err(ChannelError::Closed);
            }

            tokio::select! {
                () = drained => {}
                () = closed => {}
            }
        }
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.shut();
    }
}

// ---------------------------------------------------------------------------
// Peer connection
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SideState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
}

impl SideState {
    const fn described(&self) -> bool {
        self.local.is_some() && self.remote.is_some()
    }
}

struct Negotiation {
    config: LoopbackConfig,
    sides: [SideState; 2],
    senders: [EventSender; 2],
    channel_requested: bool,
    channels: Option<(Arc<LoopbackChannel>, Arc<LoopbackChannel>)>,
    closed: bool,
}

impl Negotiation {
    /// Opens the channel pair once both sides are fully described.
    fn maybe_open(&mut self) {
        if self.channels.is_some()
            || self.closed
            || !self.channel_requested
            || !self.sides.iter().all(SideState::described)
        {
            return;
        }
        let (a, b) = LoopbackChannel::connect(
            self.config,
            self.senders[0].clone(),
            self.senders[1].clone(),
        );
        let _ = self.senders[0].send(PeerEvent::ChannelOpen(Arc::clone(&a)));
        let _ = self.senders[1].send(PeerEvent::ChannelOpen(Arc::clone(&b)));
        self.channels = Some((a, b));
        tracing::debug!("loopback peers connected");
    }
}

/// Fake peer connection backed by an in-memory channel pair.
pub struct LoopbackPeer {
    side: usize,
    shared: Arc<Mutex<Negotiation>>,
    candidates: Arc<AtomicU32>,
}

/// A peer plus its event stream.
pub struct LoopbackPeerEnd {
    /// The peer connection.
    pub peer: Arc<LoopbackPeer>,
    /// Candidates, channel open/close and messages.
    pub events: EventReceiver,
}

impl LoopbackPeer {
    /// Create two peers that can only negotiate with each other.
    #[must_use]
    pub fn pair(config: LoopbackConfig) -> (LoopbackPeerEnd, LoopbackPeerEnd) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Negotiation {
            config,
            sides: [SideState::default(), SideState::default()],
            senders: [tx_a, tx_b],
            channel_requested: false,
            channels: None,
            closed: false,
        }));
        let candidates = Arc::new(AtomicU32::new(0));
        let peer = |side| {
            Arc::new(Self {
                side,
                shared: Arc::clone(&shared),
                candidates: Arc::clone(&candidates),
            })
        };
        (
            LoopbackPeerEnd {
                peer: peer(0),
                events: rx_a,
            },
            LoopbackPeerEnd {
                peer: peer(1),
                events: rx_b,
            },
        )
    }

    /// Remote candidates applied on this side, in order.
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.shared.lock().sides[self.side].applied.clone()
    }

    /// The open channel of this side, if negotiation has completed.
    #[must_use]
    pub fn channel(&self) -> Option<Arc<LoopbackChannel>> {
        let shared = self.shared.lock();
        shared.channels.as_ref().map(|(a, b)| {
            if self.side == 0 {
                Arc::clone(a)
            } else {
                Arc::clone(b)
            }
        })
    }

    fn set_local(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut shared = self.shared.lock();
        if shared.closed {
            return Err(PeerError::Closed);
        }
        shared.sides[self.side].local = Some(desc);

        let n = self.candidates.fetch_add(1, Ordering::Relaxed);
        let mut candidate = IceCandidate::new(format!(
            "candidate:{n} 1 udp 2122260223 127.0.0.1 {} typ host",
            50_000 + n
        ));
        candidate.sdp_mid = Some("0".to_string());
        candidate.sdp_mline_index = Some(0);
        let _ = shared.senders[self.side].send(PeerEvent::LocalCandidate(candidate));

        shared.maybe_open();
        drop(shared);
        Ok(())
    }

    fn fake_sdp(&self, kind: &str) -> String {
        format!(
            "v=0\r\no=loopback {} 2 IN IP4 127.0.0.1\r\ns={kind}\r\nt=0 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n",
            self.side
        )
    }
}

impl PeerConnection for LoopbackPeer {
    type Channel = LoopbackChannel;

    async fn create_channel(&self, _label: &str) -> Result<(), PeerError> {
        let mut shared = self.shared.lock();
        if shared.closed {
            return Err(PeerError::Closed);
        }
        shared.channel_requested = true;
        drop(shared);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let desc = SessionDescription::offer(self.fake_sdp("offer"));
        self.set_local(desc.clone())?;
        Ok(desc)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let has_offer = self.shared.lock().sides[self.side]
            .remote
            .as_ref()
            .is_some_and(|d| d.sdp_type == SdpType::Offer);
        if !has_offer {
            return Err(PeerError::Description(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        let desc = SessionDescription::answer(self.fake_sdp("answer"));
        self.set_local(desc.clone())?;
        Ok(desc)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut shared = self.shared.lock();
        if shared.closed {
            return Err(PeerError::Closed);
        }
        let side = &mut shared.sides[self.side];
        if desc.sdp_type == SdpType::Answer && side.local.is_none() {
            return Err(PeerError::Description(
                "answer received without a local offer".to_string(),
            ));
        }
        side.remote = Some(desc);
        shared.maybe_open();
        drop(shared);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut shared = self.shared.lock();
        if shared.closed {
            return Err(PeerError::Closed);
        }
        let side = &mut shared.sides[self.side];
        if side.remote.is_none() {
            return Err(PeerError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        side.applied.push(candidate);
        drop(shared);
        Ok(())
    }

    async fn close(&self) {
        let channels = {
            let mut shared = self.shared.lock();
            shared.closed = true;
            shared.channels.take()
        };
        if let Some((a, _b)) = channels {
            // Both ends share one link, so closing either reports to both.
            a.shut();
        }
    }
}
