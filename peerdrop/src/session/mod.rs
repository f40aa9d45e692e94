//! Session negotiation.
//!
//! The [`Negotiator`] turns relay signaling into an open data channel. The
//! caller creates the channel and an offer; the callee answers it. ICE
//! candidates trickle in both directions and are buffered until the remote
//! description is applied. The session reaches
//! [`NegotiationState::Connected`] only when the transport reports the
//! channel open.
//!
//! ```text
//! caller: Idle -> Offering -> AwaitingAnswer -> Connected
//! callee: Idle -> Answering -> Connected
//! any state -> Closed
//! ```

pub mod ice;

use std::fmt;
use std::sync::Arc;

use peerdrop_proto::signal::{IceCandidate, SdpType, SessionDescription, SignalPayload};

use crate::channel::{DataChannel, PeerConnection, PeerError, PeerEvent};
use crate::signaling::{SignalingChannel, SignalingError};

use ice::{IceAction, IceBuffer};

/// Label of the single data channel a session negotiates.
pub const DATA_CHANNEL_LABEL: &str = "peerdrop";

/// Which side of the negotiation this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the channel and sends the offer.
    Caller,
    /// Waits for an offer and answers it.
    Callee,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caller => write!(f, "caller"),
            Self::Callee => write!(f, "callee"),
        }
    }
}

/// Negotiation progress of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    /// Nothing sent yet (or only a `join` announcement).
    Idle,
    /// Caller is building its offer.
    Offering,
    /// Caller has sent its offer.
    AwaitingAnswer,
    /// Callee has received an offer and is answering.
    Answering,
    /// The data channel is open.
    Connected,
    /// The session is over. `reason` is `None` for a local disconnect.
    Closed {
        /// Why the session closed.
        reason: Option<String>,
    },
}

impl NegotiationState {
    /// Whether the session has closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Offering => write!(f, "offering"),
            Self::AwaitingAnswer => write!(f, "awaiting-answer"),
            Self::Answering => write!(f, "answering"),
            Self::Connected => write!(f, "connected"),
            Self::Closed { reason: None } => write!(f, "closed"),
            Self::Closed {
                reason: Some(reason),
            } => write!(f, "closed ({reason})"),
        }
    }
}

/// Errors surfaced by the negotiator.
///
/// Protocol errors from the remote side (wrong-state offers and answers) are
/// logged and dropped rather than returned.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// The room id was empty.
    #[error("room id must not be empty")]
    EmptyRoom,

    /// The operation is not valid in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// State at the time of the call.
        state: NegotiationState,
    },

    /// The peer connection rejected a step.
    #[error(transparent)]
    Peer(#[from] PeerError),

    /// The relay connection failed.
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// Drives one peer connection through offer/answer over a signaling channel.
pub struct Negotiator<P: PeerConnection, S: SignalingChannel> {
    peer: Arc<P>,
    signaling: Arc<S>,
    room: Option<String>,
    role: Option<Role>,
    state: NegotiationState,
    ice: IceBuffer,
    /// Every local candidate gathered so far, for re-announcing.
    local_candidates: Vec<IceCandidate>,
    /// The caller's offer, kept for re-announcing to late joiners.
    offer: Option<SessionDescription>,
    channel: Option<Arc<P::Channel>>,
}

impl<P: PeerConnection, S: SignalingChannel> Negotiator<P, S> {
    /// Creates an idle negotiator.
    pub fn new(peer: Arc<P>, signaling: Arc<S>) -> Self {
        Self {
            peer,
            signaling,
            room: None,
            role: None,
            state: NegotiationState::Idle,
            ice: IceBuffer::new(),
            local_candidates: Vec::new(),
            offer: None,
            channel: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &NegotiationState {
        &self.state
    }

    /// Role, once the session has started or received an offer.
    #[must_use]
    pub const fn role(&self) -> Option<Role> {
        self.role
    }

    /// Room this session addresses.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    /// The open data channel, available once connected.
    #[must_use]
    pub fn channel(&self) -> Option<Arc<P::Channel>> {
        self.channel.clone()
    }

    /// Start a session as the caller.
    ///
    /// Creates the local channel, announces `join`, then sends the offer and
    /// moves to [`NegotiationState::AwaitingAnswer`].
    ///
    /// # Errors
    ///
    /// - [`NegotiationError::EmptyRoom`] / [`NegotiationError::InvalidState`]
    ///   leave the state unchanged.
    /// - Peer or signaling failures close the session and are returned.
    pub async fn join_room(&mut self, room: &str) -> Result<(), NegotiationError> {
        if room.is_empty() {
            return Err(NegotiationError::EmptyRoom);
        }
        if self.state != NegotiationState::Idle {
            return Err(NegotiationError::InvalidState {
                operation: "join a room",
                state: self.state.clone(),
            });
        }

        self.room = Some(room.to_string());
        self.role = Some(Role::Caller);
        self.state = NegotiationState::Offering;
        tracing::info!(room = room, "joining room as caller");

        match self.send_offer(room).await {
            Ok(offer) => {
                self.offer = Some(offer);
                self.state = NegotiationState::AwaitingAnswer;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Announce presence in `room` and wait for an offer.
    ///
    /// The state stays [`NegotiationState::Idle`]; a caller already waiting
    /// in the room re-sends its offer on seeing the announcement.
    ///
    /// # Errors
    ///
    /// Same input errors as [`join_room`](Self::join_room); a signaling
    /// failure closes the session.
    pub async fn listen(&mut self, room: &str) -> Result<(), NegotiationError> {
        if room.is_empty() {
            return Err(NegotiationError::EmptyRoom);
        }
        if self.state != NegotiationState::Idle {
            return Err(NegotiationError::InvalidState {
                operation: "listen",
                state: self.state.clone(),
            });
        }

        self.room = Some(room.to_string());
        tracing::info!(room = room, "listening for an offer");
        if let Err(e) = self.signaling.send(room, &SignalPayload::Join).await {
            return Err(self.fail(e.into()));
        }
        Ok(())
    }

    /// Handle a payload forwarded by the relay.
    ///
    /// # Errors
    ///
    /// Returns peer or signaling failures, after closing the session.
    pub async fn on_signal(&mut self, payload: SignalPayload) -> Result<(), NegotiationError> {
        if self.state.is_closed() {
            tracing::debug!(kind = %payload.kind(), "signal after close ignored");
            return Ok(());
        }

        match payload {
            SignalPayload::Join => self.on_join().await,
            SignalPayload::Offer { sdp } => self.on_offer(sdp).await,
            SignalPayload::Answer { sdp } => self.on_answer(sdp).await,
            SignalPayload::Ice { candidate } => {
                match self.ice.accept(candidate) {
                    IceAction::Apply(candidate) => self.apply_candidate(candidate).await,
                    IceAction::Buffered => {
                        tracing::debug!(
                            pending = self.ice.pending_len(),
                            "remote candidate buffered until description is set"
                        );
                    }
                    IceAction::Ignore => {}
                }
                Ok(())
            }
        }
    }

    /// Handle a non-message event from the peer connection.
    ///
    /// # Errors
    ///
    /// Returns a signaling failure while forwarding a local candidate, after
    /// closing the session.
    pub async fn on_peer_event(
        &mut self,
        event: PeerEvent<P::Channel>,
    ) -> Result<(), NegotiationError> {
        if self.state.is_closed() {
            return Ok(());
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.local_candidates.push(candidate.clone());
                if let Some(room) = self.room.clone() {
                    let payload = SignalPayload::Ice { candidate };
                    if let Err(e) = self.signaling.send(&room, &payload).await {
                        return Err(self.fail(e.into()));
                    }
                }
            }
            PeerEvent::ChannelOpen(channel) => {
                let ready = match self.state {
                    NegotiationState::AwaitingAnswer => self.ice.remote_described(),
                    NegotiationState::Answering => true,
                    _ => false,
                };
                if ready {
                    self.channel = Some(channel);
                    self.state = NegotiationState::Connected;
                    tracing::info!(room = ?self.room, role = ?self.role, "data channel connected");
                } else {
                    tracing::warn!(state = %self.state, "channel opened in unexpected state");
                }
            }
            PeerEvent::Message(_) => {
                tracing::debug!("channel message routed to negotiator, ignored");
            }
            PeerEvent::ChannelClosed => {
                self.state = NegotiationState::Closed {
                    reason: Some("data channel closed".to_string()),
                };
                tracing::info!("data channel closed by transport");
            }
            PeerEvent::Failed(reason) => {
                tracing::warn!(reason = %reason, "peer connection failed");
                self.state = NegotiationState::Closed {
                    reason: Some(reason),
                };
            }
        }
        Ok(())
    }

    /// Record that the session ended for a reason outside the negotiator
    /// (for example the relay socket closing). No-op once closed.
    pub fn mark_closed(&mut self, reason: impl Into<String>) {
        if !self.state.is_closed() {
            let reason = reason.into();
            tracing::info!(room = ?self.room, reason = %reason, "session closed");
            self.state = NegotiationState::Closed {
                reason: Some(reason),
            };
        }
    }

    /// Close the channel, the peer connection and the relay connection.
    ///
    /// Safe to call from any state and more than once.
    pub async fn disconnect(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.peer.close().await;
        self.signaling.close().await;
        if !self.state.is_closed() {
            tracing::info!(room = ?self.room, "session disconnected");
            self.state = NegotiationState::Closed { reason: None };
        }
    }

    async fn send_offer(&self, room: &str) -> Result<SessionDescription, NegotiationError> {
        self.peer.create_channel(DATA_CHANNEL_LABEL).await?;
        self.signaling.send(room, &SignalPayload::Join).await?;
        let offer = self.peer.create_offer().await?;
        self.signaling
            .send(room, &SignalPayload::Offer { sdp: offer.clone() })
            .await?;
        Ok(offer)
    }

    /// A late joiner announced itself; repeat the offer and candidates it
    /// missed.
    async fn on_join(&mut self) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::AwaitingAnswer || self.ice.remote_described() {
            tracing::debug!(state = %self.state, "join announcement ignored");
            return Ok(());
        }
        let (Some(room), Some(offer)) = (self.room.clone(), self.offer.clone()) else {
            return Ok(());
        };

        tracing::info!(
            room = %room,
            candidates = self.local_candidates.len(),
            "peer joined, re-sending offer"
        );
        let result = async {
            self.signaling
                .send(&room, &SignalPayload::Offer { sdp: offer })
                .await?;
            for candidate in &self.local_candidates {
                let payload = SignalPayload::Ice {
                    candidate: candidate.clone(),
                };
                self.signaling.send(&room, &payload).await?;
            }
            Ok::<(), SignalingError>(())
        }
        .await;

        result.map_err(|e| self.fail(e.into()))
    }

    async fn on_offer(&mut self, sdp: SessionDescription) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::Idle {
            tracing::warn!(state = %self.state, "offer received in wrong state, ignored");
            return Ok(());
        }
        if sdp.sdp_type != SdpType::Offer {
            tracing::warn!(sdp_type = ?sdp.sdp_type, "offer payload without an offer description, ignored");
            return Ok(());
        }
        let Some(room) = self.room.clone() else {
            tracing::warn!("offer received before joining a room, ignored");
            return Ok(());
        };

        self.role = Some(Role::Callee);
        self.state = NegotiationState::Answering;
        tracing::info!(room = %room, "offer received, answering");

        let result = async {
            self.peer.set_remote_description(sdp).await?;
            self.flush_candidates().await;
            let answer = self.peer.create_answer().await?;
            self.signaling
                .send(&room, &SignalPayload::Answer { sdp: answer })
                .await?;
            Ok::<(), NegotiationError>(())
        }
        .await;

        result.map_err(|e| self.fail(e))
    }

    async fn on_answer(&mut self, sdp: SessionDescription) -> Result<(), NegotiationError> {
        if self.state != NegotiationState::AwaitingAnswer || self.ice.remote_described() {
            tracing::warn!(state = %self.state, "answer received in wrong state, ignored");
            return Ok(());
        }
        if sdp.sdp_type != SdpType::Answer {
            tracing::warn!(sdp_type = ?sdp.sdp_type, "answer payload without an answer description, ignored");
            return Ok(());
        }

        if let Err(e) = self.peer.set_remote_description(sdp).await {
            return Err(self.fail(e.into()));
        }
        tracing::info!("answer applied, waiting for channel");
        self.flush_candidates().await;
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        for candidate in self.ice.mark_remote_described() {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            tracing::warn!(error = %e, "remote candidate rejected");
        }
    }

    /// Close the session with `err` as the reason and hand the error back.
    fn fail(&mut self, err: NegotiationError) -> NegotiationError {
        tracing::warn!(error = %err, state = %self.state, "negotiation failed");
        self.state = NegotiationState::Closed {
            reason: Some(err.to_string()),
        };
        err
    }
}
