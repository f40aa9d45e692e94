//! WebRTC peer stack backed by webrtc-rs.
//!
//! [`RtcPeer`] wraps an `RTCPeerConnection`; [`RtcChannel`] wraps the single
//! `RTCDataChannel` negotiated on it. All webrtc-rs callbacks are forwarded as
//! [`PeerEvent`]s on the receiver returned by [`RtcPeer::new`].
//!
//! Backpressure uses the data channel's `bufferedamountlow` event: the
//! threshold is moved to whatever the waiter asks for and the callback wakes
//! every waiter, which then re-checks `buffered_amount`.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use peerdrop_proto::signal::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::{Notify, mpsc};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    ChannelError, ChannelMessage, DEFAULT_MAX_MESSAGE_SIZE, DataChannel, PeerConnection, PeerError,
    PeerEvent,
};

type EventSender = mpsc::UnboundedSender<PeerEvent<RtcChannel>>;

/// Receiver of [`RtcPeer`] events.
pub type RtcEventReceiver = mpsc::UnboundedReceiver<PeerEvent<RtcChannel>>;

/// A negotiated `RTCDataChannel`.
pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
    /// Woken by `bufferedamountlow` and by close.
    wake: Arc<Notify>,
}

impl fmt::Debug for RtcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcChannel")
            .field("label", &self.dc.label())
            .field("state", &self.dc.ready_state())
            .finish_non_exhaustive()
    }
}

impl DataChannel for RtcChannel {
    async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        self.dc
            .send_text(text.to_owned())
            .await
            .map(|_| ())
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        if data.len() > DEFAULT_MAX_MESSAGE_SIZE {
            return Err(ChannelError::MessageTooLarge {
                size: data.len(),
                max: DEFAULT_MAX_MESSAGE_SIZE,
            });
        }
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn wait_buffered_amount_at_most(&self, threshold: usize) -> Result<(), ChannelError> {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.dc.buffered_amount().await <= threshold {
                return Ok(());
            }
            if !self.is_open() {
                return Err(ChannelError::Closed);
            }
            notified.await;
        }
    }

    fn max_message_size(&self) -> usize {
        DEFAULT_MAX_MESSAGE_SIZE
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            tracing::debug!(error = %e, "data channel close failed");
        }
        self.wake.notify_waiters();
    }
}

/// Wire webrtc-rs data channel callbacks into the event stream.
async fn attach(dc: Arc<RTCDataChannel>, events: EventSender) {
    let wake = Arc::new(Notify::new());
    let channel = Arc::new(RtcChannel {
        dc: Arc::clone(&dc),
        wake: Arc::clone(&wake),
    });

    let low = Arc::clone(&wake);
    dc.on_buffered_amount_low(Box::new(move || {
        low.notify_waiters();
        Box::pin(async {})
    }))
    .await;

    let open_events = events.clone();
    let label = dc.label().to_owned();
    dc.on_open(Box::new(move || {
        tracing::info!(label = %label, "data channel open");
        let _ = open_events.send(PeerEvent::ChannelOpen(Arc::clone(&channel)));
        Box::pin(async {})
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let message = if msg.is_string {
            String::from_utf8(msg.data.to_vec())
                .map(ChannelMessage::Text)
                .map_err(|e| tracing::warn!(error = %e, "non-utf8 text message dropped"))
                .ok()
        } else {
            Some(ChannelMessage::Binary(msg.data))
        };
        if let Some(message) = message {
            let _ = message_events.send(PeerEvent::Message(message));
        }
        Box::pin(async {})
    }));

    dc.on_close(Box::new(move || {
        tracing::info!("data channel closed");
        let _ = events.send(PeerEvent::ChannelClosed);
        wake.notify_waiters();
        Box::pin(async {})
    }));
}

/// An `RTCPeerConnection` driven through the [`PeerConnection`] seam.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: EventSender,
}

impl RtcPeer {
    /// Build a peer connection using the given STUN/TURN URLs.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Setup`] if webrtc-rs rejects the configuration.
    pub async fn new(ice_servers: &[String]) -> Result<(Arc<Self>, RtcEventReceiver), PeerError> {
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: if ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: ice_servers.to_vec(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| PeerError::Setup(e.to_string()))?,
        );
        let (tx, rx) = mpsc::unbounded_channel();

        let candidate_events = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            match candidate.map(|c| c.to_json()) {
                Some(Ok(init)) => {
                    let _ = candidate_events.send(PeerEvent::LocalCandidate(from_rtc_candidate(init)));
                }
                Some(Err(e)) => tracing::warn!(error = %e, "could not serialize local candidate"),
                None => tracing::debug!("ICE gathering complete"),
            }
            Box::pin(async {})
        }));

        let state_events = tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::info!(state = %state, "peer connection state changed");
            if state == RTCPeerConnectionState::Failed {
                let _ = state_events.send(PeerEvent::Failed(
                    "peer connection failed".to_string(),
                ));
            }
            Box::pin(async {})
        }));

        let channel_events = tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            tracing::info!(label = %dc.label(), "remote data channel announced");
            let events = channel_events.clone();
            Box::pin(async move {
                attach(dc, events).await;
            })
        }));

        Ok((Arc::new(Self { pc, events: tx }), rx))
    }
}

impl PeerConnection for RtcPeer {
    type Channel = RtcChannel;

    async fn create_channel(&self, label: &str) -> Result<(), PeerError> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| PeerError::Channel(e.to_string()))?;
        attach(dc, self.events.clone()).await;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Description(e.to_string()))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| PeerError::Description(e.to_string()))?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Description(e.to_string()))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| PeerError::Description(e.to_string()))?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| PeerError::Description(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(|e| PeerError::Candidate(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!(error = %e, "peer connection close failed");
        }
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(PeerError::Description(
                "rollback descriptions are not supported".to_string(),
            ));
        }
    };
    parsed.map_err(|e| PeerError::Description(e.to_string()))
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}
