//! Session driver: one task per session wiring signaling, negotiation and the
//! transfer engine together.
//!
//! # Architecture
//!
//! ```text
//! caller (CLI / tests)  ─── SessionCommand ──→  session task
//!                       ←── SessionEvent  ───   ├─ Negotiator (relay payloads, peer events)
//!                                               ├─ Reassembler (channel messages)
//!                                               └─ file send task (holds the transfer slot)
//! ```
//!
//! The session task selects over commands, relay payloads, peer events and
//! progress from an in-flight file send. A file send runs on its own task so
//! incoming frames and local candidates keep being serviced while it waits
//! on backpressure; disconnecting cancels it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::rtc::RtcPeer;
use crate::channel::{PeerConnection, PeerError, PeerEvent};
use crate::session::{NegotiationState, Negotiator, Role};
use crate::signaling::{RelaySignaling, SignalingChannel, SignalingError};
use crate::transfer::receive::Reassembler;
use crate::transfer::send::FileSender;
use crate::transfer::{TransferEvent, TransferPolicy};

/// Default capacity of the command and event channels.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Commands accepted by a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Send a text message.
    SendText(String),
    /// Send the file at this path.
    SendFile(PathBuf),
    /// Close the session.
    Disconnect,
}

/// Events emitted by a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The negotiation state changed.
    StateChanged(NegotiationState),
    /// The transfer engine reported something.
    Transfer(TransferEvent),
    /// A command could not be carried out; the session continues.
    CommandFailed {
        /// Why the command failed.
        reason: String,
    },
    /// The session is over. Always the last event.
    Closed {
        /// `None` for a local disconnect.
        reason: Option<String>,
    },
}

/// Errors from setting up a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The relay connection could not be established.
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// The peer connection could not be built.
    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Room to join.
    pub room: String,
    /// Offer or answer.
    pub role: Role,
    /// Outgoing file pacing.
    pub policy: TransferPolicy,
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,
}

impl SessionConfig {
    /// Creates a config with the default policy and channel capacity.
    pub fn new(room: impl Into<String>, role: Role) -> Self {
        Self {
            room: room.into(),
            role,
            policy: TransferPolicy::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Everything needed to open a session over the relay and WebRTC.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// WebSocket URL of the relay server (e.g., `ws://127.0.0.1:3000/ws`).
    pub relay_url: String,
    /// STUN/TURN server URLs.
    pub ice_servers: Vec<String>,
    /// Timeout for the relay handshake.
    pub connect_timeout: Duration,
    /// Room to join.
    pub room: String,
    /// Offer or answer.
    pub role: Role,
    /// Outgoing file pacing.
    pub policy: TransferPolicy,
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,
}

impl NetConfig {
    /// The session part of this config.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            room: self.room.clone(),
            role: self.role,
            policy: self.policy.clone(),
            channel_capacity: self.channel_capacity,
        }
    }
}

/// Handles to a running session.
#[derive(Debug)]
pub struct SessionHandle {
    /// Send commands to the session.
    pub commands: mpsc::Sender<SessionCommand>,
    /// Receive session events; ends after [`SessionEvent::Closed`].
    pub events: mpsc::Receiver<SessionEvent>,
    /// The session task.
    pub task: JoinHandle<()>,
}

/// Connect to the relay, build a WebRTC peer and start the session.
///
/// # Errors
///
/// Returns [`SessionError`] if the relay cannot be reached or the peer
/// connection cannot be built.
pub async fn connect(config: &NetConfig) -> Result<SessionHandle, SessionError> {
    let signaling = RelaySignaling::connect(&config.relay_url, config.connect_timeout).await?;
    let (peer, peer_events) = RtcPeer::new(&config.ice_servers).await?;
    Ok(spawn_session(
        peer,
        peer_events,
        Arc::new(signaling),
        config.session_config(),
    ))
}

/// Start a session task over an existing peer connection and signaling
/// channel.
///
/// The task joins the room as caller or listens as callee, then runs until
/// [`SessionCommand::Disconnect`], the command sender is dropped, or a
/// transport closes.
pub fn spawn_session<P, S>(
    peer: Arc<P>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent<P::Channel>>,
    signaling: Arc<S>,
    config: SessionConfig,
) -> SessionHandle
where
    P: PeerConnection,
    S: SignalingChannel,
{
    let capacity = config.channel_capacity.max(1);
    let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);

    let driver = SessionDriver {
        negotiator: Negotiator::new(peer, Arc::clone(&signaling)),
        signaling,
        reassembler: Reassembler::new(),
        sender: None,
        cancel: CancellationToken::new(),
        events: event_tx,
        reported: NegotiationState::Idle,
        config,
    };
    let task = tokio::spawn(driver.run(cmd_rx, peer_events));

    SessionHandle {
        commands: cmd_tx,
        events: event_rx,
        task,
    }
}

struct SessionDriver<P: PeerConnection, S: SignalingChannel> {
    negotiator: Negotiator<P, S>,
    signaling: Arc<S>,
    reassembler: Reassembler,
    sender: Option<FileSender<P::Channel>>,
    cancel: CancellationToken,
    events: mpsc::Sender<SessionEvent>,
    reported: NegotiationState,
    config: SessionConfig,
}

impl<P: PeerConnection, S: SignalingChannel> SessionDriver<P, S> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent<P::Channel>>,
    ) {
        let (transfer_tx, mut transfer_rx) = mpsc::unbounded_channel();
        let room = self.config.room.clone();

        let started = match self.config.role {
            Role::Caller => self.negotiator.join_room(&room).await,
            Role::Callee => self.negotiator.listen(&room).await,
        };
        if let Err(e) = started {
            tracing::warn!(room = %room, error = %e, "session start failed");
            self.negotiator.mark_closed(e.to_string());
        }
        self.report_state().await;

        while !self.negotiator.state().is_closed() {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Disconnect) | None => break,
                    Some(cmd) => self.on_command(cmd, &transfer_tx).await,
                },
                signal = self.signaling.recv() => match signal {
                    Ok(payload) => {
                        if let Err(e) = self.negotiator.on_signal(payload).await {
                            tracing::warn!(error = %e, "negotiation failed");
                        }
                    }
                    Err(e) => self.negotiator.mark_closed(e.to_string()),
                },
                event = peer_events.recv() => match event {
                    Some(PeerEvent::Message(message)) => {
                        for event in self.reassembler.on_message(message) {
                            self.emit(SessionEvent::Transfer(event)).await;
                        }
                    }
                    Some(event) => {
                        if let Err(e) = self.negotiator.on_peer_event(event).await {
                            tracing::warn!(error = %e, "peer event handling failed");
                        }
                    }
                    None => self.negotiator.mark_closed("peer connection dropped"),
                },
                Some(event) = transfer_rx.recv() => {
                    self.emit(SessionEvent::Transfer(event)).await;
                }
            }
            self.report_state().await;
        }

        self.shutdown(&mut transfer_rx).await;
    }

    async fn on_command(
        &self,
        cmd: SessionCommand,
        transfer_tx: &mpsc::UnboundedSender<TransferEvent>,
    ) {
        let Some(sender) = &self.sender else {
            self.emit(SessionEvent::CommandFailed {
                reason: format!("not connected ({})", self.negotiator.state()),
            })
            .await;
            return;
        };

        match cmd {
            SessionCommand::SendText(text) => {
                if let Err(e) = sender.send_text(&text).await {
                    self.emit(SessionEvent::CommandFailed {
                        reason: e.to_string(),
                    })
                    .await;
                }
            }
            SessionCommand::SendFile(path) => {
                let sender = sender.clone();
                let cancel = self.cancel.child_token();
                let tx = transfer_tx.clone();
                tokio::spawn(async move {
                    // Outcome arrives on `tx` as SendComplete / SendFailed.
                    let _ = sender.send_file(&path, &cancel, &tx).await;
                });
            }
            SessionCommand::Disconnect => {}
        }
    }

    /// Emit `StateChanged` if the state moved, and pick up the channel once
    /// connected.
    async fn report_state(&mut self) {
        let state = self.negotiator.state().clone();
        if state == self.reported {
            return;
        }
        if state == NegotiationState::Connected && self.sender.is_none() {
            if let Some(channel) = self.negotiator.channel() {
                self.sender = Some(FileSender::new(channel, self.config.policy.clone()));
            }
        }
        tracing::debug!(from = %self.reported, to = %state, "session state changed");
        self.reported = state.clone();
        if !state.is_closed() {
            self.emit(SessionEvent::StateChanged(state)).await;
        }
    }

    async fn shutdown(mut self, transfer_rx: &mut mpsc::UnboundedReceiver<TransferEvent>) {
        self.cancel.cancel();
        self.sender = None;
        if let Some(event) = self.reassembler.reset() {
            self.emit(SessionEvent::Transfer(event)).await;
        }
        self.negotiator.disconnect().await;

        // Flush whatever the send task reported before it stopped.
        while let Ok(event) = transfer_rx.try_recv() {
            self.emit(SessionEvent::Transfer(event)).await;
        }

        let reason = match self.negotiator.state() {
            NegotiationState::Closed { reason } => reason.clone(),
            _ => None,
        };
        tracing::info!(room = %self.config.room, reason = ?reason, "session ended");
        self.emit(SessionEvent::StateChanged(self.negotiator.state().clone()))
            .await;
        self.emit(SessionEvent::Closed { reason }).await;
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("session event receiver dropped");
        }
    }
}
