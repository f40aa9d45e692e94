//! Signaling over the room relay.
//!
//! A [`SignalingChannel`] carries [`SignalPayload`]s between the two peers of
//! a room. [`RelaySignaling`] implements it over a WebSocket connection to
//! the relay server: outgoing payloads are wrapped in a
//! [`ControlMessage`] envelope, incoming text frames are the bare payloads
//! the relay forwarded from the other member.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peerdrop_proto::codec::CodecError;
use peerdrop_proto::signal::{self, ControlMessage, SignalPayload};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for connecting to the relay server.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the incoming payload queue.
const INCOMING_CAPACITY: usize = 256;

/// Errors from the signaling layer.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    /// The relay URL is not a `ws://` or `wss://` URL.
    #[error("invalid relay URL {url}: {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Connecting to the relay timed out.
    #[error("relay connection timed out")]
    Timeout,

    /// The relay could not be reached.
    #[error("relay connection failed: {0}")]
    Connect(String),

    /// The relay connection has closed.
    #[error("relay connection closed")]
    Closed,

    /// A payload could not be encoded.
    #[error("signal encoding failed: {0}")]
    Codec(#[from] CodecError),
}

/// A bidirectional path for negotiation payloads.
pub trait SignalingChannel: Send + Sync + 'static {
    /// Send a payload to the other members of `room`.
    fn send(
        &self,
        room: &str,
        payload: &SignalPayload,
    ) -> impl Future<Output = Result<(), SignalingError>> + Send;

    /// Receive the next payload from another member.
    ///
    /// Returns [`SignalingError::Closed`] once the connection is gone.
    fn recv(&self) -> impl Future<Output = Result<SignalPayload, SignalingError>> + Send;

    /// Close the connection. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// [`SignalingChannel`] over a WebSocket connection to the relay.
pub struct RelaySignaling {
    relay_url: String,
    ws_sender: Mutex<WsSender>,
    incoming: Mutex<mpsc::Receiver<SignalPayload>>,
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl RelaySignaling {
    /// Connect to the relay and start the background reader.
    ///
    /// # Errors
    ///
    /// - [`SignalingError::InvalidUrl`] for a non-WebSocket URL.
    /// - [`SignalingError::Timeout`] if the handshake exceeds `timeout`.
    /// - [`SignalingError::Connect`] if the relay refuses the connection.
    pub async fn connect(relay_url: &str, timeout: Duration) -> Result<Self, SignalingError> {
        let parsed = url::Url::parse(relay_url).map_err(|e| SignalingError::InvalidUrl {
            url: relay_url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(SignalingError::InvalidUrl {
                url: relay_url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }

        let (ws_stream, _response) = tokio::time::timeout(timeout, connect_async(relay_url))
            .await
            .map_err(|_| {
                tracing::warn!(url = relay_url, "relay WebSocket connect timed out");
                SignalingError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url = relay_url, err = %e, "relay WebSocket connect failed");
                SignalingError::Connect(e.to_string())
            })?;

        let (ws_sender, ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&connected)));

        tracing::info!(url = relay_url, "connected to signaling relay");

        Ok(Self {
            relay_url: relay_url.to_string(),
            ws_sender: Mutex::new(ws_sender),
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }

    /// The relay URL this client is connected to.
    #[must_use]
    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Whether the relay connection is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl SignalingChannel for RelaySignaling {
    async fn send(&self, room: &str, payload: &SignalPayload) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Closed);
        }
        let envelope = ControlMessage::wrap(room, payload)?;
        let text = signal::encode(&envelope)?;

        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "relay send failed");
            self.connected.store(false, Ordering::Relaxed);
            SignalingError::Closed
        })?;
        drop(sender);

        tracing::debug!(room = room, kind = %payload.kind(), "sent signal");
        Ok(())
    }

    async fn recv(&self) -> Result<SignalPayload, SignalingError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(SignalingError::Closed)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.close().await {
            tracing::debug!(err = %e, "relay close failed");
        }
        drop(sender);
        self.reader_handle.abort();
    }
}

impl Drop for RelaySignaling {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Background task that decodes forwarded payloads.
///
/// Malformed or unknown payloads are logged and skipped; only a closed or
/// failed socket ends the loop.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<SignalPayload>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        let text = match msg_result {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(err = %e, "non-utf8 relay frame, skipping");
                    continue;
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("relay WebSocket closed by server");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Err(e) => {
                tracing::warn!(err = %e, "relay WebSocket read error");
                break;
            }
        };

        match signal::decode_payload(&text) {
            Ok(payload) => {
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(err = %e, "malformed signal payload, skipping");
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::info!("signaling reader task exiting");
}
