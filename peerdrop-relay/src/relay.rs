//! Relay server core: shared state, WebSocket handler, and message routing.
//!
//! Each accepted WebSocket gets a [`ConnectionId`] and a bounded outbound
//! queue drained by a dedicated writer task. Inbound frames are decoded as
//! [`ControlMessage`] envelopes and handed to the [`RoomRegistry`], which
//! registers the sender and fans the payload out. Malformed frames are logged
//! and dropped; they never end the connection.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use peerdrop_proto::signal::{self, ControlMessage};
use tokio::sync::mpsc;

use crate::rooms::{ConnectionId, Member, OUTBOUND_QUEUE_CAPACITY, RoomRegistry};

/// Default maximum accepted control frame size in bytes (1 MiB).
const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Shared relay server state.
pub struct RelayState {
    /// Room membership and fan-out.
    pub registry: RoomRegistry,
    /// Frames larger than this are dropped unread.
    max_message_size: usize,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates relay state with an empty registry and default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Creates relay state with a custom frame size limit.
    #[must_use]
    pub fn with_config(max_message_size: usize) -> Self {
        Self {
            registry: RoomRegistry::new(),
            max_message_size,
        }
    }

    /// Snapshot of a room's members.
    pub async fn room_members(&self, room: &str) -> Vec<ConnectionId> {
        self.registry.members(room).await
    }
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Assign a connection id and spawn the writer task.
/// 2. Route every inbound control message through the registry.
/// 3. On close or error, remove the connection from every room.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let conn_id = ConnectionId::new();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
    let member = Member::new(conn_id, tx);

    tracing::info!(conn = %conn_id, "connection opened");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(conn = %conn_id, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_frame(&member, text.as_str(), &reader_state).await;
                }
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => handle_frame(&member, text, &reader_state).await,
                    Err(e) => {
                        tracing::warn!(conn = %member.id(), error = %e, "non-utf8 binary frame dropped");
                    }
                },
                Message::Close(_) => {
                    tracing::info!(conn = %member.id(), "received close frame");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    let rooms = state.registry.on_disconnect(conn_id).await;
    tracing::info!(conn = %conn_id, rooms = rooms, "connection closed and removed from rooms");
}

/// Decodes one inbound frame and routes it.
async fn handle_frame(member: &Member, text: &str, state: &RelayState) {
    if text.len() > state.max_message_size {
        tracing::warn!(
            conn = %member.id(),
            size = text.len(),
            max = state.max_message_size,
            "control message exceeds size limit, dropped"
        );
        return;
    }

    let msg: ControlMessage = match signal::decode(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(conn = %member.id(), error = %e, "malformed control message dropped");
            return;
        }
    };

    let outcome = state.registry.route(member, &msg).await;
    if outcome.created_room {
        tracing::info!(conn = %member.id(), room = %msg.room, "room created");
    }
    if outcome.joined {
        tracing::info!(conn = %member.id(), room = %msg.room, "connection joined room");
    }
    tracing::debug!(
        conn = %member.id(),
        room = %msg.room,
        kind = %msg.kind,
        delivered = outcome.delivered,
        skipped = outcome.skipped,
        "routed control message"
    );
}

/// Starts the relay server on the given address with default state.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`] and returns
/// the bound address and the server task handle.
///
/// The WebSocket endpoint is served at both `/` (browser clients connect to
/// the page origin) and `/ws`.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/", axum::routing::get(ws_handler))
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
