//! Room registry for the relay server.
//!
//! Maps a room identifier to the connections that have sent a message naming
//! it. Rooms are created on first use and removed when their last member
//! disconnects. Entries are ephemeral and lost on relay restart.

use std::collections::HashMap;
use std::fmt;

use axum::extract::ws::Message;
use peerdrop_proto::signal::ControlMessage;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

/// Frames a member's writer may have queued before further payloads are
/// dropped for that member.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Server-side identity of one relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a fresh, time-ordered connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connection as seen by the registry: its id plus the outbound queue
/// feeding its WebSocket writer task.
#[derive(Debug, Clone)]
pub struct Member {
    id: ConnectionId,
    outbound: mpsc::Sender<Message>,
}

impl Member {
    /// Wraps a connection's outbound queue.
    #[must_use]
    pub const fn new(id: ConnectionId, outbound: mpsc::Sender<Message>) -> Self {
        Self { id, outbound }
    }

    /// The connection id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the connection's writer is alive and has room in its queue.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        !self.outbound.is_closed() && self.outbound.capacity() > 0
    }

    /// Queues `text` without waiting. A closed or full queue drops it.
    fn deliver(&self, text: &str) -> bool {
        self.outbound.try_send(Message::Text(text.into())).is_ok()
    }
}

/// Result of routing one control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteOutcome {
    /// Members that had the payload queued.
    pub delivered: usize,
    /// Members skipped because their writer was gone or its queue was full.
    pub skipped: usize,
    /// Whether this message created the room.
    pub created_room: bool,
    /// Whether this message added the sender to the room.
    pub joined: bool,
}

/// In-memory map from room id to member connections.
///
/// Constructed once at server start and owned by the relay state. Guarded by
/// a [`RwLock`] because connections are served from a multi-threaded runtime.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Vec<Member>>>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `sender` into the message's room (creating it if needed) and
    /// forwards the raw payload to every other writable member.
    ///
    /// Delivery is best effort: a member whose writer has gone away or is
    /// not keeping up is skipped without buffering or retry. The payload is never parsed.
    pub async fn route(&self, sender: &Member, msg: &ControlMessage) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();

        let recipients: Vec<Member> = {
            let mut rooms = self.rooms.write().await;
            let members = rooms.entry(msg.room.clone()).or_insert_with(|| {
                outcome.created_room = true;
                Vec::new()
            });
            if !members.iter().any(|m| m.id == sender.id) {
                members.push(sender.clone());
                outcome.joined = true;
            }
            members
                .iter()
                .filter(|m| m.id != sender.id)
                .cloned()
                .collect()
        };

        let payload = msg.payload_json();
        for member in &recipients {
            if member.deliver(payload) {
                outcome.delivered += 1;
            } else {
                outcome.skipped += 1;
                tracing::debug!(
                    room = %msg.room,
                    member = %member.id,
                    "member not writable, payload dropped"
                );
            }
        }

        outcome
    }

    /// Removes a connection from every room it belongs to.
    ///
    /// Rooms left empty are dropped. Safe to call for unknown connections and
    /// safe to call repeatedly. Returns the number of rooms the connection
    /// was removed from.
    pub async fn on_disconnect(&self, id: ConnectionId) -> usize {
        let mut rooms = self.rooms.write().await;
        let mut removed = 0;
        rooms.retain(|_, members| {
            let before = members.len();
            members.retain(|m| m.id != id);
            removed += before - members.len();
            !members.is_empty()
        });
        drop(rooms);
        removed
    }

    /// Snapshot of a room's member ids, empty if the room does not exist.
    pub async fn members(&self, room: &str) -> Vec<ConnectionId> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room)
            .map(|members| members.iter().map(Member::id).collect())
            .unwrap_or_default()
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
