//! `PeerDrop` signaling relay library.
//!
//! Exposes the relay server for use in tests and embedding. The relay accepts
//! WebSocket connections, registers each connection into the rooms it names,
//! and fans opaque negotiation payloads out to the other room members.

pub mod config;
pub mod relay;
pub mod rooms;
