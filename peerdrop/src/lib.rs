//! `PeerDrop` client library.
//!
//! Negotiates a direct data channel with a peer through the signaling relay,
//! then exchanges text and files over it.

pub mod channel;
pub mod config;
pub mod net;
pub mod session;
pub mod signaling;
pub mod transfer;
