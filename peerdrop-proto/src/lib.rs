//! Shared protocol definitions for the `PeerDrop` wire format.
//!
//! Two independent wire surfaces live here:
//! - [`signal`] — JSON control messages carried by the relay server.
//! - [`frame`] — structured frames carried by the peer data channel.

pub mod codec;
pub mod frame;
pub mod signal;
