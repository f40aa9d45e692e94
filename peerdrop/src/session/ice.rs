//! Remote ICE candidate buffering.
//!
//! Candidates can overtake the session description they belong to. Until the
//! remote description is applied they are held here, then flushed in arrival
//! order. Every candidate is applied at most once.

use std::collections::HashSet;

use peerdrop_proto::signal::IceCandidate;

/// What to do with an incoming remote candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceAction {
    /// Apply it now.
    Apply(IceCandidate),
    /// Held until the remote description is set.
    Buffered,
    /// Already seen, or an end-of-candidates marker; nothing to do.
    Ignore,
}

/// Holds remote candidates that arrive before the remote description.
#[derive(Debug, Default)]
pub struct IceBuffer {
    pending: Vec<IceCandidate>,
    seen: HashSet<String>,
    remote_described: bool,
}

impl IceBuffer {
    /// Creates an empty buffer; the remote description is not yet set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a newly received candidate.
    pub fn accept(&mut self, candidate: IceCandidate) -> IceAction {
        if candidate.candidate.is_empty() {
            return IceAction::Ignore;
        }
        if !self.seen.insert(candidate.candidate.clone()) {
            tracing::debug!(candidate = %candidate.candidate, "duplicate remote candidate");
            return IceAction::Ignore;
        }
        if self.remote_described {
            IceAction::Apply(candidate)
        } else {
            self.pending.push(candidate);
            IceAction::Buffered
        }
    }

    /// Record that the remote description is applied and return every
    /// buffered candidate, oldest first.
    pub fn mark_remote_described(&mut self) -> Vec<IceCandidate> {
        self.remote_described = true;
        std::mem::take(&mut self.pending)
    }

    /// Whether the remote description has been applied.
    #[must_use]
    pub const fn remote_described(&self) -> bool {
        self.remote_described
    }

    /// Number of candidates waiting for the remote description.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
