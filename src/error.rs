//! Error taxonomy for the routing core.
//!
//! Malformed input from the network is never a panic: structural failures
//! surface as silent drops at the protocol level and as [`RoutingError`]
//! values internally, visible in logs.

use thiserror::Error;

use crate::id::NodeId;

/// Failures the routing core distinguishes.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// A transport send failed past the retry budget.
    #[error("send to {peer:?} failed after {attempts} attempts")]
    TransportFailure { peer: NodeId, attempts: u32 },

    /// The routing table has no peer left to forward through.
    #[error("routing table exhausted; no forwarding candidate")]
    RoutingExhausted,

    /// Structural parse failure, unknown type, or invalid identifier.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Hop allowance reached zero.
    #[error("message exhausted its hop allowance")]
    HopsExceeded,

    /// A peer reported a closest set conflicting with provable local
    /// knowledge. The update is refused; the connection is kept.
    #[error("peer {peer:?} reported an inconsistent closest set")]
    SelfConsistency { peer: NodeId },

    /// The node is stopping; the operation completed silently.
    #[error("node is shutting down")]
    Shutdown,
}
