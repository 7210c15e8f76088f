//! Peer descriptors shared by the routing and client tables.

use serde::{Deserialize, Serialize};

use crate::id::NodeId;

/// NAT classification reported by the transport for a peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatType {
    #[default]
    Unknown,
    Symmetric,
    Other,
}

/// Everything this node tracks about a connected peer.
///
/// `node_id` names the peer in the overlay; `connection_id` names the
/// transport connection that reaches it. The two differ when the peer is
/// reached through a rendezvous connection. `dimension_list` is the peer's
/// own view of its closest set, mirrored into the group matrix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub connection_id: NodeId,
    pub is_client: bool,
    pub rank: i32,
    pub nat_type: NatType,
    pub dimension_list: Vec<NodeId>,
}

impl PeerInfo {
    pub fn new(node_id: NodeId, connection_id: NodeId) -> Self {
        Self {
            node_id,
            connection_id,
            is_client: false,
            rank: 0,
            nat_type: NatType::Unknown,
            dimension_list: Vec::new(),
        }
    }

    pub fn client(node_id: NodeId, connection_id: NodeId) -> Self {
        Self {
            is_client: true,
            ..Self::new(node_id, connection_id)
        }
    }
}

/// Compact peer form carried inside closest-set update payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicPeer {
    pub node_id: NodeId,
    pub rank: i32,
}

impl From<&PeerInfo> for BasicPeer {
    fn from(peer: &PeerInfo) -> Self {
        Self {
            node_id: peer.node_id,
            rank: peer.rank,
        }
    }
}
