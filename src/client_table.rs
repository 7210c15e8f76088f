//! # Client / Non-Routing Table
//!
//! Peers connected to this node that take no part in forwarding: clients,
//! and directly-connected peers outside the routing set. Membership has no
//! proximity requirement; the table is a plain FIFO-bounded multimap keyed
//! by node id. A single peer may hold several logical connections at once,
//! so lookups return every matching entry.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::debug;

use crate::id::{debug_id, NodeId};
use crate::peer::PeerInfo;

pub struct ClientTable {
    self_id: NodeId,
    max_size: usize,
    entries: Mutex<VecDeque<PeerInfo>>,
}

impl ClientTable {
    pub fn new(self_id: NodeId, max_size: usize) -> Self {
        Self {
            self_id,
            max_size,
            entries: Mutex::new(VecDeque::with_capacity(max_size)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("client table lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a connection. The oldest entry is evicted when full; a
    /// duplicate (node id, connection id) pairing is refused.
    pub fn add(&self, peer: PeerInfo) -> bool {
        if peer.node_id == self.self_id || peer.node_id.is_zero() || peer.connection_id.is_zero() {
            return false;
        }
        let mut entries = self.entries.lock().expect("client table lock");
        if entries
            .iter()
            .any(|p| p.node_id == peer.node_id && p.connection_id == peer.connection_id)
        {
            return false;
        }
        if entries.len() >= self.max_size {
            if let Some(evicted) = entries.pop_front() {
                debug!(
                    peer = %debug_id(&evicted.node_id),
                    "client table full, dropping oldest connection"
                );
            }
        }
        entries.push_back(peer);
        true
    }

    /// Every connection registered for `node_id`.
    pub fn get(&self, node_id: &NodeId) -> Vec<PeerInfo> {
        self.entries
            .lock()
            .expect("client table lock")
            .iter()
            .filter(|p| p.node_id == *node_id)
            .cloned()
            .collect()
    }

    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.entries
            .lock()
            .expect("client table lock")
            .iter()
            .any(|p| p.node_id == *node_id)
    }

    /// Drop all connections for `node_id`; returns how many went away.
    pub fn remove(&self, node_id: &NodeId) -> usize {
        let mut entries = self.entries.lock().expect("client table lock");
        let before = entries.len();
        entries.retain(|p| p.node_id != *node_id);
        before - entries.len()
    }

    /// Drop the single entry owning `connection_id` (transport loss path).
    pub fn remove_connection(&self, connection_id: &NodeId) -> Option<PeerInfo> {
        let mut entries = self.entries.lock().expect("client table lock");
        let index = entries
            .iter()
            .position(|p| p.connection_id == *connection_id)?;
        entries.remove(index)
    }
}
