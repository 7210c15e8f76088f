//! # Routing Table
//!
//! The bounded, proximity-ordered set of connected vault peers this node
//! forwards through. Entries are kept sorted by XOR distance from this
//! node's identifier, so the closest ring and the furthest candidate are
//! both O(1) away.
//!
//! ## Occupancy policy
//!
//! The table accepts unconditionally while below capacity. At capacity a
//! newcomer is admitted only if it improves the table:
//!
//! - its bucket (indexed by common leading bits against this node) is empty
//!   and some other bucket holds more than one peer, so the table rebalances
//!   by evicting the furthest member of the most-populated other bucket; or
//! - the newcomer is strictly closer to this node than the furthest current
//!   occupant of its own bucket, which it replaces.
//!
//! Either way [`RoutingTable::add`] performs the swap atomically under its
//! lock and hands the evicted peer back to the caller, which must complete
//! the eviction protocol over the transport before the pairing cools down.
//!
//! ## Group matrix
//!
//! The table owns the [`GroupMatrix`] so that peer departure and matrix
//! cleanup are a single critical section. Whenever the closest ring around
//! this node changes, an event is emitted for the group-change handler.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::RoutingError;
use crate::group_matrix::GroupMatrix;
use crate::id::{closer_to_target, debug_id, distance_cmp, NodeId};
use crate::peer::PeerInfo;

/// Emitted when the ring of closest peers around this node changes.
#[derive(Clone, Debug)]
pub struct ClosestNodesChange {
    pub old: Vec<PeerInfo>,
    pub new: Vec<PeerInfo>,
}

struct Inner {
    /// Sorted by XOR distance from `self_id`, closest first.
    nodes: Vec<PeerInfo>,
    matrix: GroupMatrix,
    change_tx: Option<mpsc::UnboundedSender<ClosestNodesChange>>,
}

pub struct RoutingTable {
    self_id: NodeId,
    config: Arc<Config>,
    inner: Mutex<Inner>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, config: Arc<Config>) -> Self {
        Self {
            self_id,
            config: config.clone(),
            inner: Mutex::new(Inner {
                nodes: Vec::with_capacity(config.max_routing_table_size),
                matrix: GroupMatrix::new(self_id),
                change_tx: None,
            }),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("routing table lock").nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wire up the closest-set change feed consumed by the group-change
    /// handler. At most one consumer.
    pub fn set_closest_change_notifier(&self, tx: mpsc::UnboundedSender<ClosestNodesChange>) {
        self.inner.lock().expect("routing table lock").change_tx = Some(tx);
    }

    /// Attempt insertion.
    ///
    /// Returns `(accepted, evicted)`. When `evicted` is some peer, it has
    /// already left the table and the caller owes it the removal protocol.
    pub fn add(&self, peer: PeerInfo) -> (bool, Option<PeerInfo>) {
        if peer.node_id == self.self_id
            || peer.node_id.is_zero()
            || peer.connection_id.is_zero()
            || peer.is_client
        {
            return (false, None);
        }

        let mut inner = self.inner.lock().expect("routing table lock");
        if inner
            .nodes
            .iter()
            .any(|p| p.node_id == peer.node_id || p.connection_id == peer.connection_id)
        {
            return (false, None);
        }

        let old_closest = self.closest_snapshot(&inner);
        let max = self.config.max_routing_table_size;

        let evicted = if inner.nodes.len() < max {
            None
        } else {
            match self.eviction_candidate(&inner, &peer.node_id) {
                Some(index) => {
                    let evicted = inner.nodes.remove(index);
                    inner.matrix.remove(&evicted.node_id);
                    Some(evicted)
                }
                None => return (false, None),
            }
        };

        let node_id = peer.node_id;
        self.insert_sorted(&mut inner, peer);
        trace!(
            peer = %debug_id(&node_id),
            size = inner.nodes.len(),
            evicted = ?evicted.as_ref().map(|p| debug_id(&p.node_id)),
            "routing table admit"
        );
        self.emit_change(&mut inner, old_closest);
        (true, evicted)
    }

    /// Whether [`RoutingTable::add`] would currently accept `candidate`.
    pub fn check_node(&self, candidate: &NodeId) -> bool {
        if *candidate == self.self_id || candidate.is_zero() {
            return false;
        }
        let inner = self.inner.lock().expect("routing table lock");
        if inner.nodes.iter().any(|p| p.node_id == *candidate) {
            return false;
        }
        inner.nodes.len() < self.config.max_routing_table_size
            || self.eviction_candidate(&inner, candidate).is_some()
    }

    pub fn remove(&self, node_id: &NodeId) -> Option<PeerInfo> {
        let mut inner = self.inner.lock().expect("routing table lock");
        let index = inner.nodes.iter().position(|p| p.node_id == *node_id)?;
        let old_closest = self.closest_snapshot(&inner);
        let removed = inner.nodes.remove(index);
        inner.matrix.remove(&removed.node_id);
        debug!(
            peer = %debug_id(node_id),
            size = inner.nodes.len(),
            "routing table drop"
        );
        self.emit_change(&mut inner, old_closest);
        Some(removed)
    }

    /// Remove whichever entry owns `connection_id` (transport loss path).
    pub fn remove_connection(&self, connection_id: &NodeId) -> Option<PeerInfo> {
        let node_id = {
            let inner = self.inner.lock().expect("routing table lock");
            inner
                .nodes
                .iter()
                .find(|p| p.connection_id == *connection_id)
                .map(|p| p.node_id)?
        };
        self.remove(&node_id)
    }

    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.inner
            .lock()
            .expect("routing table lock")
            .nodes
            .iter()
            .any(|p| p.node_id == *node_id)
    }

    pub fn get_node_info(&self, node_id: &NodeId) -> Option<PeerInfo> {
        self.inner
            .lock()
            .expect("routing table lock")
            .nodes
            .iter()
            .find(|p| p.node_id == *node_id)
            .cloned()
    }

    pub fn update_rank(&self, node_id: &NodeId, rank: i32) {
        let mut inner = self.inner.lock().expect("routing table lock");
        if let Some(peer) = inner.nodes.iter_mut().find(|p| p.node_id == *node_id) {
            peer.rank = rank;
        }
    }

    /// The `k` peers closest to `target`, strictly sorted by XOR distance.
    ///
    /// `exclude` drops named ids (route-history loop avoidance),
    /// `ignore_exact_match` drops a peer whose id equals the target, and
    /// `vault_only` drops client entries.
    pub fn get_closest(
        &self,
        target: &NodeId,
        k: usize,
        exclude: &[NodeId],
        ignore_exact_match: bool,
        vault_only: bool,
    ) -> Vec<PeerInfo> {
        let inner = self.inner.lock().expect("routing table lock");
        let mut candidates: Vec<PeerInfo> = inner
            .nodes
            .iter()
            .filter(|p| !(ignore_exact_match && p.node_id == *target))
            .filter(|p| !exclude.contains(&p.node_id))
            .filter(|p| !(vault_only && p.is_client))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            distance_cmp(&a.node_id.xor_distance(target), &b.node_id.xor_distance(target))
        });
        candidates.truncate(k);
        candidates
    }

    /// Next-hop selection for forwarding: the single closest vault peer,
    /// skipping the excluded prior hops.
    pub fn closest_peer(
        &self,
        target: &NodeId,
        exclude: &[NodeId],
        ignore_exact_match: bool,
    ) -> Option<PeerInfo> {
        self.get_closest(target, 1, exclude, ignore_exact_match, true)
            .into_iter()
            .next()
    }

    /// True when no table entry is strictly closer to `target` than this
    /// node. An empty table means this node is trivially closest.
    pub fn is_this_node_closest_to(&self, target: &NodeId, ignore_exact_match: bool) -> bool {
        let inner = self.inner.lock().expect("routing table lock");
        !inner.nodes.iter().any(|p| {
            !(ignore_exact_match && p.node_id == *target)
                && closer_to_target(&p.node_id, &self.self_id, target)
        })
    }

    /// True when this node ranks within the `k` closest identifiers to
    /// `target` among itself and the table.
    pub fn is_this_node_in_range(&self, target: &NodeId, k: usize) -> bool {
        let inner = self.inner.lock().expect("routing table lock");
        if inner.nodes.len() < k {
            return true;
        }
        let closer = inner
            .nodes
            .iter()
            .filter(|p| closer_to_target(&p.node_id, &self.self_id, target))
            .count();
        closer < k
    }

    /// Group-leadership decision over the matrix-augmented view.
    ///
    /// `None`: this node is the strictly closest known holder of `target`
    /// and leads the group. `Some(peer)`: the named connected peer should
    /// receive the forward instead.
    pub fn group_leader(&self, target: &NodeId) -> Option<PeerInfo> {
        let inner = self.inner.lock().expect("routing table lock");
        let table_ids: Vec<NodeId> = inner.nodes.iter().map(|p| p.node_id).collect();
        inner.matrix.closest_known(target, table_ids)?;
        // A closer id exists somewhere; hand the message to the connected
        // peer nearest the target. Matrix-only ids are unreachable directly,
        // and the target itself fans out at its neighbour, not at itself.
        let forward = inner
            .nodes
            .iter()
            .filter(|p| !p.is_client && p.node_id != *target)
            .min_by(|a, b| {
                distance_cmp(&a.node_id.xor_distance(target), &b.node_id.xor_distance(target))
            })
            .cloned();
        forward
    }

    /// True when this node is in the replication group of `target`, judged
    /// over everything the matrix knows.
    pub fn is_in_group_range(&self, target: &NodeId, group_size: usize) -> bool {
        let inner = self.inner.lock().expect("routing table lock");
        let table_ids: Vec<NodeId> = inner.nodes.iter().map(|p| p.node_id).collect();
        inner.matrix.is_node_in_group(target, group_size, table_ids)
    }

    /// Apply a peer's closest-set report to the matrix.
    pub fn group_update_from_peer(
        &self,
        peer: NodeId,
        closest: Vec<NodeId>,
    ) -> Result<(), RoutingError> {
        let mut inner = self.inner.lock().expect("routing table lock");
        if !inner.nodes.iter().any(|p| p.node_id == peer) {
            return Err(RoutingError::MalformedMessage(
                "closest-set report from unconnected peer".into(),
            ));
        }
        inner
            .matrix
            .update(peer, closest.clone(), self.config.closest_nodes_size)?;
        if let Some(entry) = inner.nodes.iter_mut().find(|p| p.node_id == peer) {
            entry.dimension_list = closest;
        }
        Ok(())
    }

    /// Matrix freshness for a peer, if it has ever reported.
    pub fn matrix_freshness(&self, peer: &NodeId) -> Option<std::time::Instant> {
        self.inner
            .lock()
            .expect("routing table lock")
            .matrix
            .freshness(peer)
    }

    /// The current ring of closest peers around this node.
    pub fn closest_ring(&self) -> Vec<PeerInfo> {
        let inner = self.inner.lock().expect("routing table lock");
        self.closest_snapshot(&inner)
    }

    pub fn furthest(&self) -> Option<PeerInfo> {
        self.inner
            .lock()
            .expect("routing table lock")
            .nodes
            .last()
            .cloned()
    }

    // -- internals ---------------------------------------------------------

    fn insert_sorted(&self, inner: &mut Inner, peer: PeerInfo) {
        let dist = peer.node_id.xor_distance(&self.self_id);
        let index = inner
            .nodes
            .partition_point(|p| {
                distance_cmp(&p.node_id.xor_distance(&self.self_id), &dist)
                    == std::cmp::Ordering::Less
            });
        inner.nodes.insert(index, peer);
    }

    fn closest_snapshot(&self, inner: &Inner) -> Vec<PeerInfo> {
        inner
            .nodes
            .iter()
            .take(self.config.closest_nodes_size)
            .cloned()
            .collect()
    }

    fn emit_change(&self, inner: &mut Inner, old_closest: Vec<PeerInfo>) {
        let new_closest = self.closest_snapshot(inner);
        let changed = old_closest.len() != new_closest.len()
            || old_closest
                .iter()
                .zip(new_closest.iter())
                .any(|(a, b)| a.node_id != b.node_id);
        if !changed {
            return;
        }
        if let Some(tx) = &inner.change_tx {
            let _ = tx.send(ClosestNodesChange {
                old: old_closest,
                new: new_closest,
            });
        }
    }

    /// Index of the entry the occupancy policy would evict for `candidate`,
    /// or `None` when the candidate does not improve the table.
    fn eviction_candidate(&self, inner: &Inner, candidate: &NodeId) -> Option<usize> {
        let candidate_bucket = self.self_id.common_leading_bits(candidate);

        let occupants: Vec<usize> = inner
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, p)| self.self_id.common_leading_bits(&p.node_id) == candidate_bucket)
            .map(|(i, _)| i)
            .collect();

        if occupants.is_empty() {
            // Rebalance: free a slot from the most-populated other bucket,
            // provided it holds more than one peer.
            let mut best_bucket: Option<(u16, usize)> = None;
            for peer in &inner.nodes {
                let bucket = self.self_id.common_leading_bits(&peer.node_id);
                let count = inner
                    .nodes
                    .iter()
                    .filter(|p| self.self_id.common_leading_bits(&p.node_id) == bucket)
                    .count();
                match best_bucket {
                    Some((_, best_count)) if count <= best_count => {}
                    _ => best_bucket = Some((bucket, count)),
                }
            }
            let (bucket, count) = best_bucket?;
            if count <= 1 {
                return None;
            }
            // Furthest member of that bucket (nodes are distance-sorted, so
            // the highest index within the bucket is the furthest).
            inner
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, p)| self.self_id.common_leading_bits(&p.node_id) == bucket)
                .map(|(i, _)| i)
                .max()
        } else {
            // Same-bucket replacement: only if strictly closer to this node
            // than the bucket's furthest occupant.
            let furthest = *occupants.last()?;
            if closer_to_target(candidate, &inner.nodes[furthest].node_id, &self.self_id) {
                Some(furthest)
            } else {
                None
            }
        }
    }
}
