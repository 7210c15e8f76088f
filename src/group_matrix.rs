//! # Group Matrix
//!
//! Each routing-table peer periodically reports its own closest set. The
//! matrix mirrors those reports, giving this node a two-hop view of the
//! neighbourhood around its position in the identifier space. Group
//! membership and group leadership questions are answered against the union
//! of everything the matrix knows plus the routing table itself.
//!
//! The matrix is intentionally subordinate to the routing table: entries
//! exist only for connected peers and die with the connection. It is held
//! under the same lock as the table, so the two can never disagree about
//! which peers exist.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use tracing::warn;

use crate::error::RoutingError;
use crate::id::{closer_to_target, debug_id, distance_cmp, NodeId};

struct MatrixEntry {
    closest: Vec<NodeId>,
    refreshed_at: Instant,
}

pub struct GroupMatrix {
    self_id: NodeId,
    entries: HashMap<NodeId, MatrixEntry>,
}

impl GroupMatrix {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, peer: &NodeId) -> bool {
        self.entries.contains_key(peer)
    }

    /// Replace `peer`'s reported closest set.
    ///
    /// A report that conflicts with provable local knowledge (duplicate
    /// ids, zero ids, a list wider than the protocol allows, or a peer
    /// listing itself) is refused and the previous entry kept.
    pub fn update(
        &mut self,
        peer: NodeId,
        closest: Vec<NodeId>,
        closest_nodes_size: usize,
    ) -> Result<(), RoutingError> {
        let inconsistent = closest.len() > closest_nodes_size
            || closest.iter().any(|id| id.is_zero() || *id == peer)
            || has_duplicates(&closest);
        if inconsistent {
            warn!(
                peer = %debug_id(&peer),
                claimed = closest.len(),
                "refusing inconsistent closest-set report"
            );
            return Err(RoutingError::SelfConsistency { peer });
        }
        self.entries.insert(
            peer,
            MatrixEntry {
                closest,
                refreshed_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Drop the entry for a departed peer.
    pub fn remove(&mut self, peer: &NodeId) {
        self.entries.remove(peer);
    }

    /// Age of the freshest data held for `peer`.
    pub fn freshness(&self, peer: &NodeId) -> Option<Instant> {
        self.entries.get(peer).map(|e| e.refreshed_at)
    }

    /// All unique identifiers this node can reason about: itself, the
    /// routing table, and every id reported through the matrix.
    pub fn unique_ids<I: IntoIterator<Item = NodeId>>(&self, table_ids: I) -> Vec<NodeId> {
        let mut ids: BTreeSet<NodeId> = BTreeSet::new();
        ids.insert(self.self_id);
        ids.extend(table_ids);
        for (peer, entry) in &self.entries {
            ids.insert(*peer);
            ids.extend(entry.closest.iter().copied());
        }
        ids.into_iter().collect()
    }

    /// True when this node sits among the `group_size` closest known holders
    /// of `target`, judged over the full unique-id set.
    pub fn is_node_in_group<I: IntoIterator<Item = NodeId>>(
        &self,
        target: &NodeId,
        group_size: usize,
        table_ids: I,
    ) -> bool {
        let mut ids = self.unique_ids(table_ids);
        ids.sort_by(|a, b| distance_cmp(&a.xor_distance(target), &b.xor_distance(target)));
        ids.iter().take(group_size).any(|id| *id == self.self_id)
    }

    /// The single closest known holder of `target` over the unique-id set,
    /// or `None` when nothing beats this node. The target itself never
    /// counts as its own holder; a group fans out around it.
    pub fn closest_known<I: IntoIterator<Item = NodeId>>(
        &self,
        target: &NodeId,
        table_ids: I,
    ) -> Option<NodeId> {
        let ids = self.unique_ids(table_ids);
        let best = ids
            .into_iter()
            .filter(|id| id != target)
            .min_by(|a, b| distance_cmp(&a.xor_distance(target), &b.xor_distance(target)))?;
        if best == self.self_id || !closer_to_target(&best, &self.self_id, target) {
            None
        } else {
            Some(best)
        }
    }
}

fn has_duplicates(ids: &[NodeId]) -> bool {
    let mut seen: BTreeSet<&NodeId> = BTreeSet::new();
    !ids.iter().all(|id| seen.insert(id))
}
