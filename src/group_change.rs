//! # Group-Change Handler
//!
//! Keeps closest-set knowledge flowing between neighbours. Two directions:
//!
//! - **Outbound**: peers that asked to mirror this node's closest ring are
//!   held in `update_subscribers`; whenever the ring changes they each get
//!   a fresh `ClosestNodesUpdate`.
//! - **Inbound**: when this node's own ring gains a member, it asks that
//!   peer (subscribe RPC) to start mirroring; arriving updates land in the
//!   group matrix through the routing table.
//!
//! Subscriber state has its own lock, acquired strictly after any routing
//! table access and never held across a network send.

use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::config::Config;
use crate::error::RoutingError;
use crate::id::{debug_id, NodeId};
use crate::messages::{decode_payload, rpcs, ClosestNodesUpdate, Message, SubscribeRequest};
use crate::network::{Network, Transport};
use crate::peer::{BasicPeer, PeerInfo};
use crate::routing_table::{ClosestNodesChange, RoutingTable};

pub struct GroupChangeHandler<T: Transport> {
    self_id: NodeId,
    config: Arc<Config>,
    routing: Arc<RoutingTable>,
    network: Arc<Network<T>>,
    update_subscribers: Mutex<Vec<PeerInfo>>,
}

impl<T: Transport> GroupChangeHandler<T> {
    pub fn new(
        self_id: NodeId,
        config: Arc<Config>,
        routing: Arc<RoutingTable>,
        network: Arc<Network<T>>,
    ) -> Self {
        Self {
            self_id,
            config,
            routing,
            network,
            update_subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.update_subscribers
            .lock()
            .expect("subscriber lock")
            .len()
    }

    pub fn is_subscriber(&self, peer: &NodeId) -> bool {
        self.update_subscribers
            .lock()
            .expect("subscriber lock")
            .iter()
            .any(|p| p.node_id == *peer)
    }

    /// Inbound `ClosestNodesUpdate`: mirror the reporting peer's closest
    /// set into the matrix, then chase any ring member we still know
    /// nothing about.
    pub async fn handle_update(&self, message: Message) -> Result<(), RoutingError> {
        if message.destination_id != Some(self.self_id) {
            return Err(RoutingError::MalformedMessage(
                "closest-set update addressed elsewhere".into(),
            ));
        }
        let update: ClosestNodesUpdate = decode_payload(&message.data)?;
        if update.node.is_zero() || update.nodes.is_empty() {
            return Err(RoutingError::MalformedMessage(
                "empty closest-set update".into(),
            ));
        }
        let reported: Vec<NodeId> = update
            .nodes
            .iter()
            .map(|p| p.node_id)
            .filter(|id| !id.is_zero())
            .collect();

        match self.routing.group_update_from_peer(update.node, reported) {
            Ok(()) => trace!(
                peer = %debug_id(&update.node),
                "mirrored closest set"
            ),
            Err(RoutingError::SelfConsistency { peer }) => {
                // Logged at the matrix; connection stays.
                return Err(RoutingError::SelfConsistency { peer });
            }
            Err(e) => {
                debug!(peer = %debug_id(&update.node), error = %e, "update not applied");
                return Err(e);
            }
        }

        // Any ring member that has never reported gets a subscribe request.
        self.chase_missing_reports().await;
        Ok(())
    }

    /// Ask every ring member this node has no closest-set report from to
    /// start mirroring. Safe to repeat; the peer defers until its own ring
    /// is worth sharing.
    pub async fn chase_missing_reports(&self) {
        for peer in self.nodes_needing_updates() {
            self.send_subscribe_rpc(&peer, true).await;
        }
    }

    /// Inbound subscribe/unsubscribe RPC from a peer.
    pub async fn handle_subscribe(&self, message: Message) -> Result<(), RoutingError> {
        if message.destination_id != Some(self.self_id) {
            return Err(RoutingError::MalformedMessage(
                "subscribe request addressed elsewhere".into(),
            ));
        }
        let request: SubscribeRequest = decode_payload(&message.data)?;
        if request.peer.is_zero() {
            return Err(RoutingError::MalformedMessage(
                "subscribe request without peer id".into(),
            ));
        }
        if request.subscribe {
            self.subscribe(request.peer).await;
        } else {
            self.unsubscribe(request.peer).await;
        }
        Ok(())
    }

    /// Add `peer` to the subscriber set and seed it with the current ring.
    ///
    /// Only connected peers can subscribe, and only once this node actually
    /// has a full ring worth sharing.
    pub async fn subscribe(&self, peer_id: NodeId) {
        let ring = self.routing.closest_ring();
        if ring.len() < self.config.closest_nodes_size {
            debug!(
                peer = %debug_id(&peer_id),
                ring = ring.len(),
                "ring too small to publish; subscribe deferred"
            );
            return;
        }
        let Some(peer) = self.routing.get_node_info(&peer_id) else {
            debug!(peer = %debug_id(&peer_id), "subscribe from unconnected peer ignored");
            return;
        };

        {
            let mut subscribers = self.update_subscribers.lock().expect("subscriber lock");
            if !subscribers.iter().any(|p| p.node_id == peer_id) {
                subscribers.push(peer.clone());
                trace!(
                    peer = %debug_id(&peer_id),
                    subscribers = subscribers.len(),
                    "subscribed"
                );
            }
        }

        let update = rpcs::closest_nodes_update(
            peer.node_id,
            self.self_id,
            ring.iter().map(BasicPeer::from).collect(),
            &self.config,
        );
        self.network
            .send_to_direct(&update, peer.node_id, peer.connection_id)
            .await;
    }

    /// Drop `peer` from the subscriber set and tell it to stop mirroring us.
    pub async fn unsubscribe(&self, peer_id: NodeId) {
        {
            let mut subscribers = self.update_subscribers.lock().expect("subscriber lock");
            subscribers.retain(|p| p.node_id != peer_id);
        }
        if let Some(peer) = self.routing.get_node_info(&peer_id) {
            self.send_subscribe_rpc(&peer, false).await;
        }
    }

    /// React to this node's own ring changing: push the new ring to every
    /// subscriber, start mirroring new members, stop mirroring lost ones.
    pub async fn on_closest_set_changed(&self, change: ClosestNodesChange) {
        self.send_closest_nodes_update_rpcs(&change.new).await;

        for gained in change
            .new
            .iter()
            .filter(|p| !change.old.iter().any(|o| o.node_id == p.node_id))
        {
            self.send_subscribe_rpc(gained, true).await;
        }

        for lost in change
            .old
            .iter()
            .filter(|p| !change.new.iter().any(|n| n.node_id == p.node_id))
        {
            {
                let mut subscribers = self.update_subscribers.lock().expect("subscriber lock");
                subscribers.retain(|p| p.node_id != lost.node_id);
            }
            if self.routing.is_connected(&lost.node_id) {
                self.send_subscribe_rpc(lost, false).await;
            }
        }
    }

    /// Push the given ring to every subscriber. Nothing is sent while the
    /// ring is still below its nominal size.
    pub async fn send_closest_nodes_update_rpcs(&self, closest: &[PeerInfo]) {
        if closest.len() < self.config.closest_nodes_size {
            return;
        }
        let subscribers: Vec<PeerInfo> = {
            self.update_subscribers
                .lock()
                .expect("subscriber lock")
                .clone()
        };
        if subscribers.is_empty() {
            return;
        }
        let nodes: Vec<BasicPeer> = closest.iter().map(BasicPeer::from).collect();
        debug!(
            subscribers = subscribers.len(),
            ring = nodes.len(),
            "publishing closest-set change"
        );
        for subscriber in subscribers {
            let update = rpcs::closest_nodes_update(
                subscriber.node_id,
                self.self_id,
                nodes.clone(),
                &self.config,
            );
            self.network
                .send_to_direct(&update, subscriber.node_id, subscriber.connection_id)
                .await;
        }
    }

    async fn send_subscribe_rpc(&self, peer: &PeerInfo, subscribe: bool) {
        trace!(
            peer = %debug_id(&peer.node_id),
            subscribe,
            "sending subscribe rpc"
        );
        let rpc =
            rpcs::closest_nodes_subscribe(peer.node_id, self.self_id, subscribe, &self.config);
        self.network
            .send_to_direct(&rpc, peer.node_id, peer.connection_id)
            .await;
    }

    /// Ring members that have never reported a closest set.
    fn nodes_needing_updates(&self) -> Vec<PeerInfo> {
        self.routing
            .closest_ring()
            .into_iter()
            .filter(|p| self.routing.matrix_freshness(&p.node_id).is_none())
            .collect()
    }

    /// Drop every subscriber (shutdown path).
    pub fn clear(&self) {
        self.update_subscribers
            .lock()
            .expect("subscriber lock")
            .clear();
    }
}
