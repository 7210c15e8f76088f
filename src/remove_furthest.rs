//! # Furthest-Node Removal Protocol
//!
//! When the routing table overflows, [`crate::routing_table::RoutingTable::add`]
//! swaps the newcomer in and hands back the evicted peer. The eviction is
//! then negotiated over the still-live connection: this node sends the
//! evicted peer a `Remove` request attesting that strictly closer peers
//! exist from its vantage; the peer validates against its own table and,
//! on acceptance, both sides tear the connection down.
//!
//! A cool-down bars the evicted pairing from re-admission for a while, so
//! two nodes at the boundary of each other's tables cannot flap in and out.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use lru::LruCache;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::RoutingError;
use crate::id::{closer_to_target, debug_id, NodeId};
use crate::messages::{
    decode_payload, encode_payload, rpcs, Message, RemoveRequest, RemoveResponse,
};
use crate::network::{Network, Transport};
use crate::peer::PeerInfo;
use crate::routing_table::RoutingTable;

/// Bounded history of recently evicted pairings.
const COOLDOWN_TRACKED_PEERS: usize = 128;

pub struct RemoveFurthest<T: Transport> {
    self_id: NodeId,
    config: Arc<Config>,
    routing: Arc<RoutingTable>,
    network: Arc<Network<T>>,
    cooldown: Mutex<LruCache<NodeId, Instant>>,
}

impl<T: Transport> RemoveFurthest<T> {
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
            cooldown: Mutex::new(LruCache::new(
                NonZeroUsize::new(COOLDOWN_TRACKED_PEERS).expect("cooldown capacity is non-zero"),
            )),
        }
    }

    /// True while `peer` is still barred from re-admission.
    pub fn in_cooldown(&self, peer: &NodeId) -> bool {
        let mut cooldown = self.cooldown.lock().expect("cooldown lock");
        match cooldown.get(peer) {
            Some(evicted_at) if evicted_at.elapsed() < self.config.removal_cooldown => true,
            Some(_) => {
                cooldown.pop(peer);
                false
            }
            None => false,
        }
    }

    fn bar(&self, peer: NodeId) {
        self.cooldown
            .lock()
            .expect("cooldown lock")
            .put(peer, Instant::now());
    }

    /// Open the protocol toward a peer the table just swapped out.
    pub async fn trigger_eviction(&self, evicted: PeerInfo) {
        self.bar(evicted.node_id);
        let closer_peers: Vec<NodeId> = self
            .routing
            .get_closest(&evicted.node_id, self.config.closest_nodes_size, &[], true, true)
            .into_iter()
            .map(|p| p.node_id)
            .collect();
        info!(
            peer = %debug_id(&evicted.node_id),
            attested = closer_peers.len(),
            "proposing eviction to displaced peer"
        );
        let request = rpcs::remove_request(
            evicted.node_id,
            self.self_id,
            &RemoveRequest {
                peer_to_remove: evicted.node_id,
                closer_peers,
            },
            &self.config,
        );
        self.network
            .send_to_direct(&request, evicted.node_id, evicted.connection_id)
            .await;
    }

    /// Validate an eviction proposal aimed at this node.
    ///
    /// The proposal is accepted only when the sender is still connected and
    /// every attested peer really is closer to the sender than this node.
    /// Anything else means the sender's view and ours have diverged, and
    /// the connection stays.
    pub async fn handle_request(&self, message: Message) -> Result<(), RoutingError> {
        let payload: RemoveRequest = decode_payload(&message.data)?;
        let sender_id = message
            .source_id
            .ok_or_else(|| RoutingError::MalformedMessage("remove request without source".into()))?;

        let Some(sender) = self.routing.get_node_info(&sender_id) else {
            debug!(
                peer = %debug_id(&sender_id),
                "eviction proposal from unconnected peer ignored"
            );
            return Ok(());
        };

        let accepted = payload.peer_to_remove == self.self_id
            && !payload.closer_peers.is_empty()
            && payload
                .closer_peers
                .iter()
                .all(|id| closer_to_target(id, &self.self_id, &sender_id));

        let mut response = message.clone();
        response.request = false;
        response.destination_id = Some(sender_id);
        response.source_id = Some(self.self_id);
        response.hops_to_live = self.config.hops_to_live;
        response.route_history.clear();
        response.data = encode_payload(&RemoveResponse { accepted });
        self.network
            .send_to_direct(&response, sender.node_id, sender.connection_id)
            .await;

        if accepted {
            info!(
                peer = %debug_id(&sender_id),
                "eviction accepted; dropping the pairing"
            );
            self.bar(sender_id);
            self.routing.remove(&sender_id);
            self.network.transport().remove(sender.connection_id).await;
        } else {
            warn!(
                peer = %debug_id(&sender_id),
                "eviction proposal inconsistent with local view; keeping connection"
            );
        }
        Ok(())
    }

    /// Close out a proposal this node opened.
    pub async fn handle_response(&self, message: Message) -> Result<(), RoutingError> {
        let payload: RemoveResponse = decode_payload(&message.data)?;
        let Some(peer) = message.source_id else {
            return Err(RoutingError::MalformedMessage(
                "remove response without source".into(),
            ));
        };
        if payload.accepted {
            debug!(peer = %debug_id(&peer), "displaced peer confirmed eviction");
            self.network.transport().remove(peer).await;
        } else {
            // The peer kept the connection; the table entry is already
            // gone here, so the pairing simply waits out its cool-down.
            debug!(peer = %debug_id(&peer), "displaced peer rejected eviction");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_table::ClientTable;
    use crate::id::ID_BYTES;
    use std::time::Duration;

    fn test_id(seed: u8) -> NodeId {
        NodeId::from_bytes([seed; ID_BYTES])
    }

    struct NullTransport;

    #[async_trait::async_trait]
    impl Transport for NullTransport {
        async fn bootstrap(
            &self,
            _endpoints: Vec<std::net::SocketAddr>,
            _is_vault: bool,
            _events: tokio::sync::mpsc::Sender<crate::network::TransportEvent>,
            _self_id: NodeId,
            _public_key: ed25519_dalek::VerifyingKey,
            _local_endpoint: Option<std::net::SocketAddr>,
        ) -> Option<NodeId> {
            None
        }

        async fn get_available_endpoint(
            &self,
            _peer: NodeId,
        ) -> anyhow::Result<(crate::network::EndpointPair, crate::peer::NatType)> {
            anyhow::bail!("unused")
        }

        async fn add(
            &self,
            _peer: NodeId,
            _peer_endpoints: crate::network::EndpointPair,
            _validation_data: Vec<u8>,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn mark_valid(
            &self,
            _peer: NodeId,
            _endpoint: std::net::SocketAddr,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn remove(&self, _peer: NodeId) {}

        async fn send(&self, _peer: NodeId, _bytes: Vec<u8>) -> crate::network::SendStatus {
            crate::network::SendStatus::Success
        }
    }

    fn harness(cooldown: Duration) -> RemoveFurthest<NullTransport> {
        let self_id = test_id(1);
        let config = Arc::new(Config::default().with_removal_cooldown(cooldown));
        let routing = Arc::new(RoutingTable::new(self_id, config.clone()));
        let clients = Arc::new(ClientTable::new(self_id, config.max_client_table_size));
        let network = Arc::new(Network::new(
            self_id,
            config.clone(),
            Arc::new(NullTransport),
            routing.clone(),
            clients,
        ));
        RemoveFurthest::new(self_id, config, routing, network)
    }

    #[tokio::test]
    async fn cooldown_bars_then_expires() {
        let rf = harness(Duration::from_millis(20));
        let peer = test_id(9);
        assert!(!rf.in_cooldown(&peer));

        rf.trigger_eviction(PeerInfo::new(peer, peer)).await;
        assert!(rf.in_cooldown(&peer));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!rf.in_cooldown(&peer));
    }

    #[tokio::test]
    async fn consistent_proposal_accepted() {
        let rf = harness(Duration::from_secs(30));
        let sender = test_id(0x20);
        rf.routing.add(PeerInfo::new(sender, sender));

        // From the sender's vantage, 0x21.. is closer to it than we are.
        let request = rpcs::remove_request(
            test_id(1),
            sender,
            &RemoveRequest {
                peer_to_remove: test_id(1),
                closer_peers: vec![test_id(0x21)],
            },
            &Config::default(),
        );
        rf.handle_request(request).await.unwrap();

        assert!(!rf.routing.is_connected(&sender), "pairing dropped");
        assert!(rf.in_cooldown(&sender));
    }

    #[tokio::test]
    async fn inconsistent_proposal_keeps_connection() {
        let rf = harness(Duration::from_secs(30));
        let sender = test_id(0x20);
        rf.routing.add(PeerInfo::new(sender, sender));

        // 0x70.. is further from the sender than we are: bogus attestation.
        let request = rpcs::remove_request(
            test_id(1),
            sender,
            &RemoveRequest {
                peer_to_remove: test_id(1),
                closer_peers: vec![test_id(0x70)],
            },
            &Config::default(),
        );
        rf.handle_request(request).await.unwrap();

        assert!(rf.routing.is_connected(&sender), "connection retained");
        assert!(!rf.in_cooldown(&sender));
    }
}
