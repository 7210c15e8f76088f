//! # Routing Services
//!
//! Request servicing and response handling for the routing-type RPCs the
//! dispatcher hands inward: liveness pings, closest-node queries, and the
//! connect handshake that is the only path into the routing and client
//! tables.
//!
//! ## Connect handshake
//!
//! ```text
//! A                                   B
//! | -- Connect {A endpoints} ------>  |  capacity check, transport.add(A)
//! | <------ Connect response {B} --  |
//! | transport.add(B)                  |
//! | -- ConnectSuccess (direct) ---->  |  mark_valid, table insert
//! | <---- ConnectSuccessAck -------  |
//! | mark_valid, table insert          |
//! ```
//!
//! Entries enter the tables only after the transport has confirmed both
//! directions, so a table entry always names a live connection. Inserting
//! past capacity hands the displaced peer to the furthest-node removal
//! protocol.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::client_table::ClientTable;
use crate::config::Config;
use crate::error::RoutingError;
use crate::id::{debug_id, NodeId};
use crate::messages::{
    decode_payload, encode_payload, rpcs, ConnectConfirm, ConnectRequest, ConnectResponse,
    FindNodesRequest, FindNodesResponse, Message,
};
use crate::network::{Network, Transport};
use crate::peer::PeerInfo;
use crate::remove_furthest::RemoveFurthest;
use crate::routing_table::RoutingTable;

pub struct Service<T: Transport> {
    self_id: NodeId,
    config: Arc<Config>,
    routing: Arc<RoutingTable>,
    clients: Arc<ClientTable>,
    network: Arc<Network<T>>,
    remove_furthest: Arc<RemoveFurthest<T>>,
}

impl<T: Transport> Service<T> {
    pub fn new(
        self_id: NodeId,
        config: Arc<Config>,
        routing: Arc<RoutingTable>,
        clients: Arc<ClientTable>,
        network: Arc<Network<T>>,
        remove_furthest: Arc<RemoveFurthest<T>>,
    ) -> Self {
        Self {
            self_id,
            config,
            routing,
            clients,
            network,
            remove_furthest,
        }
    }

    /// Response skeleton mirroring a request's addressing. Relay-mode
    /// requests get their destination cleared so the return path routes by
    /// relay id.
    fn make_response(&self, request: &Message, data: Vec<u8>) -> Message {
        let mut response = request.clone();
        response.request = false;
        response.direct = true;
        response.hops_to_live = self.config.hops_to_live;
        response.route_history.clear();
        response.visited = false;
        response.destination_id = request.source_id;
        response.source_id = Some(self.self_id);
        response.data = data;
        response
    }

    // -- ping ---------------------------------------------------------------

    pub fn ping(&self, request: &Message) -> Option<Message> {
        trace!(
            from = ?request.source_id.as_ref().map(debug_id),
            id = request.id,
            "pong"
        );
        Some(self.make_response(request, Vec::new()))
    }

    pub fn ping_response(&self, response: &Message) {
        if let Some(peer) = &response.source_id {
            // Liveness proof: bump the peer's standing.
            if let Some(info) = self.routing.get_node_info(peer) {
                self.routing.update_rank(peer, info.rank.saturating_add(1));
            }
        }
    }

    // -- find-nodes ---------------------------------------------------------

    pub fn find_nodes(&self, request: &Message) -> Result<Option<Message>, RoutingError> {
        let query: FindNodesRequest = decode_payload(&request.data)?;
        let count = query.count.clamp(1, self.config.max_routing_table_size);

        // The target itself is never a useful answer to its own query.
        let mut nodes: Vec<NodeId> = self
            .routing
            .get_closest(&query.target, count, &[], true, true)
            .into_iter()
            .map(|p| p.node_id)
            .collect();
        // This node is a candidate holder too.
        nodes.push(self.self_id);
        nodes.sort_by(|a, b| {
            crate::id::distance_cmp(&a.xor_distance(&query.target), &b.xor_distance(&query.target))
        });
        nodes.truncate(count);

        trace!(
            target = %debug_id(&query.target),
            returned = nodes.len(),
            "answering closest-node query"
        );
        Ok(Some(
            self.make_response(request, encode_payload(&FindNodesResponse { nodes })),
        ))
    }

    /// A closest-node answer came back: court every listed peer we could
    /// still use.
    pub async fn find_nodes_response(&self, response: &Message) -> Result<(), RoutingError> {
        let answer: FindNodesResponse = decode_payload(&response.data)?;
        for node in answer.nodes {
            if node == self.self_id
                || node.is_zero()
                || self.routing.is_connected(&node)
                || self.remove_furthest.in_cooldown(&node)
                || !self.routing.check_node(&node)
            {
                continue;
            }
            self.initiate_connect(node).await;
        }
        Ok(())
    }

    /// Open the handshake toward `peer`, routed through the overlay.
    pub async fn initiate_connect(&self, peer: NodeId) {
        let (endpoints, nat_type) = match self.network.transport().get_available_endpoint(peer).await
        {
            Ok(pair) => pair,
            Err(e) => {
                debug!(peer = %debug_id(&peer), error = %e, "no endpoint to offer");
                return;
            }
        };
        let (from, relay) = if self.routing.is_empty() {
            // Not yet routed: ask via the bootstrap relay, answering back
            // over this node's own connection identity.
            (None, Some((self.self_id, self.self_id)))
        } else {
            (Some(self.self_id), None)
        };
        let request = rpcs::connect_request(
            peer,
            from,
            relay,
            &ConnectRequest {
                endpoints,
                nat_type,
                is_client: self.config.client_mode,
            },
            &self.config,
        );
        debug!(peer = %debug_id(&peer), "initiating connect");
        if self.routing.is_empty() {
            if let Some(bootstrap) = self.network.bootstrap_connection() {
                self.network.send_to_direct(&request, bootstrap, bootstrap).await;
                return;
            }
        }
        if let Err(e) = self.network.send_to_closest(request).await {
            debug!(peer = %debug_id(&peer), error = %e, "connect request not routable");
        }
    }

    /// Service an inbound connect request.
    pub async fn connect(&self, request: &Message) -> Result<Option<Message>, RoutingError> {
        let offer: ConnectRequest = decode_payload(&request.data)?;
        // Routed requesters name themselves; relay-mode requesters are
        // identified by their relay id.
        let Some(peer) = request.source_id.or(request.relay_id) else {
            return Err(RoutingError::MalformedMessage(
                "connect request without requester id".into(),
            ));
        };

        let accepted = if offer.is_client {
            !self.config.client_mode
        } else {
            !self.remove_furthest.in_cooldown(&peer) && self.routing.check_node(&peer)
        };

        if !accepted {
            debug!(peer = %debug_id(&peer), "refusing connect");
            let refusal = ConnectResponse {
                endpoints: offer.endpoints,
                connection_id: self.self_id,
                accepted: false,
            };
            return Ok(Some(self.make_response(request, encode_payload(&refusal))));
        }

        let (our_endpoints, _nat) = self
            .network
            .transport()
            .get_available_endpoint(peer)
            .await
            .map_err(|e| RoutingError::MalformedMessage(format!("no local endpoint: {e}")))?;
        if let Err(e) = self
            .network
            .transport()
            .add(peer, offer.endpoints, self.self_id.as_bytes().to_vec())
            .await
        {
            warn!(peer = %debug_id(&peer), error = %e, "transport refused connection");
            return Ok(None);
        }

        info!(peer = %debug_id(&peer), client = offer.is_client, "accepted connect");
        let acceptance = ConnectResponse {
            endpoints: our_endpoints,
            connection_id: self.self_id,
            accepted: true,
        };
        Ok(Some(
            self.make_response(request, encode_payload(&acceptance)),
        ))
    }

    /// The peer we courted answered.
    pub async fn connect_response(&self, response: &Message) -> Result<(), RoutingError> {
        let answer: ConnectResponse = decode_payload(&response.data)?;
        let Some(peer) = response.source_id else {
            return Err(RoutingError::MalformedMessage(
                "connect response without source".into(),
            ));
        };
        if !answer.accepted {
            debug!(peer = %debug_id(&peer), "connect refused by peer");
            return Ok(());
        }
        if let Err(e) = self
            .network
            .transport()
            .add(peer, answer.endpoints, self.self_id.as_bytes().to_vec())
            .await
        {
            warn!(peer = %debug_id(&peer), error = %e, "transport refused connection");
            return Ok(());
        }
        // Transport path exists in both directions now; confirm over it.
        let confirm = rpcs::connect_success(
            peer,
            self.self_id,
            &ConnectConfirm {
                node_id: self.self_id,
                connection_id: self.self_id,
                is_client: self.config.client_mode,
            },
            &self.config,
        );
        self.network
            .send_to_direct(&confirm, peer, answer.connection_id)
            .await;
        Ok(())
    }

    /// First direct frame over the fresh connection: promote it and admit
    /// the peer to a table, acknowledging so the other side does the same.
    pub async fn connect_success(&self, message: &Message) -> Result<(), RoutingError> {
        let confirm: ConnectConfirm = decode_payload(&message.data)?;
        if confirm.node_id.is_zero() || confirm.connection_id.is_zero() {
            return Err(RoutingError::MalformedMessage(
                "connect confirmation without identifiers".into(),
            ));
        }
        self.admit(&confirm).await;

        let ack = rpcs::connect_success_ack(
            confirm.node_id,
            self.self_id,
            &ConnectConfirm {
                node_id: self.self_id,
                connection_id: self.self_id,
                is_client: self.config.client_mode,
            },
            &self.config,
        );
        self.network
            .send_to_direct(&ack, confirm.node_id, confirm.connection_id)
            .await;
        Ok(())
    }

    /// Handshake complete on the initiating side.
    pub async fn connect_success_ack(&self, message: &Message) -> Result<(), RoutingError> {
        let confirm: ConnectConfirm = decode_payload(&message.data)?;
        if confirm.node_id.is_zero() || confirm.connection_id.is_zero() {
            return Err(RoutingError::MalformedMessage(
                "connect acknowledgement without identifiers".into(),
            ));
        }
        self.admit(&confirm).await;
        Ok(())
    }

    async fn admit(&self, confirm: &ConnectConfirm) {
        if let Ok((endpoints, _)) = self
            .network
            .transport()
            .get_available_endpoint(confirm.node_id)
            .await
        {
            let _ = self
                .network
                .transport()
                .mark_valid(confirm.node_id, endpoints.external)
                .await;
        }

        if confirm.is_client {
            let entry = PeerInfo::client(confirm.node_id, confirm.connection_id);
            if self.clients.add(entry) {
                info!(peer = %debug_id(&confirm.node_id), "client connection admitted");
            }
            return;
        }

        let entry = PeerInfo::new(confirm.node_id, confirm.connection_id);
        let (accepted, evicted) = self.routing.add(entry);
        if accepted {
            info!(
                peer = %debug_id(&confirm.node_id),
                table_size = self.routing.len(),
                "routing peer admitted"
            );
        }
        if let Some(displaced) = evicted {
            self.remove_furthest.trigger_eviction(displaced).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ID_BYTES;
    use crate::network::{EndpointPair, SendStatus, TransportEvent};
    use crate::peer::NatType;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    fn test_id(seed: u8) -> NodeId {
        NodeId::from_bytes([seed; ID_BYTES])
    }

    #[derive(Default)]
    struct FakeTransport {
        added: StdMutex<Vec<NodeId>>,
        validated: StdMutex<Vec<NodeId>>,
        sent: StdMutex<Vec<(NodeId, Message)>>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn bootstrap(
            &self,
            _endpoints: Vec<std::net::SocketAddr>,
            _is_vault: bool,
            _events: tokio::sync::mpsc::Sender<TransportEvent>,
            _self_id: NodeId,
            _public_key: ed25519_dalek::VerifyingKey,
            _local_endpoint: Option<std::net::SocketAddr>,
        ) -> Option<NodeId> {
            None
        }

        async fn get_available_endpoint(
            &self,
            _peer: NodeId,
        ) -> anyhow::Result<(EndpointPair, NatType)> {
            Ok((
                EndpointPair::symmetric("127.0.0.1:7000".parse().unwrap()),
                NatType::Other,
            ))
        }

        async fn add(
            &self,
            peer: NodeId,
            _peer_endpoints: EndpointPair,
            _validation_data: Vec<u8>,
        ) -> anyhow::Result<()> {
            self.added.lock().unwrap().push(peer);
            Ok(())
        }

        async fn mark_valid(
            &self,
            peer: NodeId,
            _endpoint: std::net::SocketAddr,
        ) -> anyhow::Result<()> {
            self.validated.lock().unwrap().push(peer);
            Ok(())
        }

        async fn remove(&self, _peer: NodeId) {}

        async fn send(&self, peer: NodeId, bytes: Vec<u8>) -> SendStatus {
            let message = crate::messages::deserialize_message(&bytes).unwrap();
            self.sent.lock().unwrap().push((peer, message));
            SendStatus::Success
        }
    }

    struct Harness {
        service: Service<FakeTransport>,
        routing: Arc<RoutingTable>,
        transport: Arc<FakeTransport>,
    }

    fn harness(self_seed: u8) -> Harness {
        let self_id = test_id(self_seed);
        let config = Arc::new(Config::default());
        let transport = Arc::new(FakeTransport::default());
        let routing = Arc::new(RoutingTable::new(self_id, config.clone()));
        let clients = Arc::new(ClientTable::new(self_id, config.max_client_table_size));
        let network = Arc::new(Network::new(
            self_id,
            config.clone(),
            transport.clone(),
            routing.clone(),
            clients.clone(),
        ));
        let remove_furthest = Arc::new(RemoveFurthest::new(
            self_id,
            config.clone(),
            routing.clone(),
            network.clone(),
        ));
        Harness {
            service: Service::new(
                self_id,
                config,
                routing.clone(),
                clients,
                network,
                remove_furthest,
            ),
            routing,
            transport,
        }
    }

    #[test]
    fn ping_echoes_request_id() {
        let h = harness(1);
        let request = rpcs::ping_request(test_id(1), test_id(2), &Config::default());
        let response = h.service.ping(&request).unwrap();
        assert!(response.is_response());
        assert_eq!(response.id, request.id);
        assert_eq!(response.destination_id, Some(test_id(2)));
        assert_eq!(response.source_id, Some(test_id(1)));
    }

    #[test]
    fn find_nodes_includes_self_and_sorts() {
        let h = harness(0x7f);
        for seed in [0x01u8, 0x03, 0x70] {
            h.routing.add(PeerInfo::new(test_id(seed), test_id(seed)));
        }
        let request = rpcs::find_nodes_request(
            test_id(0x02),
            Some(test_id(9)),
            None,
            3,
            &Config::default(),
        );
        let response = h.service.find_nodes(&request).unwrap().unwrap();
        let answer: FindNodesResponse = decode_payload(&response.data).unwrap();
        assert_eq!(answer.nodes.len(), 3);
        assert_eq!(answer.nodes[0], test_id(0x03), "exact-side neighbour first");
        // Strictly sorted toward the target.
        let target = test_id(0x02);
        for pair in answer.nodes.windows(2) {
            assert!(crate::id::closer_to_target(&pair[0], &pair[1], &target));
        }
    }

    #[tokio::test]
    async fn find_nodes_response_courts_usable_peers() {
        let h = harness(1);
        let answer = FindNodesResponse {
            nodes: vec![test_id(1), test_id(0x30), NodeId::ZERO],
        };
        let mut response = rpcs::find_nodes_request(
            test_id(1),
            Some(test_id(0x30)),
            None,
            4,
            &Config::default(),
        );
        response.request = false;
        response.data = encode_payload(&answer);

        h.service.find_nodes_response(&response).await.unwrap();

        // With no bootstrap and an empty table the courtship aborts before
        // anything reaches the transport; self and zero ids never get that far.
        assert!(h.transport.sent.lock().unwrap().is_empty());
        assert!(h.transport.added.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn connect_request_is_serviced_with_transport_add() {
        let h = harness(1);
        let requester = test_id(0x40);
        let offer = ConnectRequest {
            endpoints: EndpointPair::symmetric("127.0.0.1:7100".parse().unwrap()),
            nat_type: NatType::Other,
            is_client: false,
        };
        let request = rpcs::connect_request(
            test_id(1),
            Some(requester),
            None,
            &offer,
            &Config::default(),
        );

        let response = h.service.connect(&request).await.unwrap().unwrap();
        let answer: ConnectResponse = decode_payload(&response.data).unwrap();
        assert!(answer.accepted);
        assert_eq!(h.transport.added.lock().unwrap().as_slice(), &[requester]);
    }

    #[tokio::test]
    async fn cooled_down_peer_is_refused() {
        let h = harness(1);
        let requester = test_id(0x40);
        h.service
            .remove_furthest
            .trigger_eviction(PeerInfo::new(requester, requester))
            .await;

        let offer = ConnectRequest {
            endpoints: EndpointPair::symmetric("127.0.0.1:7100".parse().unwrap()),
            nat_type: NatType::Other,
            is_client: false,
        };
        let request = rpcs::connect_request(
            test_id(1),
            Some(requester),
            None,
            &offer,
            &Config::default(),
        );
        let response = h.service.connect(&request).await.unwrap().unwrap();
        let answer: ConnectResponse = decode_payload(&response.data).unwrap();
        assert!(!answer.accepted);
    }

    #[tokio::test]
    async fn handshake_confirmation_admits_peer() {
        let h = harness(1);
        let peer = test_id(0x40);
        let message = rpcs::connect_success(
            test_id(1),
            peer,
            &ConnectConfirm {
                node_id: peer,
                connection_id: peer,
                is_client: false,
            },
            &Config::default(),
        );
        h.service.connect_success(&message).await.unwrap();

        assert!(h.routing.is_connected(&peer));
        assert!(h.transport.validated.lock().unwrap().contains(&peer));
        // Acknowledgement went back over the new connection.
        let sent = h.transport.sent.lock().unwrap().clone();
        assert!(sent
            .iter()
            .any(|(to, m)| *to == peer
                && m.msg_type == crate::messages::MessageType::ConnectSuccessAck));
    }

    #[tokio::test]
    async fn client_confirmation_lands_in_client_table() {
        let h = harness(1);
        let peer = test_id(0x50);
        let message = rpcs::connect_success(
            test_id(1),
            peer,
            &ConnectConfirm {
                node_id: peer,
                connection_id: peer,
                is_client: true,
            },
            &Config::default(),
        );
        h.service.connect_success(&message).await.unwrap();
        assert!(!h.routing.is_connected(&peer));
        assert!(h.service.clients.is_connected(&peer));
    }
}
