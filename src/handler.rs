//! # Message Handler
//!
//! State-free dispatcher for every inbound frame. Each message is
//! classified exactly once into: deliver locally, forward to the closest
//! peer, replicate across a group, or relay for a not-yet-routed peer.
//!
//! ## Dispatch order
//!
//! 1. Structural validation, then the hop allowance is spent.
//! 2. Group request to this node's own id → forwarded out so it fans out
//!    at the first peer that can see the whole group.
//! 3. Client mode short-circuits: only routing traffic and own deliveries.
//! 4. Source-less messages are relay-mode requests.
//! 5. Destination equal to this node → local routing service or
//!    application delivery (a captured reply handle routes the response,
//!    including back through a relay).
//! 6. Direct client-table destinations.
//! 7. Everything else splits on proximity: closest-node handling (with
//!    group fan-out at the leader) or plain forwarding with the
//!    visited-bit flip.
//!
//! Delivered application messages arrive on a channel as
//! [`ReceivedMessage`]; a request carries a one-shot reply sender whose
//! payload is routed back automatically.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::client_table::ClientTable;
use crate::config::Config;
use crate::error::RoutingError;
use crate::group_change::GroupChangeHandler;
use crate::id::{debug_id, NodeId};
use crate::messages::{deserialize_message, Message, MessageType};
use crate::network::{Network, Transport};
use crate::remove_furthest::RemoveFurthest;
use crate::routing_table::RoutingTable;
use crate::service::Service;
use crate::timer::Timer;

/// Application-level delivery surfaced by the dispatcher.
pub struct ReceivedMessage {
    pub data: Vec<u8>,
    /// Originator, when it was routed. Relay-mode requests have none.
    pub source: Option<NodeId>,
    pub group_claim: Option<NodeId>,
    /// Present on requests: send the reply payload here and the dispatcher
    /// routes it back. Dropping the sender answers with silence.
    pub reply: Option<oneshot::Sender<Vec<u8>>>,
}

pub struct MessageHandler<T: Transport> {
    self_id: NodeId,
    config: Arc<Config>,
    routing: Arc<RoutingTable>,
    clients: Arc<ClientTable>,
    network: Arc<Network<T>>,
    service: Service<T>,
    group_change: Arc<GroupChangeHandler<T>>,
    remove_furthest: Arc<RemoveFurthest<T>>,
    timer: Arc<Timer>,
    delivery_tx: mpsc::Sender<ReceivedMessage>,
}

impl<T: Transport> MessageHandler<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: NodeId,
        config: Arc<Config>,
        routing: Arc<RoutingTable>,
        clients: Arc<ClientTable>,
        network: Arc<Network<T>>,
        service: Service<T>,
        group_change: Arc<GroupChangeHandler<T>>,
        remove_furthest: Arc<RemoveFurthest<T>>,
        timer: Arc<Timer>,
        delivery_tx: mpsc::Sender<ReceivedMessage>,
    ) -> Self {
        Self {
            self_id,
            config,
            routing,
            clients,
            network,
            service,
            group_change,
            remove_furthest,
            timer,
            delivery_tx,
        }
    }

    pub fn service(&self) -> &Service<T> {
        &self.service
    }

    /// Single entry point handed to the transport.
    pub async fn handle_bytes(self: &Arc<Self>, bytes: &[u8]) {
        match deserialize_message(bytes) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => debug!(error = %e, "dropping undecodable frame"),
        }
    }

    pub async fn handle_message(self: &Arc<Self>, mut message: Message) {
        if let Err(e) = message.validate(&self.config) {
            debug!(error = %e, id = message.id, "dropping invalid message");
            return;
        }
        // Exactly one decrement per node.
        message.decrement_hops();

        // A group request this node addressed to itself cannot fan out
        // here; the closest peer sees the group from outside.
        if message.source_id == Some(self.self_id)
            && message.destination_id == Some(self.self_id)
            && message.is_request()
            && !message.direct
        {
            trace!(id = message.id, "group request to own id; passing outward");
            return self.route_onward(message).await;
        }

        if self.config.client_mode {
            return self.handle_client_message(message).await;
        }

        if message.is_relay_request() {
            return self.handle_relay_request(message).await;
        }

        if message.destination_id == Some(self.self_id) {
            return self.handle_message_for_this_node(message).await;
        }

        // A relay response finding its substitute source via another route.
        if message.is_routing() && message.relay_id == Some(self.self_id) {
            return self.handle_routing_message(message).await;
        }

        let Some(destination) = message.destination_id else {
            // Relay responses in transit; the network layer owns them.
            return self.route_onward(message).await;
        };

        if self.clients.is_connected(&destination) && message.direct {
            return self.handle_client_destination(message).await;
        }

        let closest_with_visit = self
            .routing
            .is_this_node_closest_to(&destination, !message.direct)
            && message.visited;
        if self
            .routing
            .is_this_node_in_range(&destination, self.config.group_size)
            || closest_with_visit
        {
            self.handle_message_as_closest(message).await
        } else {
            self.handle_message_as_far(message).await
        }
    }

    /// Forward using the routing table, falling back to the bootstrap
    /// connection while the table is still empty. A dead end completes any
    /// pending request with the empty reply.
    async fn route_onward(&self, message: Message) {
        if self.routing.is_empty() && message.is_routing() {
            if let Some(bootstrap) = self.network.bootstrap_connection() {
                return self
                    .network
                    .send_to_direct(&message, bootstrap, bootstrap)
                    .await;
            }
        }
        let id = message.id;
        match self.network.send_to_closest(message).await {
            Ok(()) | Err(RoutingError::Shutdown) => {}
            Err(RoutingError::RoutingExhausted) => {
                debug!(id, "routing exhausted; aborting pending request");
                self.timer.cancel(id);
            }
            Err(e) => debug!(id, error = %e, "send failed"),
        }
    }

    // -- client mode --------------------------------------------------------

    async fn handle_client_message(self: &Arc<Self>, message: Message) {
        if message.source_id.is_none() {
            warn!(id = message.id, "client node cannot relay; dropping");
            return;
        }
        if message.is_routing() {
            return self.handle_routing_message(message).await;
        }
        if message.destination_id == Some(self.self_id) {
            self.handle_node_level_for_this_node(message).await;
        }
    }

    // -- destination is this node ------------------------------------------

    async fn handle_message_for_this_node(self: &Arc<Self>, mut message: Message) {
        if self.should_relay_response(&message) {
            trace!(
                relay = ?message.relay_id.as_ref().map(debug_id),
                id = message.id,
                "relaying response to its originator"
            );
            // Cleared destination marks the frame as relayed downstream.
            message.destination_id = None;
            return self.route_onward(message).await;
        }
        if message.is_routing() {
            self.handle_routing_message(message).await
        } else {
            self.handle_node_level_for_this_node(message).await
        }
    }

    /// A response that was requested through a relay is not for this node;
    /// it goes back out toward the relay originator.
    fn should_relay_response(&self, message: &Message) -> bool {
        match message.relay_id {
            Some(relay_id) => message.destination_id != Some(relay_id) && message.is_response(),
            None => false,
        }
    }

    async fn handle_node_level_for_this_node(self: &Arc<Self>, message: Message) {
        if message.is_request() {
            info!(
                from = ?message.source_id.as_ref().map(debug_id),
                id = message.id,
                "delivering request to application"
            );
            let (reply_tx, reply_rx) = oneshot::channel::<Vec<u8>>();
            self.spawn_reply_task(&message, reply_rx);
            let delivery = ReceivedMessage {
                data: message.data,
                source: message.source_id,
                group_claim: message.group_claim,
                reply: Some(reply_tx),
            };
            if self.delivery_tx.send(delivery).await.is_err() {
                debug!("application receiver gone; delivery dropped");
            }
        } else {
            trace!(id = message.id, "response arrived; completing request");
            self.timer.add_response(message);
        }
    }

    /// Arm the return path for a delivered request: when the application
    /// replies, the response message retraces the request's addressing,
    /// relay fields included.
    fn spawn_reply_task(self: &Arc<Self>, request: &Message, reply_rx: oneshot::Receiver<Vec<u8>>) {
        let handler = self.clone();
        let mut template = request.clone();
        tokio::spawn(async move {
            let Ok(data) = reply_rx.await else {
                trace!(id = template.id, "empty reply; no response sent");
                return;
            };
            template.request = false;
            template.direct = true;
            template.hops_to_live = handler.config.hops_to_live;
            template.destination_id = template.source_id;
            template.source_id = Some(handler.self_id);
            template.route_history.clear();
            template.visited = false;
            template.data = data;
            if template.destination_id == Some(handler.self_id) && !handler.config.client_mode {
                // Answering ourselves: straight back into dispatch.
                handler.handle_message(template).await;
            } else {
                handler.route_onward(template).await;
            }
        });
    }

    // -- routing-type dispatch ---------------------------------------------

    pub async fn handle_routing_message(self: &Arc<Self>, message: Message) {
        let request = message.is_request();
        let outcome: Result<Option<Message>, RoutingError> = match message.msg_type {
            MessageType::Ping => {
                if request {
                    Ok(self.service.ping(&message))
                } else {
                    self.service.ping_response(&message);
                    Ok(None)
                }
            }
            MessageType::FindNodes => {
                if request {
                    self.service.find_nodes(&message)
                } else {
                    self.service.find_nodes_response(&message).await.map(|_| None)
                }
            }
            MessageType::Connect => {
                if request {
                    self.service.connect(&message).await
                } else {
                    self.service.connect_response(&message).await.map(|_| None)
                }
            }
            MessageType::ConnectSuccess => {
                self.service.connect_success(&message).await.map(|_| None)
            }
            MessageType::ConnectSuccessAck => {
                self.service.connect_success_ack(&message).await.map(|_| None)
            }
            MessageType::Remove => {
                if request {
                    self.remove_furthest.handle_request(message).await.map(|_| None)
                } else {
                    self.remove_furthest.handle_response(message).await.map(|_| None)
                }
            }
            MessageType::ClosestNodesUpdate => {
                self.group_change.handle_update(message).await.map(|_| None)
            }
            MessageType::ClosestNodesSubscribe => {
                self.group_change.handle_subscribe(message).await.map(|_| None)
            }
            // Node-level traffic never reaches this dispatcher arm.
            MessageType::NodeLevel => Ok(None),
        };

        match outcome {
            Ok(Some(response)) => {
                if response.destination_id.is_none() {
                    // Relay return: the network layer routes by relay id.
                    if let Err(e) = self.network.send_to_closest(response).await {
                        debug!(error = %e, "relay response not routable");
                    }
                } else {
                    self.route_onward(response).await;
                }
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "routing message rejected"),
        }
    }

    // -- client-table destinations -----------------------------------------

    async fn handle_client_destination(&self, message: Message) {
        // A vault may not open requests toward a client; clients only talk
        // to themselves across connections.
        if message.is_request()
            && (!message.client_node || message.source_id != message.destination_id)
        {
            warn!(
                id = message.id,
                "dropping non-client-to-client request for a client destination"
            );
            return;
        }
        self.route_onward(message).await;
    }

    // -- closest-node handling ---------------------------------------------

    async fn handle_message_as_closest(self: &Arc<Self>, message: Message) {
        trace!(
            destination = ?message.destination_id.as_ref().map(debug_id),
            id = message.id,
            direct = message.direct,
            "handling in closest proximity"
        );
        if message.direct {
            self.handle_direct_as_closest(message).await
        } else {
            self.handle_group_as_closest(message, false).await
        }
    }

    async fn handle_direct_as_closest(self: &Arc<Self>, mut message: Message) {
        let Some(destination) = message.destination_id else {
            return;
        };
        if self.routing.is_connected(&destination) || self.clients.is_connected(&destination) {
            return self.route_onward(message).await;
        }
        if !message.visited {
            // One more hop: the true holder may only be known through a
            // neighbour's matrix.
            message.visited = true;
            return self.route_onward(message).await;
        }
        warn!(
            destination = %debug_id(&destination),
            id = message.id,
            "closest but not connected to destination; dropping"
        );
    }

    async fn handle_group_as_closest(self: &Arc<Self>, mut message: Message, relay_mode: bool) {
        let Some(destination) = message.destination_id else {
            return;
        };
        let have_group_peer = self.routing.is_connected(&destination);

        if !relay_mode
            && !message.visited
            && self.routing.len() > self.config.closest_nodes_size
            && !self
                .routing
                .is_this_node_in_range(&destination, self.config.closest_nodes_size)
        {
            message.visited = true;
            return self.route_onward(message).await;
        }

        if let Some(forward) = self.routing.group_leader(&destination) {
            trace!(
                leader_via = %debug_id(&forward.node_id),
                id = message.id,
                "not the group leader; forwarding"
            );
            if relay_mode {
                message.source_id = Some(self.self_id);
            }
            return self
                .network
                .send_to_direct(&message, forward.node_id, forward.connection_id)
                .await;
        }

        // Leader: replicate to the group.
        let replication = message.replication as usize;
        if replication == 0 || replication > self.config.group_size {
            debug!(id = message.id, replication, "invalid replication; dropping");
            return;
        }
        let mut fan_out = replication - 1;
        if have_group_peer {
            // The exact holder is connected: it takes its own copy and this
            // node may sit outside the group proper.
            fan_out += 1;
        }

        message.direct = true;
        if relay_mode {
            // Responses from the replicas come back through this node.
            message.source_id = Some(self.self_id);
        }

        let recipients = self.routing.get_closest(&destination, fan_out, &[], false, false);
        info!(
            group = %debug_id(&destination),
            copies = recipients.len(),
            id = message.id,
            "replicating group message"
        );
        for peer in &recipients {
            let mut copy = message.clone();
            copy.destination_id = Some(peer.node_id);
            self.network
                .send_to_direct(&copy, peer.node_id, peer.connection_id)
                .await;
        }

        // This node is a group member too.
        message.destination_id = Some(self.self_id);
        if relay_mode {
            // Keep the relay return path on the local copy's reply.
            message.source_id = None;
        }
        if message.is_routing() {
            self.handle_routing_message(message).await
        } else {
            self.handle_node_level_for_this_node(message).await
        }
    }

    // -- far-node handling --------------------------------------------------

    async fn handle_message_as_far(self: &Arc<Self>, mut message: Message) {
        if let Some(destination) = message.destination_id {
            if !message.direct
                && !message.visited
                && self.routing.is_this_node_closest_to(&destination, true)
            {
                message.visited = true;
            }
        }
        trace!(
            destination = ?message.destination_id.as_ref().map(debug_id),
            id = message.id,
            "not in closest proximity; forwarding"
        );
        self.route_onward(message).await
    }

    // -- relay-mode requests ------------------------------------------------

    async fn handle_relay_request(self: &Arc<Self>, mut message: Message) {
        if message.destination_id == Some(self.self_id) && message.is_request() {
            if !message.direct {
                // Group request to this node's own id from a relay
                // requester: fan-out happens at the closest peer.
                message.source_id = Some(self.self_id);
                return self.route_onward(message).await;
            }
            return self.handle_message_for_this_node(message).await;
        }

        let Some(destination) = message.destination_id else {
            return self.route_onward(message).await;
        };

        if message.is_request() && self.routing.is_this_node_closest_to(&destination, false) {
            if message.direct {
                return self.handle_direct_relay_as_closest(message).await;
            }
            return self.handle_group_as_closest(message, true).await;
        }

        // This node stands in as the source and relays the response back.
        message.source_id = Some(self.self_id);
        self.route_onward(message).await
    }

    async fn handle_direct_relay_as_closest(&self, mut message: Message) {
        let Some(destination) = message.destination_id else {
            return;
        };
        if self.routing.is_connected(&destination) || self.clients.is_connected(&destination) {
            message.source_id = Some(self.self_id);
            return self.route_onward(message).await;
        }
        warn!(
            destination = %debug_id(&destination),
            id = message.id,
            "closest for relay request but destination unreachable; dropping"
        );
    }
}
