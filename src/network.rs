//! # Network Adaptor
//!
//! Thin seam between the routing core and the reliable-datagram transport.
//! The transport itself lives behind the [`Transport`] trait: the core only
//! ever asks it to move bytes, manage connections, and report endpoints.
//! Everything routing-aware lives here in [`Network`]: next-hop selection,
//! retry-with-removal, route history, and the relay return path.
//!
//! ## Forwarding to the closest peer
//!
//! `send_to_closest` first satisfies client-table destinations, then walks
//! the routing table. A failing hop is retried [`RETRY_LIMIT`] times with
//! [`RETRY_DELAY`] pauses; after that the connection is dropped and
//! selection re-runs against the freshly shrunk table. A fatal transport
//! failure skips the retries and drops the connection immediately. The
//! retry pause happens on the executor, never by blocking a caller thread.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::client_table::ClientTable;
use crate::config::Config;
use crate::error::RoutingError;
use crate::id::{debug_id, NodeId};
use crate::messages::{serialize_message, Message};
use crate::peer::{NatType, PeerInfo};
use crate::routing_table::RoutingTable;

/// Consecutive failed sends tolerated on one connection before it is
/// dropped and routing re-selects.
pub const RETRY_LIMIT: u32 = 3;

/// Pause between send retries to the same connection.
pub const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Local/external address pairing for one side of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPair {
    pub local: SocketAddr,
    pub external: SocketAddr,
}

impl EndpointPair {
    pub fn symmetric(addr: SocketAddr) -> Self {
        Self {
            local: addr,
            external: addr,
        }
    }
}

/// Outcome the transport reports for one send attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    /// Transient: the attempt may be retried on the same connection.
    SendFailure,
    /// The connection is gone; retrying on it is pointless.
    FatalFailure,
}

/// Inbound events the transport surfaces to the core.
#[derive(Debug)]
pub enum TransportEvent {
    /// An opaque wire frame arrived. Frames from one peer arrive in order.
    Received(Vec<u8>),
    /// A connection died; the id is the connection identifier.
    ConnectionLost(NodeId),
}

/// Contract the routing core requires from the reliable-datagram transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to the first reachable bootstrap endpoint. The list may
    /// arrive unsorted; ordering is the transport's business. Returns the
    /// bootstrap peer's connection id, or `None` when nobody answered.
    async fn bootstrap(
        &self,
        endpoints: Vec<SocketAddr>,
        is_vault: bool,
        events: mpsc::Sender<TransportEvent>,
        self_id: NodeId,
        public_key: VerifyingKey,
        local_endpoint: Option<SocketAddr>,
    ) -> Option<NodeId>;

    /// Endpoints this node can offer `peer`, plus the locally detected NAT
    /// classification.
    async fn get_available_endpoint(&self, peer: NodeId) -> Result<(EndpointPair, NatType)>;

    /// Begin connecting to `peer` on the given endpoints.
    async fn add(
        &self,
        peer: NodeId,
        peer_endpoints: EndpointPair,
        validation_data: Vec<u8>,
    ) -> Result<()>;

    /// Promote a provisional connection to permanent.
    async fn mark_valid(&self, peer: NodeId, endpoint: SocketAddr) -> Result<()>;

    /// Tear down the connection to `peer`.
    async fn remove(&self, peer: NodeId);

    /// Move one frame to `peer`. Non-blocking at the caller; the returned
    /// status is the completion report.
    async fn send(&self, peer: NodeId, bytes: Vec<u8>) -> SendStatus;
}

pub struct Network<T: Transport> {
    self_id: NodeId,
    config: Arc<Config>,
    transport: Arc<T>,
    routing: Arc<RoutingTable>,
    clients: Arc<ClientTable>,
    stopped: AtomicBool,
    bootstrap_connection: Mutex<Option<NodeId>>,
}

impl<T: Transport> Network<T> {
    pub fn new(
        self_id: NodeId,
        config: Arc<Config>,
        transport: Arc<T>,
        routing: Arc<RoutingTable>,
        clients: Arc<ClientTable>,
    ) -> Self {
        Self {
            self_id,
            config,
            transport,
            routing,
            clients,
            stopped: AtomicBool::new(false),
            bootstrap_connection: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Flip the shutdown flag: every send path short-circuits from here on.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn set_bootstrap_connection(&self, connection: Option<NodeId>) {
        *self
            .bootstrap_connection
            .lock()
            .expect("bootstrap connection lock") = connection;
    }

    pub fn bootstrap_connection(&self) -> Option<NodeId> {
        *self
            .bootstrap_connection
            .lock()
            .expect("bootstrap connection lock")
    }

    /// One-shot send over a known connection. Failures are logged, not
    /// retried; callers on this path own their own recovery.
    pub async fn send_to_direct(&self, message: &Message, peer: NodeId, connection: NodeId) {
        if self.is_stopped() {
            return;
        }
        let bytes = match serialize_message(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "dropping unencodable outbound message");
                return;
            }
        };
        let status = self.transport.send(connection, bytes).await;
        if status != SendStatus::Success {
            warn!(
                peer = %debug_id(&peer),
                ?status,
                id = message.id,
                "direct send failed"
            );
        }
    }

    /// Route `message` toward its destination: client-table fan-out for
    /// direct matches, otherwise recursive forwarding through the routing
    /// table; messages without a destination take the relay return path.
    pub async fn send_to_closest(&self, message: Message) -> Result<(), RoutingError> {
        if self.is_stopped() {
            return Err(RoutingError::Shutdown);
        }

        let Some(destination) = message.destination_id else {
            return self.send_relay_response(message).await;
        };

        let client_matches = self.clients.get(&destination);
        if !client_matches.is_empty() && message.direct {
            trace!(
                destination = %debug_id(&destination),
                connections = client_matches.len(),
                id = message.id,
                "delivering to client-table connections"
            );
            for entry in client_matches {
                self.send_to_direct(&message, entry.node_id, entry.connection_id)
                    .await;
            }
            return Ok(());
        }

        if self.routing.is_empty() {
            debug!(
                destination = %debug_id(&destination),
                id = message.id,
                "no forwarding candidate; routing table is empty"
            );
            return Err(RoutingError::RoutingExhausted);
        }

        self.recursive_send(message).await
    }

    /// Return path for relay responses: the destination was cleared so
    /// downstream nodes recognize the message as relayed; the relay id is
    /// the directly-connected originator.
    async fn send_relay_response(&self, mut message: Message) -> Result<(), RoutingError> {
        let (Some(relay_id), true) = (message.relay_id, message.is_response()) else {
            return Err(RoutingError::MalformedMessage(
                "no destination and not a relay response".into(),
            ));
        };
        // Restore the destination so the receiving peer sees a direct hit.
        message.destination_id = Some(relay_id);
        let connection = message.relay_connection_id.unwrap_or(relay_id);
        self.send_to_direct(&message, relay_id, connection).await;
        Ok(())
    }

    async fn recursive_send(&self, mut message: Message) -> Result<(), RoutingError> {
        let ignore_exact_match = !message.direct;
        let mut failures: u32 = 0;
        let mut last_attempted: Option<PeerInfo> = None;

        loop {
            if self.is_stopped() {
                return Err(RoutingError::Shutdown);
            }

            if failures >= RETRY_LIMIT {
                if let Some(failing) = last_attempted.take() {
                    let exhausted = RoutingError::TransportFailure {
                        peer: failing.node_id,
                        attempts: failures,
                    };
                    warn!(
                        error = %exhausted,
                        id = message.id,
                        "dropping connection and re-routing"
                    );
                    self.drop_connection(&failing.connection_id).await;
                }
                failures = 0;
            } else if failures > 0 {
                time::sleep(RETRY_DELAY).await;
            }

            let destination = message
                .destination_id
                .ok_or_else(|| RoutingError::MalformedMessage("no destination".into()))?;

            // Skip the hop the message just arrived from.
            let exclude: Vec<NodeId> = message
                .route_history
                .last()
                .filter(|last| **last != self.self_id)
                .map(|last| vec![*last])
                .unwrap_or_default();

            let Some(next) = self
                .routing
                .closest_peer(&destination, &exclude, ignore_exact_match)
            else {
                debug!(
                    destination = %debug_id(&destination),
                    id = message.id,
                    "routing table exhausted during forwarding"
                );
                return Err(RoutingError::RoutingExhausted);
            };

            self.adjust_route_history(&mut message);
            let bytes = serialize_message(&message)
                .map_err(|e| RoutingError::MalformedMessage(e.to_string()))?;

            match self.transport.send(next.connection_id, bytes).await {
                SendStatus::Success => {
                    trace!(
                        next_hop = %debug_id(&next.node_id),
                        destination = %debug_id(&destination),
                        id = message.id,
                        "forwarded"
                    );
                    return Ok(());
                }
                SendStatus::SendFailure => {
                    failures += 1;
                    last_attempted = Some(next);
                }
                SendStatus::FatalFailure => {
                    warn!(
                        peer = %debug_id(&next.node_id),
                        id = message.id,
                        "fatal send failure; dropping connection"
                    );
                    self.drop_connection(&next.connection_id).await;
                    failures = 0;
                    last_attempted = None;
                }
            }
        }
    }

    /// Record this node in the message's route history, trimming the oldest
    /// hop once the bound is crossed.
    fn adjust_route_history(&self, message: &mut Message) {
        if !message.route_history.contains(&self.self_id) {
            message.route_history.push(self.self_id);
            while message.route_history.len() > self.config.max_route_history {
                message.route_history.remove(0);
            }
        }
    }

    /// Tear down a failing connection everywhere: transport, routing table,
    /// client table.
    pub async fn drop_connection(&self, connection_id: &NodeId) {
        self.transport.remove(*connection_id).await;
        if let Some(peer) = self.routing.remove_connection(connection_id) {
            debug!(peer = %debug_id(&peer.node_id), "dropped routing peer");
        }
        if let Some(peer) = self.clients.remove_connection(connection_id) {
            debug!(peer = %debug_id(&peer.node_id), "dropped client connection");
        }
    }
}
