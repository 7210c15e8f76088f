//! # Wire Protocol Messages
//!
//! Every datagram the overlay exchanges is one [`Message`]: a tagged record
//! carrying addressing, hop accounting, and an opaque payload. Routing-type
//! messages (ping, connect, find-nodes, closest-set maintenance, removal)
//! additionally serialize a typed payload into the `data` field; node-level
//! messages carry application bytes untouched.
//!
//! Serialization is bincode with a hard size limit enforced on the
//! deserialization path, so a hostile peer cannot make this node allocate
//! unbounded memory from a length prefix.
//!
//! ## Addressing fields
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `source_id` | originator; `None` while the sender is not yet routed (relay mode) |
//! | `destination_id` | target identifier; cleared on relay response return paths |
//! | `relay_id` / `relay_connection_id` | return address for relay-mode requests |
//! | `route_history` | recent hops, bounded, used to avoid immediate loops |
//! | `visited` | set at the first closest-node encounter |

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::Config;
use crate::error::RoutingError;
use crate::id::NodeId;
use crate::network::EndpointPair;
use crate::peer::{BasicPeer, NatType};

/// Default large-message bound for node-level payloads (256 KiB).
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// Deserialization cap: payload bound plus framing slack.
pub const MAX_WIRE_BYTES: u64 = (MAX_MESSAGE_BYTES as u64) + 4096;

/// Bincode options with the wire size limit enforced.
/// Always used for deserialization of network input.
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_WIRE_BYTES)
        .with_fixint_encoding()
}

/// Deserialize untrusted bytes with the size bound enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    wire_options().deserialize(bytes)
}

pub fn serialize_message(message: &Message) -> Result<Vec<u8>, bincode::Error> {
    wire_options().serialize(message)
}

pub fn deserialize_message(bytes: &[u8]) -> Result<Message, RoutingError> {
    deserialize_bounded(bytes)
        .map_err(|e| RoutingError::MalformedMessage(format!("undecodable frame: {e}")))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Ping,
    Connect,
    FindNodes,
    ConnectSuccess,
    ConnectSuccessAck,
    Remove,
    ClosestNodesUpdate,
    ClosestNodesSubscribe,
    NodeLevel,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    pub request: bool,
    /// Single-recipient delivery; `false` means group-addressed.
    pub direct: bool,
    pub source_id: Option<NodeId>,
    pub destination_id: Option<NodeId>,
    pub relay_id: Option<NodeId>,
    pub relay_connection_id: Option<NodeId>,
    /// Copies requested for a group message, `1..=group_size`.
    pub replication: u16,
    pub route_history: Vec<NodeId>,
    pub visited: bool,
    pub hops_to_live: u16,
    pub id: u32,
    pub data: Vec<u8>,
    pub client_node: bool,
    pub group_claim: Option<NodeId>,
}

impl Message {
    /// Skeleton with the fields every constructor shares.
    fn base(msg_type: MessageType, config: &Config) -> Self {
        Self {
            msg_type,
            request: true,
            direct: true,
            source_id: None,
            destination_id: None,
            relay_id: None,
            relay_connection_id: None,
            replication: 1,
            route_history: Vec::new(),
            visited: false,
            hops_to_live: config.hops_to_live,
            id: rand::random(),
            data: Vec::new(),
            client_node: config.client_mode,
            group_claim: None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.request
    }

    pub fn is_response(&self) -> bool {
        !self.request
    }

    /// Routing-type messages are handled inside the core; node-level
    /// messages belong to the application above it.
    pub fn is_routing(&self) -> bool {
        self.msg_type != MessageType::NodeLevel
    }

    /// Relay-mode requests come from peers that are not yet routed and
    /// therefore carry no source identifier.
    pub fn is_relay_request(&self) -> bool {
        self.source_id.is_none()
    }

    /// Consume one hop. Returns `false` when the allowance was already gone.
    pub fn decrement_hops(&mut self) -> bool {
        if self.hops_to_live == 0 {
            return false;
        }
        self.hops_to_live -= 1;
        true
    }

    /// Structural checks applied before any dispatch decision.
    pub fn validate(&self, config: &Config) -> Result<(), RoutingError> {
        if self.hops_to_live == 0 {
            return Err(RoutingError::HopsExceeded);
        }
        if let Some(src) = &self.source_id {
            if src.is_zero() {
                return Err(RoutingError::MalformedMessage(
                    "zero source identifier".into(),
                ));
            }
        } else if !self.request {
            // Responses always travel with a source.
            return Err(RoutingError::MalformedMessage(
                "response without source".into(),
            ));
        }
        if self.destination_id.is_none() && !(self.relay_id.is_some() && self.is_response()) {
            return Err(RoutingError::MalformedMessage("no destination".into()));
        }
        if let Some(dest) = &self.destination_id {
            if dest.is_zero() {
                return Err(RoutingError::MalformedMessage(
                    "zero destination identifier".into(),
                ));
            }
        }
        if !self.direct && (self.replication == 0 || self.replication as usize > config.group_size)
        {
            return Err(RoutingError::MalformedMessage(format!(
                "replication {} outside 1..={}",
                self.replication, config.group_size
            )));
        }
        if self.data.len() > MAX_MESSAGE_BYTES {
            return Err(RoutingError::MalformedMessage(format!(
                "payload of {} bytes exceeds bound",
                self.data.len()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Routing-type payloads
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNodesRequest {
    pub target: NodeId,
    pub count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNodesResponse {
    pub nodes: Vec<NodeId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub endpoints: EndpointPair,
    pub nat_type: NatType,
    pub is_client: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub endpoints: EndpointPair,
    pub connection_id: NodeId,
    pub accepted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectConfirm {
    pub node_id: NodeId,
    pub connection_id: NodeId,
    pub is_client: bool,
}

/// Eviction proposal sent to the furthest peer when the table overflows.
/// `closer_peers` attests that strictly closer peers exist from the
/// sender's vantage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub peer_to_remove: NodeId,
    pub closer_peers: Vec<NodeId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub accepted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClosestNodesUpdate {
    pub node: NodeId,
    pub nodes: Vec<BasicPeer>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub peer: NodeId,
    pub subscribe: bool,
}

pub fn encode_payload<T: Serialize>(payload: &T) -> Vec<u8> {
    // Payloads are built locally; encoding cannot exceed the wire bound.
    wire_options().serialize(payload).unwrap_or_default()
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RoutingError> {
    deserialize_bounded(bytes)
        .map_err(|e| RoutingError::MalformedMessage(format!("undecodable payload: {e}")))
}

// ---------------------------------------------------------------------------
// RPC constructors
// ---------------------------------------------------------------------------

pub mod rpcs {
    use super::*;

    pub fn ping_request(to: NodeId, from: NodeId, config: &Config) -> Message {
        let mut m = Message::base(MessageType::Ping, config);
        m.source_id = Some(from);
        m.destination_id = Some(to);
        m
    }

    /// Find-nodes toward `target`. When the sender is not yet routed it has
    /// no source id and supplies its relay return address instead.
    pub fn find_nodes_request(
        target: NodeId,
        from: Option<NodeId>,
        relay: Option<(NodeId, NodeId)>,
        count: usize,
        config: &Config,
    ) -> Message {
        let mut m = Message::base(MessageType::FindNodes, config);
        m.source_id = from;
        m.destination_id = Some(target);
        if let Some((relay_id, relay_connection_id)) = relay {
            m.relay_id = Some(relay_id);
            m.relay_connection_id = Some(relay_connection_id);
        }
        m.data = encode_payload(&FindNodesRequest { target, count });
        m
    }

    pub fn connect_request(
        to: NodeId,
        from: Option<NodeId>,
        relay: Option<(NodeId, NodeId)>,
        payload: &ConnectRequest,
        config: &Config,
    ) -> Message {
        let mut m = Message::base(MessageType::Connect, config);
        m.source_id = from;
        m.destination_id = Some(to);
        if let Some((relay_id, relay_connection_id)) = relay {
            m.relay_id = Some(relay_id);
            m.relay_connection_id = Some(relay_connection_id);
        }
        m.data = encode_payload(payload);
        m
    }

    pub fn connect_success(
        to: NodeId,
        from: NodeId,
        payload: &ConnectConfirm,
        config: &Config,
    ) -> Message {
        let mut m = Message::base(MessageType::ConnectSuccess, config);
        m.source_id = Some(from);
        m.destination_id = Some(to);
        m.data = encode_payload(payload);
        m
    }

    pub fn connect_success_ack(
        to: NodeId,
        from: NodeId,
        payload: &ConnectConfirm,
        config: &Config,
    ) -> Message {
        let mut m = Message::base(MessageType::ConnectSuccessAck, config);
        m.source_id = Some(from);
        m.destination_id = Some(to);
        m.data = encode_payload(payload);
        m
    }

    pub fn remove_request(
        to: NodeId,
        from: NodeId,
        payload: &RemoveRequest,
        config: &Config,
    ) -> Message {
        let mut m = Message::base(MessageType::Remove, config);
        m.source_id = Some(from);
        m.destination_id = Some(to);
        m.data = encode_payload(payload);
        m
    }

    pub fn closest_nodes_update(
        to: NodeId,
        from: NodeId,
        nodes: Vec<BasicPeer>,
        config: &Config,
    ) -> Message {
        let mut m = Message::base(MessageType::ClosestNodesUpdate, config);
        m.source_id = Some(from);
        m.destination_id = Some(to);
        m.data = encode_payload(&ClosestNodesUpdate { node: from, nodes });
        m
    }

    pub fn closest_nodes_subscribe(
        to: NodeId,
        from: NodeId,
        subscribe: bool,
        config: &Config,
    ) -> Message {
        let mut m = Message::base(MessageType::ClosestNodesSubscribe, config);
        m.source_id = Some(from);
        m.destination_id = Some(to);
        m.data = encode_payload(&SubscribeRequest {
            peer: from,
            subscribe,
        });
        m
    }

    /// Application-originated message, direct or group-addressed.
    pub fn node_level(
        to: NodeId,
        from: NodeId,
        data: Vec<u8>,
        direct: bool,
        replication: u16,
        request: bool,
        config: &Config,
    ) -> Message {
        let mut m = Message::base(MessageType::NodeLevel, config);
        m.source_id = Some(from);
        m.destination_id = Some(to);
        m.direct = direct;
        m.replication = replication;
        m.request = request;
        m.data = data;
        m
    }
}
