//! # Trellis - Structured Overlay Routing Core
//!
//! Trellis is the routing-decision and message-dispatch engine of a
//! peer-to-peer structured overlay:
//!
//! - **512-bit identifier space** with XOR proximity; every node, group and
//!   message target is a [`NodeId`]
//! - **Proximity-ordered routing table** bounded at 64 peers, biased toward
//!   bucket coverage, backed by a **group matrix** mirroring each
//!   neighbour's closest set
//! - **Message dispatch** that classifies every inbound frame into local
//!   delivery, single-peer forwarding, group replication at the leader, or
//!   relay service for not-yet-routed peers
//! - **Group-change propagation**: subscribe/publish of closest-set updates
//!   between group members
//!
//! The reliable-datagram transport is a collaborator behind the
//! [`network::Transport`] trait; an in-process [`loopback`] implementation
//! drives the tests and the demo binary. Credentials are supplied at
//! construction and never persisted.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | Lifecycle owner: construction, join, health, shutdown |
//! | `id` | Identifiers, XOR distance, common-leading-bits ordering |
//! | `routing_table` | Bounded proximity-ordered peer set + group matrix |
//! | `client_table` | Non-forwarding (client) connections |
//! | `group_matrix` | Per-peer closest-set mirror, group reasoning |
//! | `handler` | Classification and dispatch of every inbound message |
//! | `service` | Ping, find-nodes, and the connect handshake |
//! | `group_change` | Closest-set subscribe/publish between neighbours |
//! | `remove_furthest` | Negotiated eviction when the table overflows |
//! | `network` | Transport contract, forwarding, retry and route history |
//! | `messages` | Wire message model and bounded codec |
//! | `timer` | Response bookkeeping for originated requests |
//! | `loopback` | In-process transport for tests and simulation |

pub mod client_table;
pub mod config;
pub mod error;
pub mod group_change;
pub mod group_matrix;
pub mod handler;
pub mod id;
pub mod loopback;
pub mod messages;
pub mod network;
pub mod node;
pub mod peer;
pub mod remove_furthest;
pub mod routing_table;
pub mod service;
pub mod timer;

pub use config::Config;
pub use error::RoutingError;
pub use handler::ReceivedMessage;
pub use id::NodeId;
pub use loopback::{LoopbackNet, LoopbackTransport};
pub use network::{SendStatus, Transport, TransportEvent};
pub use node::{Credentials, Node};
pub use peer::{NatType, PeerInfo};
pub use routing_table::RoutingTable;
