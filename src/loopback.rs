//! # Loopback Transport
//!
//! An in-process implementation of the [`Transport`] contract: every node
//! registers with a shared [`LoopbackNet`] hub and frames move over tokio
//! channels instead of a socket. Connection ids are node ids, sends respect
//! established connections, and per-peer delivery order matches send order,
//! which is the observable behaviour the real transport provides, minus the
//! network.
//!
//! Used by the demo binary and the integration tests; fault injection via
//! [`LoopbackTransport::fail_next`] scripts transient and fatal send
//! failures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::id::{debug_id, NodeId};
use crate::network::{EndpointPair, SendStatus, Transport, TransportEvent};
use crate::peer::NatType;

struct NodeSlot {
    events: mpsc::Sender<TransportEvent>,
    endpoint: SocketAddr,
    connections: HashSet<NodeId>,
}

/// The shared in-process wire all loopback transports hang off.
#[derive(Default)]
pub struct LoopbackNet {
    slots: Mutex<HashMap<NodeId, NodeSlot>>,
}

impl LoopbackNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport handle for one node, listening on `endpoint`.
    pub fn transport(self: &Arc<Self>, endpoint: SocketAddr) -> LoopbackTransport {
        LoopbackTransport {
            net: self.clone(),
            endpoint,
            self_id: OnceLock::new(),
            faults: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, id: NodeId, endpoint: SocketAddr, events: mpsc::Sender<TransportEvent>) {
        self.slots.lock().expect("loopback lock").insert(
            id,
            NodeSlot {
                events,
                endpoint,
                connections: HashSet::new(),
            },
        );
    }

    fn node_at(&self, endpoint: SocketAddr) -> Option<NodeId> {
        self.slots
            .lock()
            .expect("loopback lock")
            .iter()
            .find(|(_, slot)| slot.endpoint == endpoint)
            .map(|(id, _)| *id)
    }

    fn endpoint_of(&self, id: &NodeId) -> Option<SocketAddr> {
        self.slots
            .lock()
            .expect("loopback lock")
            .get(id)
            .map(|slot| slot.endpoint)
    }

    fn connect_pair(&self, a: NodeId, b: NodeId) -> bool {
        let mut slots = self.slots.lock().expect("loopback lock");
        if !slots.contains_key(&a) || !slots.contains_key(&b) {
            return false;
        }
        if let Some(slot) = slots.get_mut(&a) {
            slot.connections.insert(b);
        }
        if let Some(slot) = slots.get_mut(&b) {
            slot.connections.insert(a);
        }
        true
    }

    fn connected(&self, from: &NodeId, to: &NodeId) -> bool {
        self.slots
            .lock()
            .expect("loopback lock")
            .get(from)
            .is_some_and(|slot| slot.connections.contains(to))
    }

    /// Sever both directions and hand back the victim's event sender so the
    /// loss can be surfaced outside the lock.
    fn sever(&self, from: NodeId, to: NodeId) -> Option<mpsc::Sender<TransportEvent>> {
        let mut slots = self.slots.lock().expect("loopback lock");
        if let Some(slot) = slots.get_mut(&from) {
            slot.connections.remove(&to);
        }
        match slots.get_mut(&to) {
            Some(slot) => {
                if slot.connections.remove(&from) {
                    Some(slot.events.clone())
                } else {
                    None
                }
            }
            None => None,
        }
    }

    fn events_of(&self, id: &NodeId) -> Option<mpsc::Sender<TransportEvent>> {
        self.slots
            .lock()
            .expect("loopback lock")
            .get(id)
            .map(|slot| slot.events.clone())
    }
}

pub struct LoopbackTransport {
    net: Arc<LoopbackNet>,
    endpoint: SocketAddr,
    self_id: OnceLock<NodeId>,
    faults: Mutex<HashMap<NodeId, VecDeque<SendStatus>>>,
}

impl LoopbackTransport {
    /// Script the next send outcomes toward `peer` (tests).
    pub fn fail_next(&self, peer: NodeId, statuses: &[SendStatus]) {
        self.faults
            .lock()
            .expect("fault lock")
            .entry(peer)
            .or_default()
            .extend(statuses.iter().copied());
    }

    fn scripted(&self, peer: &NodeId) -> Option<SendStatus> {
        self.faults
            .lock()
            .expect("fault lock")
            .get_mut(peer)
            .and_then(|queue| queue.pop_front())
    }

    fn own_id(&self) -> Option<NodeId> {
        self.self_id.get().copied()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn bootstrap(
        &self,
        endpoints: Vec<SocketAddr>,
        _is_vault: bool,
        events: mpsc::Sender<TransportEvent>,
        self_id: NodeId,
        _public_key: VerifyingKey,
        _local_endpoint: Option<SocketAddr>,
    ) -> Option<NodeId> {
        let _ = self.self_id.set(self_id);
        self.net.register(self_id, self.endpoint, events);

        // The list may arrive unsorted; first answering endpoint wins.
        for endpoint in endpoints {
            if let Some(peer) = self.net.node_at(endpoint) {
                if peer != self_id && self.net.connect_pair(self_id, peer) {
                    debug!(
                        node = %debug_id(&self_id),
                        bootstrap = %debug_id(&peer),
                        "loopback bootstrap connected"
                    );
                    return Some(peer);
                }
            }
        }
        None
    }

    async fn get_available_endpoint(&self, _peer: NodeId) -> Result<(EndpointPair, NatType)> {
        if self.own_id().is_none() {
            bail!("transport not bootstrapped");
        }
        Ok((EndpointPair::symmetric(self.endpoint), NatType::Other))
    }

    async fn add(
        &self,
        peer: NodeId,
        peer_endpoints: EndpointPair,
        _validation_data: Vec<u8>,
    ) -> Result<()> {
        let Some(self_id) = self.own_id() else {
            bail!("transport not bootstrapped");
        };
        // The offered endpoints must belong to a live node.
        let Some(listed) = self.net.node_at(peer_endpoints.external) else {
            bail!("no node listening on {}", peer_endpoints.external);
        };
        if listed != peer {
            bail!("endpoint {} does not belong to that peer", peer_endpoints.external);
        }
        if !self.net.connect_pair(self_id, peer) {
            bail!("peer is gone");
        }
        trace!(
            node = %debug_id(&self_id),
            peer = %debug_id(&peer),
            "loopback connection added"
        );
        Ok(())
    }

    async fn mark_valid(&self, peer: NodeId, _endpoint: SocketAddr) -> Result<()> {
        let Some(self_id) = self.own_id() else {
            bail!("transport not bootstrapped");
        };
        if !self.net.connected(&self_id, &peer) {
            bail!("no provisional connection to mark valid");
        }
        Ok(())
    }

    async fn remove(&self, peer: NodeId) {
        let Some(self_id) = self.own_id() else {
            return;
        };
        if let Some(victim_events) = self.net.sever(self_id, peer) {
            // The other side learns its connection died.
            let _ = victim_events
                .send(TransportEvent::ConnectionLost(self_id))
                .await;
        }
    }

    async fn send(&self, peer: NodeId, bytes: Vec<u8>) -> SendStatus {
        if let Some(status) = self.scripted(&peer) {
            return status;
        }
        let Some(self_id) = self.own_id() else {
            return SendStatus::FatalFailure;
        };
        if !self.net.connected(&self_id, &peer) {
            return SendStatus::SendFailure;
        }
        match self.net.events_of(&peer) {
            Some(events) => {
                if events.send(TransportEvent::Received(bytes)).await.is_ok() {
                    SendStatus::Success
                } else {
                    SendStatus::FatalFailure
                }
            }
            None => SendStatus::FatalFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ID_BYTES;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn test_id(seed: u8) -> NodeId {
        NodeId::from_bytes([seed; ID_BYTES])
    }

    fn any_key() -> VerifyingKey {
        SigningKey::generate(&mut OsRng).verifying_key()
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn bootstrap_connects_to_first_live_endpoint() {
        let net = LoopbackNet::new();
        let seed = net.transport(addr(9000));
        let joiner = net.transport(addr(9001));

        let (seed_tx, _seed_rx) = mpsc::channel(16);
        let (join_tx, _join_rx) = mpsc::channel(16);

        let seed_conn = seed
            .bootstrap(Vec::new(), true, seed_tx, test_id(1), any_key(), Some(addr(9000)))
            .await;
        assert!(seed_conn.is_none(), "first node has nobody to call");

        let conn = joiner
            .bootstrap(
                vec![addr(9100), addr(9000)],
                true,
                join_tx,
                test_id(2),
                any_key(),
                None,
            )
            .await;
        assert_eq!(conn, Some(test_id(1)), "dead endpoint skipped");
    }

    #[tokio::test]
    async fn frames_flow_in_order_over_connections() {
        let net = LoopbackNet::new();
        let a = net.transport(addr(9010));
        let b = net.transport(addr(9011));

        let (a_tx, _a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);
        a.bootstrap(Vec::new(), true, a_tx, test_id(1), any_key(), None)
            .await;
        b.bootstrap(vec![addr(9010)], true, b_tx, test_id(2), any_key(), None)
            .await;

        // Unconnected targets fail without delivering.
        assert_eq!(a.send(test_id(9), vec![0]).await, SendStatus::SendFailure);

        for frame in [vec![1u8], vec![2], vec![3]] {
            assert_eq!(a.send(test_id(2), frame).await, SendStatus::Success);
        }
        for expected in [vec![1u8], vec![2], vec![3]] {
            match b_rx.recv().await.unwrap() {
                TransportEvent::Received(bytes) => assert_eq!(bytes, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn remove_surfaces_connection_loss_on_the_other_side() {
        let net = LoopbackNet::new();
        let a = net.transport(addr(9020));
        let b = net.transport(addr(9021));

        let (a_tx, _a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);
        a.bootstrap(Vec::new(), true, a_tx, test_id(1), any_key(), None)
            .await;
        b.bootstrap(vec![addr(9020)], true, b_tx, test_id(2), any_key(), None)
            .await;

        a.remove(test_id(2)).await;
        match b_rx.recv().await.unwrap() {
            TransportEvent::ConnectionLost(conn) => assert_eq!(conn, test_id(1)),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(a.send(test_id(2), vec![1]).await, SendStatus::SendFailure);
    }

    #[tokio::test]
    async fn scripted_faults_replay_before_delivery() {
        let net = LoopbackNet::new();
        let a = net.transport(addr(9030));
        let b = net.transport(addr(9031));

        let (a_tx, _a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);
        a.bootstrap(Vec::new(), true, a_tx, test_id(1), any_key(), None)
            .await;
        b.bootstrap(vec![addr(9030)], true, b_tx, test_id(2), any_key(), None)
            .await;

        a.fail_next(test_id(2), &[SendStatus::SendFailure, SendStatus::FatalFailure]);
        assert_eq!(a.send(test_id(2), vec![1]).await, SendStatus::SendFailure);
        assert_eq!(a.send(test_id(2), vec![2]).await, SendStatus::FatalFailure);
        assert_eq!(a.send(test_id(2), vec![3]).await, SendStatus::Success);
        match b_rx.recv().await.unwrap() {
            TransportEvent::Received(bytes) => assert_eq!(bytes, vec![3]),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
