//! # Overlay Node
//!
//! The owner object: constructs the tables, the network adaptor and the
//! dispatcher, wires the event channels between them, and runs the
//! lifecycle: bootstrap and join, periodic health, orderly shutdown.
//!
//! ## Wiring
//!
//! ```text
//! transport events ──► event loop ──► MessageHandler ──► tables/network
//! routing table ─ closest-set changes ──► GroupChangeHandler
//! application ◄── delivery channel ◄── MessageHandler
//! ```
//!
//! Collaborators hold non-owning handles (`Arc`) passed down from here;
//! nothing points back up, so teardown is a matter of dropping the node
//! after flipping the shutdown flag.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::client_table::ClientTable;
use crate::config::Config;
use crate::error::RoutingError;
use crate::group_change::GroupChangeHandler;
use crate::handler::{MessageHandler, ReceivedMessage};
use crate::id::{debug_id, NodeId};
use crate::messages::{rpcs, Message};
use crate::network::{Network, Transport, TransportEvent};
use crate::remove_furthest::RemoveFurthest;
use crate::routing_table::RoutingTable;
use crate::service::Service;
use crate::timer::{Reply, Timer};

/// Transport event channel depth. The transport blocks a peer's delivery
/// when the core falls this far behind.
const EVENT_CHANNEL_DEPTH: usize = 256;

/// Application delivery channel depth.
const DELIVERY_CHANNEL_DEPTH: usize = 256;

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

/// This node's long-term identity, supplied by the credential subsystem.
/// The routing core never persists it.
#[derive(Clone)]
pub struct Credentials {
    signing_key: SigningKey,
    node_id: NodeId,
}

impl Credentials {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let node_id = NodeId::from_verifying_key(&signing_key.verifying_key());
        Self {
            signing_key,
            node_id,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

pub struct Node<T: Transport> {
    credentials: Credentials,
    config: Arc<Config>,
    routing: Arc<RoutingTable>,
    clients: Arc<ClientTable>,
    network: Arc<Network<T>>,
    handler: Arc<MessageHandler<T>>,
    group_change: Arc<GroupChangeHandler<T>>,
    timer: Arc<Timer>,
    event_tx: mpsc::Sender<TransportEvent>,
    delivery_rx: TakeOnce<ReceivedMessage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> Node<T> {
    pub fn new(config: Config, credentials: Credentials, transport: T) -> Self {
        let self_id = credentials.node_id();
        let config = Arc::new(config);

        let routing = Arc::new(RoutingTable::new(self_id, config.clone()));
        let clients = Arc::new(ClientTable::new(self_id, config.max_client_table_size));
        let network = Arc::new(Network::new(
            self_id,
            config.clone(),
            Arc::new(transport),
            routing.clone(),
            clients.clone(),
        ));
        let remove_furthest = Arc::new(RemoveFurthest::new(
            self_id,
            config.clone(),
            routing.clone(),
            network.clone(),
        ));
        let group_change = Arc::new(GroupChangeHandler::new(
            self_id,
            config.clone(),
            routing.clone(),
            network.clone(),
        ));
        let service = Service::new(
            self_id,
            config.clone(),
            routing.clone(),
            clients.clone(),
            network.clone(),
            remove_furthest.clone(),
        );
        let timer = Arc::new(Timer::new());
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_CHANNEL_DEPTH);
        let handler = Arc::new(MessageHandler::new(
            self_id,
            config.clone(),
            routing.clone(),
            clients.clone(),
            network.clone(),
            service,
            group_change.clone(),
            remove_furthest,
            timer.clone(),
            delivery_tx,
        ));

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        routing.set_closest_change_notifier(change_tx);

        let node = Self {
            credentials,
            config,
            routing,
            clients,
            network,
            handler,
            group_change,
            timer,
            event_tx,
            delivery_rx: tokio::sync::Mutex::new(Some(delivery_rx)),
            tasks: Mutex::new(Vec::new()),
        };
        node.spawn_event_loop(event_rx);
        node.spawn_change_loop(change_rx);
        node.spawn_health_loop();
        info!(node = %debug_id(&node.self_id()), client = node.config.client_mode, "node up");
        node
    }

    pub fn self_id(&self) -> NodeId {
        self.credentials.node_id()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn peer_count(&self) -> usize {
        self.routing.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn group_change(&self) -> &Arc<GroupChangeHandler<T>> {
        &self.group_change
    }

    /// Sender the transport uses to surface events into this node.
    pub fn event_sink(&self) -> mpsc::Sender<TransportEvent> {
        self.event_tx.clone()
    }

    // -- lifecycle -----------------------------------------------------------

    /// Bootstrap off the given endpoints and start acquiring peers.
    ///
    /// Routing traffic flows through the bootstrap connection until the
    /// first handshakes complete; peer acquisition continues in the
    /// background afterwards.
    pub async fn join(&self, endpoints: Vec<SocketAddr>) -> Result<()> {
        let connection = self
            .network
            .transport()
            .bootstrap(
                endpoints,
                !self.config.client_mode,
                self.event_tx.clone(),
                self.self_id(),
                self.credentials.verifying_key(),
                None,
            )
            .await
            .context("no online bootstrap contact")?;

        info!(
            node = %debug_id(&self.self_id()),
            bootstrap = %debug_id(&connection),
            "bootstrapped"
        );
        self.network.set_bootstrap_connection(Some(connection));

        // Announce ourselves: a relay-mode closest-node query toward our
        // own identifier. The answer seeds the connect handshakes. The
        // relay return address is this node's own connection identity.
        let query = rpcs::find_nodes_request(
            self.self_id(),
            None,
            Some((self.self_id(), self.self_id())),
            self.config.closest_nodes_size,
            &self.config,
        );
        let query = Self::as_group_query(query);
        self.network
            .send_to_direct(&query, connection, connection)
            .await;
        Ok(())
    }

    /// Serve as the first node of a new overlay: no bootstrap contact,
    /// just start listening for joiners.
    pub async fn start_first(&self, local_endpoint: SocketAddr) -> Result<()> {
        self.network
            .transport()
            .bootstrap(
                Vec::new(),
                !self.config.client_mode,
                self.event_tx.clone(),
                self.self_id(),
                self.credentials.verifying_key(),
                Some(local_endpoint),
            )
            .await;
        info!(node = %debug_id(&self.self_id()), "seeding a new overlay");
        Ok(())
    }

    /// Block until the routing table holds at least `count` peers.
    pub async fn wait_for_peers(&self, count: usize, timeout: Duration) -> Result<()> {
        let deadline = time::Instant::now() + timeout;
        while self.routing.len() < count {
            if time::Instant::now() >= deadline {
                anyhow::bail!(
                    "joined {} of {} peers before timeout",
                    self.routing.len(),
                    count
                );
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    /// Take the application delivery channel. Single consumer.
    pub async fn messages(&self) -> Result<mpsc::Receiver<ReceivedMessage>> {
        self.delivery_rx
            .lock()
            .await
            .take()
            .context("message receiver already taken")
    }

    /// Orderly shutdown: sends short-circuit, pending requests complete
    /// with the empty reply, background loops exit. The transport handle
    /// is released when the node is dropped, after callbacks unwind.
    pub async fn shutdown(&self) {
        info!(node = %debug_id(&self.self_id()), "shutting down");
        self.network.stop();
        self.timer.drain();
        self.group_change.clear();
        let tasks = {
            let mut tasks = self.tasks.lock().expect("task list lock");
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.abort();
        }
    }

    // -- messaging -----------------------------------------------------------

    /// Fire-and-forget direct message to a single identifier.
    pub async fn send(&self, destination: NodeId, data: Vec<u8>) -> Result<()> {
        let message = rpcs::node_level(
            destination,
            self.self_id(),
            data,
            true,
            1,
            true,
            &self.config,
        );
        self.originate(message).await
    }

    /// Direct request; resolves with the peer's reply, or fails on the
    /// distinguished empty reply (timeout, routing exhausted, shutdown).
    pub async fn request(&self, destination: NodeId, data: Vec<u8>) -> Result<Vec<u8>> {
        let message = rpcs::node_level(
            destination,
            self.self_id(),
            data,
            true,
            1,
            true,
            &self.config,
        );
        let reply_rx = self.timer.register(message.id, self.config.response_timeout);
        if let Err(e) = self.originate(message).await {
            // The registration resolves empty; surface the send error.
            return Err(e);
        }
        match reply_rx.await {
            Ok(Reply::Response(response)) => Ok(response.data),
            Ok(Reply::Empty) | Err(_) => anyhow::bail!("request ended with the empty reply"),
        }
    }

    /// Group-addressed message replicated to the target's closest peers.
    pub async fn send_group(&self, destination: NodeId, data: Vec<u8>) -> Result<()> {
        let message = rpcs::node_level(
            destination,
            self.self_id(),
            data,
            false,
            self.config.group_size as u16,
            true,
            &self.config,
        );
        self.originate(message).await
    }

    async fn originate(&self, message: Message) -> Result<()> {
        let id = message.id;
        if self.routing.is_empty() {
            if let Some(bootstrap) = self.network.bootstrap_connection() {
                self.network
                    .send_to_direct(&message, bootstrap, bootstrap)
                    .await;
                return Ok(());
            }
        }
        match self.network.send_to_closest(message).await {
            Ok(()) => Ok(()),
            Err(RoutingError::RoutingExhausted) => {
                self.timer.cancel(id);
                Err(RoutingError::RoutingExhausted.into())
            }
            Err(e) => {
                self.timer.cancel(id);
                Err(e.into())
            }
        }
    }

    // -- background loops ----------------------------------------------------

    fn spawn_event_loop(&self, mut event_rx: mpsc::Receiver<TransportEvent>) {
        let handler = self.handler.clone();
        let routing = self.routing.clone();
        let clients = self.clients.clone();
        let network = self.network.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if network.is_stopped() {
                    break;
                }
                match event {
                    TransportEvent::Received(bytes) => handler.handle_bytes(&bytes).await,
                    TransportEvent::ConnectionLost(connection_id) => {
                        if let Some(peer) = routing.remove_connection(&connection_id) {
                            warn!(
                                peer = %debug_id(&peer.node_id),
                                "routing peer lost"
                            );
                        }
                        if let Some(peer) = clients.remove_connection(&connection_id) {
                            debug!(
                                peer = %debug_id(&peer.node_id),
                                "client connection lost"
                            );
                        }
                    }
                }
            }
        });
        self.tasks.lock().expect("task list lock").push(task);
    }

    fn spawn_change_loop(
        &self,
        mut change_rx: mpsc::UnboundedReceiver<crate::routing_table::ClosestNodesChange>,
    ) {
        let group_change = self.group_change.clone();
        let network = self.network.clone();
        let task = tokio::spawn(async move {
            while let Some(change) = change_rx.recv().await {
                if network.is_stopped() {
                    break;
                }
                group_change.on_closest_set_changed(change).await;
            }
        });
        self.tasks.lock().expect("task list lock").push(task);
    }

    /// Periodic health pass: refresh the neighbourhood with a closest-node
    /// query toward this node's own identifier and chase closest-set
    /// reports still missing from ring members.
    fn spawn_health_loop(&self) {
        let network = self.network.clone();
        let routing = self.routing.clone();
        let group_change = self.group_change.clone();
        let config = self.config.clone();
        let self_id = self.self_id();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(config.health_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if network.is_stopped() {
                    break;
                }
                if routing.is_empty() {
                    continue;
                }
                debug!(
                    node = %debug_id(&self_id),
                    peers = routing.len(),
                    "health pass"
                );
                let query = rpcs::find_nodes_request(
                    self_id,
                    Some(self_id),
                    None,
                    config.closest_nodes_size,
                    &config,
                );
                let query = Self::as_group_query(query);
                if let Err(e) = network.send_to_closest(query).await {
                    debug!(error = %e, "health refresh not routable");
                }
                group_change.chase_missing_reports().await;
            }
        });
        self.tasks.lock().expect("task list lock").push(task);
    }

    /// Closest-node queries travel as single-copy group messages so they
    /// are serviced wherever the closest node turns out to be.
    fn as_group_query(mut message: Message) -> Message {
        message.direct = false;
        message.replication = 1;
        message
    }
}
