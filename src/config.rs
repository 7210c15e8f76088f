//! Runtime parameters for an overlay node.
//!
//! Every knob the routing core recognizes lives here with its default. The
//! defaults are the tuning the protocol was designed around; tests shrink
//! them to build small deterministic overlays.

use std::time::Duration;

/// Configuration for one overlay node.
#[derive(Clone, Debug)]
pub struct Config {
    /// Size of the closest-set mirrored between group members. Default: 4.
    pub closest_nodes_size: usize,
    /// Replication group size for group-addressed messages. Default: 4.
    pub group_size: usize,
    /// Upper bound on routing-table occupancy. Default: 64.
    pub max_routing_table_size: usize,
    /// Upper bound on client/non-routing table occupancy. Default: 64.
    pub max_client_table_size: usize,
    /// Maximum retained hops in a message's route history. Default: 8.
    pub max_route_history: usize,
    /// Initial hop allowance for originated messages. Default: 12.
    pub hops_to_live: u16,
    /// Enables the external cache-manager hook for cacheable payloads.
    /// The core only gates on this; caching itself lives upstream.
    pub caching: bool,
    /// Run as a client: send and receive own traffic, never forward.
    pub client_mode: bool,
    /// How long an evicted peer pairing stays barred from re-admission.
    pub removal_cooldown: Duration,
    /// Cadence of the periodic health pass. Default: 10 s.
    pub health_interval: Duration,
    /// How long an originated request waits for its response. Default: 10 s.
    pub response_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            closest_nodes_size: 4,
            group_size: 4,
            max_routing_table_size: 64,
            max_client_table_size: 64,
            max_route_history: 8,
            hops_to_live: 12,
            caching: true,
            client_mode: false,
            removal_cooldown: Duration::from_secs(30),
            health_interval: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn with_closest_nodes_size(mut self, n: usize) -> Self {
        self.closest_nodes_size = n;
        self
    }

    pub fn with_group_size(mut self, n: usize) -> Self {
        self.group_size = n;
        self
    }

    pub fn with_max_routing_table_size(mut self, n: usize) -> Self {
        self.max_routing_table_size = n;
        self
    }

    pub fn with_max_client_table_size(mut self, n: usize) -> Self {
        self.max_client_table_size = n;
        self
    }

    pub fn with_max_route_history(mut self, n: usize) -> Self {
        self.max_route_history = n;
        self
    }

    pub fn with_hops_to_live(mut self, hops: u16) -> Self {
        self.hops_to_live = hops;
        self
    }

    pub fn with_caching(mut self, caching: bool) -> Self {
        self.caching = caching;
        self
    }

    pub fn with_client_mode(mut self, client: bool) -> Self {
        self.client_mode = client;
        self
    }

    pub fn with_removal_cooldown(mut self, d: Duration) -> Self {
        self.removal_cooldown = d;
        self
    }

    pub fn with_health_interval(mut self, d: Duration) -> Self {
        self.health_interval = d;
        self
    }

    pub fn with_response_timeout(mut self, d: Duration) -> Self {
        self.response_timeout = d;
        self
    }
}
