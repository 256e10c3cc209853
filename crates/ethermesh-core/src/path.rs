//! Physical paths
//!
//! A path is one (local endpoint, remote endpoint) tuple over which a peer
//! has been heard or addressed, with the liveness stats the switch uses to
//! pick where to transmit.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// One physical path to a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Path {
    /// Local endpoint, None when the host picks the source
    pub local: Option<SocketAddr>,

    /// Remote endpoint
    pub remote: SocketAddr,

    /// Last transmit on this path
    pub last_send: u64,

    /// Last receive on this path
    pub last_receive: u64,

    /// Last HELLO probe sent on this path
    pub last_hello: u64,

    /// Paths the switch currently favors; preferred implies alive
    pub preferred: bool,
}

impl Path {
    /// Create a path first observed at `now`
    pub fn new(local: Option<SocketAddr>, remote: SocketAddr, now: u64) -> Self {
        Self {
            local,
            remote,
            last_send: 0,
            last_receive: now,
            last_hello: 0,
            preferred: false,
        }
    }

    /// Record a transmit
    pub fn sent(&mut self, now: u64) {
        self.last_send = now;
    }

    /// Record a receive
    pub fn received(&mut self, now: u64) {
        self.last_receive = now;
    }

    /// Confirmed alive: something was heard recently
    pub fn alive(&self, now: u64, alive_window_ms: u64) -> bool {
        self.last_receive > 0 && now.saturating_sub(self.last_receive) <= alive_window_ms
    }

    /// Dead and eligible for GC
    pub fn expired(&self, now: u64, dead_ms: u64) -> bool {
        now.saturating_sub(self.last_receive) > dead_ms
    }
}
