//! Engine configuration
//!
//! Every timer and cap the engine uses, in milliseconds of host-clock time.
//! Defaults carry the protocol constants; hosts normally only touch these in
//! tests or unusual deployments.

use serde::{Deserialize, Serialize};

use crate::protocol::{MAX_HOPS, MAX_MULTICAST_FANOUT};

/// Engine timers and capacities
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Interval between HELLOs to established peers (NAT keepalive + RTT)
    pub hello_interval_ms: u64,

    /// A path with no RX for this long is dead and eligible for GC
    pub path_dead_ms: u64,

    /// RX recency required for a path to count as alive
    pub path_alive_ms: u64,

    /// Parked packets from unknown sources expire after this long
    pub whois_park_ms: u64,

    /// WHOIS retransmit interval while a lookup is outstanding
    pub whois_retry_ms: u64,

    /// Duplicate packet IDs from one source are dropped within this window
    pub dedup_ms: u64,

    /// Incomplete fragment reassembly slots expire after this long
    pub reassembly_ms: u64,

    /// Per-peer outbound queue capacity while no path exists
    pub send_queue_capacity: usize,

    /// Interval between multicast subscription re-advertisements
    pub multicast_like_refresh_ms: u64,

    /// Subscribers unseen for this long age out of multicast member sets
    pub multicast_member_expiry_ms: u64,

    /// Maximum recipients per propagated multicast frame
    pub multicast_fanout: usize,

    /// Interval between network config refresh requests
    pub network_config_refresh_ms: u64,

    /// Retransmit interval while a config request is unanswered
    pub network_config_retry_ms: u64,

    /// Minimum spacing of membership certificate pushes per peer
    pub com_push_interval_ms: u64,

    /// RX recency from a root required to report ONLINE
    pub online_window_ms: u64,

    /// Minimum spacing of RENDEZVOUS pairs for the same two peers
    pub unite_interval_ms: u64,

    /// HELLOs sent in one burst at a rendezvous candidate endpoint
    pub rendezvous_hello_burst: usize,

    /// Cluster heartbeat interval
    pub cluster_heartbeat_ms: u64,

    /// A cluster member missing heartbeats for this long is dead
    pub cluster_dead_ms: u64,

    /// Peers idle for this long are dropped from the topology
    pub peer_expiry_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hello_interval_ms: 60_000,
            path_dead_ms: 180_000,
            path_alive_ms: 75_000,
            whois_park_ms: 5_000,
            whois_retry_ms: 1_000,
            dedup_ms: 1_000,
            reassembly_ms: 500,
            send_queue_capacity: 32,
            multicast_like_refresh_ms: 300_000,
            multicast_member_expiry_ms: 600_000,
            multicast_fanout: MAX_MULTICAST_FANOUT,
            network_config_refresh_ms: 300_000,
            network_config_retry_ms: 5_000,
            com_push_interval_ms: 60_000,
            online_window_ms: 75_000,
            unite_interval_ms: 30_000,
            rendezvous_hello_burst: 3,
            cluster_heartbeat_ms: 1_000,
            cluster_dead_ms: 30_000,
            peer_expiry_ms: 600_000,
        }
    }
}

impl EngineConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.multicast_fanout == 0 {
            return Err("multicast fanout must be at least 1".into());
        }
        if self.send_queue_capacity == 0 {
            return Err("send queue capacity must be at least 1".into());
        }
        if self.path_alive_ms > self.path_dead_ms {
            return Err("path alive window cannot exceed the dead timeout".into());
        }
        if self.rendezvous_hello_burst == 0 || self.rendezvous_hello_burst > MAX_HOPS as usize {
            return Err("rendezvous burst out of range".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_fanout_rejected() {
        let config = EngineConfig {
            multicast_fanout: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
