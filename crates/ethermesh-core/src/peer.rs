//! Peers
//!
//! A peer is a remote node we know the identity of: its derived symmetric
//! packet key, up to four physical paths, version and role, and a small
//! queue of packets waiting for a path to come up.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use ethermesh_crypto::Identity;

use crate::config::EngineConfig;
use crate::path::Path;
use crate::protocol::{Verb, MAX_PEER_PATHS};

/// Role a peer plays in the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// Ordinary node
    Leaf,
    /// Forwards packets for others
    Relay,
    /// Listed in the active world
    Root,
}

/// Peer handshake progression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Known address, nothing exchanged yet
    Unlearned,
    /// We probed, no authenticated traffic back yet
    HelloSent,
    /// Authenticated traffic has flowed in both directions
    Established,
}

/// A packet parked while the peer has no usable path
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub verb: Verb,
    pub payload: Bytes,
    pub encrypt: bool,
    pub queued_at: u64,
}

/// A remote node and everything we know about reaching it
pub struct Peer {
    identity: Identity,
    key: [u8; 32],
    paths: Mutex<Vec<Path>>,
    send_queue: Mutex<VecDeque<QueuedPacket>>,
    state: Mutex<PeerState>,
    role: Mutex<PeerRole>,
    version: Mutex<Option<(u16, u16, u16)>>,
    last_receive: AtomicU64,
    last_hello_sent: AtomicU64,
    last_com_push: AtomicU64,
    latency_ms: AtomicU64,
    created: u64,
}

impl Peer {
    /// Create a peer from its identity and the derived packet key
    pub fn new(identity: Identity, key: [u8; 32], now: u64) -> Self {
        Self {
            identity,
            key,
            paths: Mutex::new(Vec::new()),
            send_queue: Mutex::new(VecDeque::new()),
            state: Mutex::new(PeerState::Unlearned),
            role: Mutex::new(PeerRole::Leaf),
            version: Mutex::new(None),
            last_receive: AtomicU64::new(0),
            last_hello_sent: AtomicU64::new(0),
            last_com_push: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
            created: now,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address(&self) -> ethermesh_crypto::Address {
        self.identity.address()
    }

    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap()
    }

    pub fn role(&self) -> PeerRole {
        *self.role.lock().unwrap()
    }

    pub fn set_role(&self, role: PeerRole) {
        *self.role.lock().unwrap() = role;
    }

    pub fn version(&self) -> Option<(u16, u16, u16)> {
        *self.version.lock().unwrap()
    }

    pub fn set_version(&self, version: (u16, u16, u16)) {
        *self.version.lock().unwrap() = Some(version);
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    pub fn record_latency(&self, rtt_ms: u64) {
        self.latency_ms.store(rtt_ms, Ordering::Relaxed)
    }

    pub fn last_receive(&self) -> u64 {
        self.last_receive.load(Ordering::Relaxed)
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    /// Record an authenticated receive on a (local, remote) tuple, learning
    /// the path if it is new. Re-elects the preferred path.
    pub fn received(&self, local: Option<SocketAddr>, remote: SocketAddr, now: u64) {
        self.last_receive.store(now, Ordering::Relaxed);
        *self.state.lock().unwrap() = PeerState::Established;

        let mut paths = self.paths.lock().unwrap();
        if let Some(path) = paths.iter_mut().find(|p| p.remote == remote) {
            path.received(now);
            if local.is_some() {
                path.local = local;
            }
        } else {
            if paths.len() >= MAX_PEER_PATHS {
                // Evict the stalest path to stay within the cap
                if let Some(stalest) = paths
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, p)| p.last_receive)
                    .map(|(i, _)| i)
                {
                    paths.remove(stalest);
                }
            }
            paths.push(Path::new(local, remote, now));
        }
        elect_preferred(&mut paths);
    }

    /// Record a transmit on a path, creating it speculatively if unknown
    /// (outbound-only paths stay un-alive until something comes back).
    pub fn sent(&self, remote: SocketAddr, now: u64) {
        let mut paths = self.paths.lock().unwrap();
        if let Some(path) = paths.iter_mut().find(|p| p.remote == remote) {
            path.sent(now);
        } else if paths.len() < MAX_PEER_PATHS {
            let mut path = Path::new(None, remote, now);
            path.last_receive = 0;
            path.sent(now);
            paths.push(path);
        }
    }

    /// The preferred alive path, if any
    pub fn best_path(&self, now: u64, config: &EngineConfig) -> Option<Path> {
        let mut paths = self.paths.lock().unwrap();
        elect_preferred(&mut paths);
        paths
            .iter()
            .find(|p| p.preferred && p.alive(now, config.path_alive_ms))
            .or_else(|| paths.iter().filter(|p| p.alive(now, config.path_alive_ms)).max_by_key(|p| p.last_receive))
            .cloned()
    }

    /// Whether any path is currently alive
    pub fn has_alive_path(&self, now: u64, config: &EngineConfig) -> bool {
        self.paths
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.alive(now, config.path_alive_ms))
    }

    /// Snapshot of all paths
    pub fn paths(&self) -> Vec<Path> {
        self.paths.lock().unwrap().clone()
    }

    /// All endpoints worth HELLOing for a keepalive round: alive paths plus
    /// recently-tried ones that have not yet expired.
    pub fn hello_endpoints(&self, now: u64, config: &EngineConfig) -> Vec<SocketAddr> {
        self.paths
            .lock()
            .unwrap()
            .iter()
            .filter(|p| !p.expired(now, config.path_dead_ms))
            .map(|p| p.remote)
            .collect()
    }

    /// Drop paths that have been silent past the dead timeout
    pub fn prune_dead_paths(&self, now: u64, config: &EngineConfig) {
        let mut paths = self.paths.lock().unwrap();
        paths.retain(|p| !p.expired(now, config.path_dead_ms));
        elect_preferred(&mut paths);
    }

    /// Whether a keepalive HELLO round is due (a never-probed peer always is)
    pub fn hello_due(&self, now: u64, config: &EngineConfig) -> bool {
        let last = self.last_hello_sent.load(Ordering::Relaxed);
        last == 0 || now.saturating_sub(last) >= config.hello_interval_ms
    }

    pub fn record_hello_sent(&self, now: u64) {
        self.last_hello_sent.store(now, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        if *state == PeerState::Unlearned {
            *state = PeerState::HelloSent;
        }
    }

    /// Whether a membership certificate push to this peer is due
    pub fn com_push_due(&self, now: u64, config: &EngineConfig) -> bool {
        let last = self.last_com_push.load(Ordering::Relaxed);
        last == 0 || now.saturating_sub(last) >= config.com_push_interval_ms
    }

    pub fn record_com_push(&self, now: u64) {
        self.last_com_push.store(now, Ordering::Relaxed);
    }

    /// Park a packet until a path exists; the oldest entry is dropped when
    /// the queue is full.
    pub fn queue_packet(&self, packet: QueuedPacket, config: &EngineConfig) {
        let mut queue = self.send_queue.lock().unwrap();
        while queue.len() >= config.send_queue_capacity {
            queue.pop_front();
        }
        queue.push_back(packet);
    }

    /// Take all parked packets for transmission
    pub fn drain_queue(&self) -> Vec<QueuedPacket> {
        self.send_queue.lock().unwrap().drain(..).collect()
    }

    /// Idle peers with no paths are dropped from the topology (roots never)
    pub fn expendable(&self, now: u64, config: &EngineConfig) -> bool {
        if self.role() == PeerRole::Root {
            return false;
        }
        let idle_since = self.last_receive().max(self.created);
        self.paths.lock().unwrap().is_empty()
            && now.saturating_sub(idle_since) > config.peer_expiry_ms
    }
}

/// Preferred = the alive path heard from most recently; everything else is
/// demoted so `preferred ⇒ alive` holds at all times.
fn elect_preferred(paths: &mut [Path]) {
    let best = paths
        .iter()
        .enumerate()
        .filter(|(_, p)| p.last_receive > 0)
        .max_by_key(|(_, p)| p.last_receive)
        .map(|(i, _)| i);
    for (i, path) in paths.iter_mut().enumerate() {
        path.preferred = Some(i) == best && path.last_receive > 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethermesh_crypto::Identity;

    fn addr(port: u16) -> SocketAddr {
        format!("192.0.2.1:{}", port).parse().unwrap()
    }

    fn test_peer() -> Peer {
        Peer::new(Identity::generate().public_clone(), [7u8; 32], 0)
    }

    #[test]
    fn test_path_cap_enforced() {
        let peer = test_peer();
        let config = EngineConfig::default();

        for port in 1..=6 {
            peer.received(None, addr(port), u64::from(port) * 100);
        }
        assert!(peer.paths().len() <= MAX_PEER_PATHS);
        // The most recently heard endpoints survive
        assert!(peer.paths().iter().any(|p| p.remote == addr(6)));
        assert!(!peer.paths().iter().any(|p| p.remote == addr(1)));

        let best = peer.best_path(600, &config).unwrap();
        assert_eq!(best.remote, addr(6));
    }

    #[test]
    fn test_preferred_implies_alive() {
        let peer = test_peer();
        let config = EngineConfig::default();

        peer.received(None, addr(1), 1_000);
        peer.sent(addr(2), 2_000);

        // The send-only path has never received; it cannot be preferred.
        for path in peer.paths() {
            if path.preferred {
                assert!(path.alive(2_000, config.path_alive_ms));
            }
        }
        assert_eq!(peer.best_path(2_000, &config).unwrap().remote, addr(1));
    }

    #[test]
    fn test_state_progression() {
        let peer = test_peer();
        assert_eq!(peer.state(), PeerState::Unlearned);

        peer.record_hello_sent(10);
        assert_eq!(peer.state(), PeerState::HelloSent);

        peer.received(None, addr(1), 20);
        assert_eq!(peer.state(), PeerState::Established);
    }

    #[test]
    fn test_queue_capacity() {
        let peer = test_peer();
        let config = EngineConfig {
            send_queue_capacity: 3,
            ..Default::default()
        };

        for i in 0..5u64 {
            peer.queue_packet(
                QueuedPacket {
                    verb: Verb::Echo,
                    payload: Bytes::from(vec![i as u8]),
                    encrypt: true,
                    queued_at: i,
                },
                &config,
            );
        }

        let drained = peer.drain_queue();
        assert_eq!(drained.len(), 3);
        // Oldest entries were dropped
        assert_eq!(&drained[0].payload[..], &[2]);
        assert!(peer.drain_queue().is_empty());
    }

    #[test]
    fn test_dead_path_pruning() {
        let peer = test_peer();
        let config = EngineConfig::default();

        peer.received(None, addr(1), 1_000);
        peer.prune_dead_paths(1_000 + config.path_dead_ms + 1, &config);
        assert!(peer.paths().is_empty());
    }

    #[test]
    fn test_hello_pacing() {
        let peer = test_peer();
        let config = EngineConfig::default();

        assert!(peer.hello_due(0, &config));
        peer.record_hello_sent(1_000);
        assert!(!peer.hello_due(2_000, &config));
        assert!(peer.hello_due(1_000 + config.hello_interval_ms, &config));
    }
}
