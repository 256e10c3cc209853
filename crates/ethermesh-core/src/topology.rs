//! Topology
//!
//! The directory of all known peers, the active world, and relay selection.
//! Topology exclusively owns peers; every other component refers to them by
//! address and borrows an `Arc` for the duration of an operation.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ethermesh_crypto::{Address, Identity};

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::peer::{Peer, PeerRole};
use crate::world::World;

/// Host-declared trust level of a local interface address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum AddressTrust {
    Normal = 0,
    Privacy = 10,
    Ultimate = 20,
}

/// A local interface address the host told us about
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalInterface {
    pub address: SocketAddr,
    pub metric: u32,
    pub trust: AddressTrust,
}

/// Directory of peers plus the embedded world
pub struct Topology {
    self_address: Address,
    peers: DashMap<Address, Arc<Peer>>,
    world: RwLock<World>,
    local_interfaces: Mutex<Vec<LocalInterface>>,
}

impl Topology {
    pub fn new(self_address: Address, world: World) -> Self {
        Self {
            self_address,
            peers: DashMap::new(),
            world: RwLock::new(world),
            local_interfaces: Mutex::new(Vec::new()),
        }
    }

    /// Look up a peer by address
    pub fn get_peer(&self, address: Address) -> Option<Arc<Peer>> {
        self.peers.get(&address).map(|p| Arc::clone(&p))
    }

    /// Insert a peer for a freshly learned identity, deduplicating against
    /// the directory. Returns an error if a different identity already
    /// claims the address (collision: the first one wins).
    pub fn learn_identity(
        &self,
        self_identity: &Identity,
        identity: Identity,
        now: u64,
    ) -> CoreResult<Arc<Peer>> {
        let address = identity.address();
        if address.is_reserved() || address == self.self_address {
            return Err(CoreError::BadParameter("unusable peer address".into()));
        }

        if let Some(existing) = self.get_peer(address) {
            if *existing.identity() == identity {
                return Ok(existing);
            }
            return Err(CoreError::BadParameter(format!(
                "identity collision on {}",
                address
            )));
        }

        let key = self_identity.agree(&identity)?.packet_key();
        let peer = Arc::new(Peer::new(identity, key, now));
        if self.is_root(address) {
            peer.set_role(PeerRole::Root);
        }
        debug!(peer = %address, "learned peer identity");

        // A racing insert keeps whichever landed first
        Ok(self
            .peers
            .entry(address)
            .or_insert(peer)
            .value()
            .clone())
    }

    /// Snapshot of all peers
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Number of known peers
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Whether an address is a root in the active world
    pub fn is_root(&self, address: Address) -> bool {
        self.world
            .read()
            .unwrap()
            .roots
            .iter()
            .any(|r| r.identity.address() == address)
    }

    /// Root identities and endpoints from the active world
    pub fn roots(&self) -> Vec<(Identity, Vec<SocketAddr>)> {
        self.world
            .read()
            .unwrap()
            .roots
            .iter()
            .filter(|r| r.identity.address() != self.self_address)
            .map(|r| (r.identity.clone(), r.endpoints.clone()))
            .collect()
    }

    /// The best root to send WHOIS/GATHER/relay traffic to: alive-path roots
    /// first, then the one heard from most recently.
    pub fn best_root(&self, now: u64, config: &EngineConfig) -> Option<Arc<Peer>> {
        let root_addresses: Vec<Address> = {
            let world = self.world.read().unwrap();
            world.roots.iter().map(|r| r.identity.address()).collect()
        };

        root_addresses
            .iter()
            .filter_map(|a| self.get_peer(*a))
            .max_by_key(|p| {
                (
                    p.has_alive_path(now, config),
                    p.last_receive(),
                )
            })
    }

    /// Whether any root has been heard from within the online window
    pub fn any_root_recent(&self, now: u64, config: &EngineConfig) -> bool {
        let world = self.world.read().unwrap();
        world.roots.iter().any(|r| {
            self.get_peer(r.identity.address())
                .map(|p| now.saturating_sub(p.last_receive()) <= config.online_window_ms)
                .unwrap_or(false)
        })
    }

    /// Current world snapshot
    pub fn world(&self) -> World {
        self.world.read().unwrap().clone()
    }

    /// Install a new world if the update rules allow it. Root roles are
    /// reassigned to match.
    pub fn set_world(&self, world: World) -> CoreResult<bool> {
        {
            let mut current = self.world.write().unwrap();
            if !world.should_replace(&current) {
                return Ok(false);
            }
            *current = world;
        }
        for peer in self.peers.iter() {
            let is_root = self.is_root(*peer.key());
            let peer = peer.value();
            match (is_root, peer.role()) {
                (true, _) => peer.set_role(PeerRole::Root),
                (false, PeerRole::Root) => peer.set_role(PeerRole::Leaf),
                _ => {}
            }
        }
        Ok(true)
    }

    /// Drop expendable peers: dead paths pruned first, then idle leaves not
    /// referenced by any joined network.
    pub fn gc(&self, now: u64, config: &EngineConfig, referenced: &HashSet<Address>) {
        self.peers.retain(|address, peer| {
            peer.prune_dead_paths(now, config);
            if referenced.contains(address) {
                return true;
            }
            let drop = peer.expendable(now, config);
            if drop {
                debug!(peer = %address, "expiring idle peer");
            }
            !drop
        });
    }

    /// Record a host-provided local interface address
    pub fn add_local_interface(&self, address: SocketAddr, metric: u32, trust: AddressTrust) {
        let mut interfaces = self.local_interfaces.lock().unwrap();
        if !interfaces.iter().any(|i| i.address == address) {
            interfaces.push(LocalInterface {
                address,
                metric,
                trust,
            });
        }
    }

    /// Forget all local interface addresses
    pub fn clear_local_interfaces(&self) {
        self.local_interfaces.lock().unwrap().clear();
    }

    /// Local interface addresses worth advertising over PUSH_DIRECT_PATHS
    /// (privacy-trusted interfaces are never advertised).
    pub fn advertisable_interfaces(&self) -> Vec<SocketAddr> {
        self.local_interfaces
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.trust == AddressTrust::Normal)
            .map(|i| i.address)
            .collect()
    }
}
