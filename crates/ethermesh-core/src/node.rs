//! Node facade
//!
//! The one object hosts talk to. A node owns the topology, switch, joined
//! networks, multicaster and optional cluster, and is driven entirely by the
//! host: wire packets in, virtual frames in, a background tick, and queries.
//! All outward effects flow through the `HostHooks` callbacks. Every entry
//! point is safe to call from any thread; no call blocks on I/O.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, trace};

use ethermesh_crypto::{Address, Identity};

use crate::circuit::{CircuitTest, CircuitTestCallback, CircuitTestRegistry};
use crate::cluster::{Cluster, ClusterGeo, ClusterStatus, ClusterTransport, GeoLocator};
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::multicast::{MulticastGroup, Multicaster};
use crate::network::{ipv4_arp_target, Network, NetworkConfig, NetworkStatus};
use crate::path::Path;
use crate::peer::PeerRole;
use crate::protocol::Mac;
use crate::switch::Switch;
use crate::topology::{AddressTrust, Topology};
use crate::world::World;

/// Data store names for the persisted identity
const IDENTITY_SECRET_NAME: &str = "identity.secret";
const IDENTITY_PUBLIC_NAME: &str = "identity.public";

/// Engine version triple advertised in HELLO
pub const VERSION: (u16, u16, u16) = (0, 4, 1);

/// Host data store failure (missing objects are not failures)
#[derive(Debug, Clone, Copy)]
pub struct DataStoreError;

/// Node lifecycle and status events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Node constructed and ready
    Up,
    /// No upstream has been heard from recently
    Offline,
    /// At least one upstream is alive
    Online,
    /// Node is being torn down
    Down,
    /// An upstream reports another identity claiming our address
    IdentityCollision,
    /// Diagnostic message
    Trace(String),
}

/// Virtual network port lifecycle, delivered via `HostHooks::port_config`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualPortEvent {
    Up,
    ConfigUpdate,
    Down,
    Destroy,
}

/// Everything the engine needs from its host.
///
/// Callbacks may be invoked from any thread that calls into the engine and
/// are always invoked with no engine lock held. They must NOT re-enter
/// mutating engine calls (`join`, `leave`, `process_*`); queries are safe.
pub trait HostHooks: Send + Sync {
    /// Put a datagram on the wire. `local` of None lets the host pick the
    /// source address.
    fn wire_send(&self, local: Option<SocketAddr>, remote: SocketAddr, data: &[u8]);

    /// An Ethernet frame surfaced from a virtual network port
    fn virtual_frame(
        &self,
        network_id: u64,
        src: Mac,
        dest: Mac,
        ethertype: u16,
        vlan_id: u16,
        payload: &[u8],
    );

    /// Virtual port lifecycle; `config` accompanies Up and ConfigUpdate
    fn port_config(&self, network_id: u64, event: VirtualPortEvent, config: Option<&NetworkConfig>);

    /// Node events
    fn event(&self, event: Event);

    /// Fetch a named object. Ok(None) means missing; Err is fatal.
    fn data_get(&self, name: &str) -> Result<Option<Vec<u8>>, DataStoreError>;

    /// Store (or with None, delete) a named object. `secure` asks the host
    /// to restrict read access.
    fn data_put(&self, name: &str, data: Option<&[u8]>, secure: bool)
        -> Result<(), DataStoreError>;
}

/// Response from a network config master
pub enum ConfigResponse {
    Config(NetworkConfig),
    AccessDenied,
    NotFound,
}

/// Back-end for nodes that act as network controllers
pub trait ConfigMaster: Send + Sync {
    fn handle_config_request(
        &self,
        requester: Address,
        network_id: u64,
        metadata: &[u8],
    ) -> ConfigResponse;
}

/// Snapshot of node status
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub address: Address,
    pub public_identity: String,
    pub online: bool,
}

/// Snapshot of one peer for queries
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub address: Address,
    pub role: PeerRole,
    pub version: Option<(u16, u16, u16)>,
    pub latency_ms: u64,
    pub last_receive: u64,
    pub paths: Vec<Path>,
}

/// Snapshot of one joined network for queries
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub network_id: u64,
    pub status: NetworkStatus,
    pub mac: Mac,
    pub name: String,
    pub mtu: u16,
    pub bridge: bool,
    pub broadcast_enabled: bool,
    pub assigned_addresses: Vec<crate::network::AssignedAddress>,
    pub multicast_subscriptions: Vec<MulticastGroup>,
}

/// The embeddable engine
pub struct Node {
    identity: Arc<Identity>,
    config: EngineConfig,
    host: Arc<dyn HostHooks>,
    topology: Arc<Topology>,
    multicaster: Arc<Multicaster>,
    networks: Arc<RwLock<HashMap<u64, Arc<Network>>>>,
    controller: Arc<RwLock<Option<Arc<dyn ConfigMaster>>>>,
    circuit_tests: Arc<CircuitTestRegistry>,
    cluster: Arc<RwLock<Option<Arc<Cluster>>>>,
    switch: Switch,
    online: AtomicBool,
    next_deadline: AtomicU64,
}

impl Node {
    /// Construct a node: load or generate the identity through the data
    /// store, then stand the engine up around it.
    pub fn new(
        now: u64,
        host: Arc<dyn HostHooks>,
        config: EngineConfig,
        world: World,
    ) -> CoreResult<Arc<Node>> {
        config
            .validate()
            .map_err(CoreError::BadParameter)?;

        let identity = Arc::new(Self::load_or_generate_identity(host.as_ref())?);
        info!(address = %identity.address(), "node identity ready");

        let topology = Arc::new(Topology::new(identity.address(), world));
        let multicaster = Arc::new(Multicaster::new());
        let networks: Arc<RwLock<HashMap<u64, Arc<Network>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let controller: Arc<RwLock<Option<Arc<dyn ConfigMaster>>>> =
            Arc::new(RwLock::new(None));
        let circuit_tests = Arc::new(CircuitTestRegistry::new());
        let cluster: Arc<RwLock<Option<Arc<Cluster>>>> = Arc::new(RwLock::new(None));

        let switch = Switch::new(
            Arc::clone(&identity),
            VERSION,
            config.clone(),
            Arc::clone(&host),
            Arc::clone(&topology),
            Arc::clone(&multicaster),
            Arc::clone(&networks),
            Arc::clone(&controller),
            Arc::clone(&circuit_tests),
            Arc::clone(&cluster),
        );

        let node = Arc::new(Node {
            identity,
            config,
            host: Arc::clone(&host),
            topology,
            multicaster,
            networks,
            controller,
            circuit_tests,
            cluster,
            switch,
            online: AtomicBool::new(false),
            next_deadline: AtomicU64::new(now),
        });

        host.event(Event::Up);
        Ok(node)
    }

    fn load_or_generate_identity(host: &dyn HostHooks) -> CoreResult<Identity> {
        match host
            .data_get(IDENTITY_SECRET_NAME)
            .map_err(|_| CoreError::DataStoreFailed)?
        {
            Some(bytes) => {
                let text = String::from_utf8(bytes)
                    .map_err(|_| CoreError::BadParameter("stored identity not utf-8".into()))?;
                Ok(Identity::parse(&text)?)
            }
            None => {
                let identity = Identity::generate();
                host.data_put(
                    IDENTITY_SECRET_NAME,
                    Some(identity.to_text(true).as_bytes()),
                    true,
                )
                .map_err(|_| CoreError::DataStoreFailed)?;
                host.data_put(
                    IDENTITY_PUBLIC_NAME,
                    Some(identity.to_text(false).as_bytes()),
                    false,
                )
                .map_err(|_| CoreError::DataStoreFailed)?;
                Ok(identity)
            }
        }
    }

    /// Our 40-bit address
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /// Our identity, public half
    pub fn identity(&self) -> Identity {
        self.identity.public_clone()
    }

    /// Tear down: emit Down. The host must not race this with process calls.
    pub fn shutdown(&self) {
        let drained: Vec<u64> = self
            .networks
            .write()
            .unwrap()
            .drain()
            .map(|(id, _)| id)
            .collect();
        for network_id in drained {
            self.host
                .port_config(network_id, VirtualPortEvent::Destroy, None);
        }
        self.host.event(Event::Down);
    }

    // -----------------------------------------------------------------------
    // Packet and frame ingestion
    // -----------------------------------------------------------------------

    /// Feed in one wire datagram. Returns the next-deadline hint.
    pub fn process_wire_packet(
        &self,
        now: u64,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        data: &[u8],
    ) -> CoreResult<u64> {
        match self.switch.on_wire_packet(now, local, remote, data) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => trace!("wire packet dropped: {}", e),
        }
        Ok(self.deadline_hint(now))
    }

    /// Feed in one Ethernet frame from a virtual port. Returns the
    /// next-deadline hint.
    #[allow(clippy::too_many_arguments)]
    pub fn process_virtual_network_frame(
        &self,
        now: u64,
        network_id: u64,
        src: Mac,
        dest: Mac,
        ethertype: u16,
        vlan_id: u16,
        payload: &[u8],
    ) -> CoreResult<u64> {
        let network = self
            .networks
            .read()
            .unwrap()
            .get(&network_id)
            .cloned()
            .ok_or(CoreError::NetworkNotFound(network_id))?;

        if network.status() != NetworkStatus::Ok {
            trace!(
                network = format_args!("{:016x}", network_id),
                "frame before config, dropped"
            );
            return Ok(self.deadline_hint(now));
        }
        if !network.ethertype_allowed(ethertype) {
            return Ok(self.deadline_hint(now));
        }
        if let Some(config) = network.config() {
            if payload.len() > config.mtu as usize {
                trace!(len = payload.len(), mtu = config.mtu, "frame exceeds network MTU");
                return Ok(self.deadline_hint(now));
            }
        }

        if dest.is_multicast() {
            let group = match ipv4_arp_target(ethertype, payload) {
                Some(target) if dest.is_broadcast() => MulticastGroup::for_arp_target(target),
                _ => MulticastGroup::new(dest, 0),
            };
            if group.mac.is_broadcast()
                && !network
                    .config()
                    .map(|c| c.enable_broadcast)
                    .unwrap_or(false)
            {
                return Ok(self.deadline_hint(now));
            }
            self.switch
                .multicast_frame(now, &network, group, src, ethertype, payload)?;
            return Ok(self.deadline_hint(now));
        }

        let dest_addr = dest.to_address(network_id);
        if dest_addr == self.address() || dest_addr.is_reserved() {
            return Ok(self.deadline_hint(now));
        }

        if src == network.mac() {
            self.switch
                .send_frame(now, &network, dest_addr, ethertype, payload)?;
        } else {
            // Bridged traffic: carry the foreign MACs explicitly
            self.switch.send_ext_frame(
                now, &network, dest_addr, dest, src, ethertype, vlan_id, payload,
            )?;
        }
        Ok(self.deadline_hint(now))
    }

    // -----------------------------------------------------------------------
    // Background tick
    // -----------------------------------------------------------------------

    /// Advance every internal timer. Returns when it next wants to run;
    /// callers may call earlier, and calling again with the same `now` is a
    /// no-op.
    pub fn process_background_tasks(&self, now: u64) -> CoreResult<u64> {
        // (1) HELLO peers that are due, bootstrapping root contact from the
        // world's endpoints when no path exists yet.
        for (identity, endpoints) in self.topology.roots() {
            let peer = match self.topology.get_peer(identity.address()) {
                Some(peer) => peer,
                None => match self
                    .topology
                    .learn_identity(&self.identity, identity, now)
                {
                    Ok(peer) => peer,
                    Err(_) => continue,
                },
            };
            if peer.hello_due(now, &self.config) {
                let targets = if peer.has_alive_path(now, &self.config) {
                    peer.hello_endpoints(now, &self.config)
                } else {
                    endpoints
                };
                for endpoint in targets {
                    self.switch.send_hello(now, &peer, endpoint);
                }
            }
        }
        for peer in self.topology.peers() {
            if peer.role() != PeerRole::Root && peer.hello_due(now, &self.config) {
                for endpoint in peer.hello_endpoints(now, &self.config) {
                    self.switch.send_hello(now, &peer, endpoint);
                }
            }
        }

        // (2) Expire switch state and dead peers/paths
        self.switch.clean(now);
        let referenced = self.referenced_peers();
        self.topology.gc(now, &self.config, &referenced);

        // (3) Network configs
        let networks: Vec<Arc<Network>> =
            self.networks.read().unwrap().values().cloned().collect();
        for network in &networks {
            if network.is_ad_hoc() {
                if network.config_timestamp() == 0 {
                    let config = NetworkConfig::ad_hoc(network.id());
                    if network.set_config(config.clone()) {
                        self.host
                            .port_config(network.id(), VirtualPortEvent::Up, Some(&config));
                    }
                }
            } else if network.config_request_due(now, &self.config) {
                self.switch.request_network_config(now, network);
            }
        }

        // (4) Multicast subscription re-advertisement
        for network in &networks {
            if network.like_due(now, &self.config) {
                self.switch.send_likes(now, network);
            }
        }

        // (5) Age multicast member sets
        self.multicaster
            .age(now, self.config.multicast_member_expiry_ms);

        // (6) Cluster heartbeat and GC
        let cluster = self.cluster.read().unwrap().clone();
        if let Some(cluster) = cluster {
            cluster.heartbeat_if_due(now, &self.config);
            cluster.gc(now, &self.config);
        }

        // (7) Online state and the next deadline
        let online = self.topology.any_root_recent(now, &self.config);
        if online != self.online.swap(online, Ordering::Relaxed) {
            debug!(online, "online state changed");
            self.host.event(if online { Event::Online } else { Event::Offline });
        }

        let mut deadline = self.switch.next_deadline(now);
        if self.cluster.read().unwrap().is_some() {
            deadline = deadline.min(now + self.config.cluster_heartbeat_ms);
        }
        if networks
            .iter()
            .any(|n| !n.is_ad_hoc() && n.status() == NetworkStatus::RequestingConfiguration)
        {
            deadline = deadline.min(now + self.config.network_config_retry_ms);
        }
        self.next_deadline.store(deadline, Ordering::Relaxed);
        Ok(deadline)
    }

    /// Peers that must survive topology GC: controllers and certificate
    /// holders of joined networks.
    fn referenced_peers(&self) -> HashSet<Address> {
        let mut referenced = HashSet::new();
        for network in self.networks.read().unwrap().values() {
            referenced.insert(network.controller_address());
            for member in network.members() {
                referenced.insert(member);
            }
        }
        referenced
    }

    fn deadline_hint(&self, now: u64) -> u64 {
        let stored = self.next_deadline.load(Ordering::Relaxed);
        if stored <= now {
            now + self.config.whois_retry_ms
        } else {
            stored
        }
    }

    // -----------------------------------------------------------------------
    // Networks
    // -----------------------------------------------------------------------

    /// Join a network. Config fetch (or ad-hoc self-configuration) happens
    /// on the next background tick.
    pub fn join(&self, now: u64, network_id: u64) -> CoreResult<()> {
        if network_id == 0 {
            return Err(CoreError::BadParameter("network id 0".into()));
        }
        let network = {
            let mut networks = self.networks.write().unwrap();
            if networks.contains_key(&network_id) {
                return Ok(());
            }
            let network = Arc::new(Network::new(network_id, self.address()));
            networks.insert(network_id, Arc::clone(&network));
            network
        };
        info!(network = format_args!("{:016x}", network_id), "joining network");

        network.subscribe(MulticastGroup::broadcast());
        if !network.is_ad_hoc() && network.config_request_due(now, &self.config) {
            self.switch.request_network_config(now, &network);
        }
        Ok(())
    }

    /// Leave a network; the port is destroyed and its state forgotten
    pub fn leave(&self, network_id: u64) -> CoreResult<()> {
        let removed = self.networks.write().unwrap().remove(&network_id);
        match removed {
            Some(_) => {
                info!(network = format_args!("{:016x}", network_id), "leaving network");
                self.multicaster.forget_network(network_id);
                self.host
                    .port_config(network_id, VirtualPortEvent::Destroy, None);
                Ok(())
            }
            None => Err(CoreError::NetworkNotFound(network_id)),
        }
    }

    /// Subscribe to a multicast group and advertise it right away
    pub fn multicast_subscribe(
        &self,
        now: u64,
        network_id: u64,
        mac: Mac,
        adi: u32,
    ) -> CoreResult<()> {
        let network = self
            .networks
            .read()
            .unwrap()
            .get(&network_id)
            .cloned()
            .ok_or(CoreError::NetworkNotFound(network_id))?;
        if mac.as_u64() == 0 {
            return Err(CoreError::BadParameter("subscribe needs a group MAC".into()));
        }
        if network.subscribe(MulticastGroup::new(mac, adi)) {
            self.switch.send_likes(now, &network);
        }
        Ok(())
    }

    /// Unsubscribe from a group; mac 0 and adi 0 drop every subscription
    pub fn multicast_unsubscribe(&self, network_id: u64, mac: Mac, adi: u32) -> CoreResult<()> {
        let network = self
            .networks
            .read()
            .unwrap()
            .get(&network_id)
            .cloned()
            .ok_or(CoreError::NetworkNotFound(network_id))?;
        if mac.as_u64() == 0 && adi == 0 {
            network.unsubscribe(None);
        } else {
            network.unsubscribe(Some(MulticastGroup::new(mac, adi)));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            address: self.address(),
            public_identity: self.identity.to_text(false),
            online: self.online.load(Ordering::Relaxed),
        }
    }

    pub fn peers(&self) -> Vec<PeerStatus> {
        let mut out: Vec<PeerStatus> = self
            .topology
            .peers()
            .into_iter()
            .map(|p| PeerStatus {
                address: p.address(),
                role: p.role(),
                version: p.version(),
                latency_ms: p.latency_ms(),
                last_receive: p.last_receive(),
                paths: p.paths(),
            })
            .collect();
        out.sort_by_key(|p| p.address);
        out
    }

    pub fn networks(&self) -> Vec<NetworkInfo> {
        let mut out: Vec<NetworkInfo> = self
            .networks
            .read()
            .unwrap()
            .values()
            .map(|n| self.network_info(n))
            .collect();
        out.sort_by_key(|n| n.network_id);
        out
    }

    pub fn network_config(&self, network_id: u64) -> Option<NetworkInfo> {
        self.networks
            .read()
            .unwrap()
            .get(&network_id)
            .map(|n| self.network_info(n))
    }

    fn network_info(&self, network: &Arc<Network>) -> NetworkInfo {
        let config = network.config();
        NetworkInfo {
            network_id: network.id(),
            status: network.status(),
            mac: network.mac(),
            name: config.as_ref().map(|c| c.name.clone()).unwrap_or_default(),
            mtu: config.as_ref().map(|c| c.mtu).unwrap_or(0),
            bridge: false,
            broadcast_enabled: config
                .as_ref()
                .map(|c| c.enable_broadcast)
                .unwrap_or(false),
            assigned_addresses: config
                .as_ref()
                .map(|c| c.static_addresses.clone())
                .unwrap_or_default(),
            multicast_subscriptions: network.subscriptions(),
        }
    }

    // -----------------------------------------------------------------------
    // Configuration surface
    // -----------------------------------------------------------------------

    pub fn add_local_interface_address(
        &self,
        address: SocketAddr,
        metric: u32,
        trust: AddressTrust,
    ) {
        self.topology.add_local_interface(address, metric, trust);
    }

    pub fn clear_local_interface_addresses(&self) {
        self.topology.clear_local_interfaces();
    }

    /// Install (or remove) the controller back-end on this node
    pub fn set_netconf_master(&self, master: Option<Arc<dyn ConfigMaster>>) {
        *self.controller.write().unwrap() = master;
    }

    /// Offer a new world; accepted only if signed and newer
    pub fn set_world(&self, world: World) -> CoreResult<bool> {
        let timestamp = world.timestamp;
        let accepted = self.topology.set_world(world)?;
        if accepted {
            self.host.event(Event::Trace(format!(
                "world updated, timestamp {}",
                timestamp
            )));
        }
        Ok(accepted)
    }

    // -----------------------------------------------------------------------
    // Circuit tests
    // -----------------------------------------------------------------------

    /// Register and launch a circuit test we originate
    pub fn circuit_test_begin(
        &self,
        now: u64,
        test: &CircuitTest,
        callback: CircuitTestCallback,
    ) -> CoreResult<()> {
        test.validate(self.address())?;
        self.circuit_tests.register(test.test_id, callback);
        self.switch.originate_circuit_test(now, test)
    }

    /// Stop listening for a test's reports
    pub fn circuit_test_end(&self, test_id: u64) {
        self.circuit_tests.unregister(test_id);
    }

    // -----------------------------------------------------------------------
    // Cluster
    // -----------------------------------------------------------------------

    /// Turn this node into a cluster member
    #[allow(clippy::too_many_arguments)]
    pub fn cluster_init(
        &self,
        my_id: u16,
        secret: &[u8],
        endpoints: Vec<SocketAddr>,
        geo: ClusterGeo,
        transport: Arc<dyn ClusterTransport>,
        locator: Option<GeoLocator>,
    ) -> CoreResult<()> {
        let cluster = Cluster::new(my_id, secret, endpoints, geo, transport, locator)?;
        *self.cluster.write().unwrap() = Some(Arc::new(cluster));
        Ok(())
    }

    pub fn cluster_add_member(&self, id: u16) -> CoreResult<()> {
        match self.cluster.read().unwrap().as_ref() {
            Some(cluster) => cluster.add_member(id),
            None => Err(CoreError::UnsupportedOperation("cluster not initialized".into())),
        }
    }

    pub fn cluster_remove_member(&self, id: u16) -> CoreResult<()> {
        match self.cluster.read().unwrap().as_ref() {
            Some(cluster) => {
                cluster.remove_member(id);
                Ok(())
            }
            None => Err(CoreError::UnsupportedOperation("cluster not initialized".into())),
        }
    }

    /// Feed in a backplane message received by the host
    pub fn cluster_handle_incoming_message(&self, now: u64, data: &[u8]) -> CoreResult<()> {
        match self.switch.on_cluster_message(now, data) {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                trace!("cluster message dropped: {}", e);
                Ok(())
            }
        }
    }

    pub fn cluster_status(&self, now: u64) -> CoreResult<ClusterStatus> {
        match self.cluster.read().unwrap().as_ref() {
            Some(cluster) => Ok(cluster.status(now)),
            None => Err(CoreError::UnsupportedOperation("cluster not initialized".into())),
        }
    }
}
