//! Virtual networks
//!
//! Per-network membership state machine: configuration fetch from the
//! controller, certificate-of-membership gating of inbound frames, and the
//! multicast subscription set. The engine speaks Ethernet to the host
//! through the port callbacks; address assignment inside a config is
//! informational and installed (or not) by the host.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use ethermesh_crypto::Address;

use crate::config::EngineConfig;
use crate::membership::CertificateOfMembership;
use crate::multicast::MulticastGroup;
use crate::protocol::{Mac, MAX_ASSIGNED_ADDRESSES, MAX_MTU, MAX_NETWORK_MULTICAST_SUBSCRIPTIONS};

/// Membership status of a joined network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    RequestingConfiguration,
    Ok,
    AccessDenied,
    NotFound,
    PortError,
    ClientTooOld,
}

/// A static address assignment inside a network config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedAddress {
    pub ip: IpAddr,
    pub prefix_len: u8,
}

/// A network configuration as issued by a controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network_id: u64,
    pub timestamp: u64,
    pub name: String,
    pub is_public: bool,
    pub mtu: u16,
    pub enable_broadcast: bool,
    /// Cap on gathered subscribers per multicast group
    pub multicast_limit: u32,
    /// Permitted ethertypes; empty means all
    pub allowed_ethertypes: Vec<u16>,
    pub static_addresses: Vec<AssignedAddress>,
    /// Our certificate of membership; absent on public networks
    pub com: Option<CertificateOfMembership>,
}

impl NetworkConfig {
    /// The locally synthesized config for ad-hoc networks (controller
    /// address reserved, so there is nobody to ask).
    pub fn ad_hoc(network_id: u64) -> Self {
        Self {
            network_id,
            timestamp: 1,
            name: format!("adhoc-{:016x}", network_id),
            is_public: true,
            mtu: MAX_MTU as u16,
            enable_broadcast: true,
            multicast_limit: 32,
            allowed_ethertypes: Vec::new(),
            static_addresses: Vec::new(),
            com: None,
        }
    }

    /// Structural sanity checks on a received config
    pub fn validate(&self, network_id: u64) -> bool {
        self.network_id == network_id
            && self.mtu as usize <= MAX_MTU
            && self.mtu >= 68
            && self.static_addresses.len() <= MAX_ASSIGNED_ADDRESSES
            && (self.is_public || self.com.is_some())
    }
}

/// Verdict on an inbound frame from a given peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameGate {
    Accept,
    /// Drop, and tell the sender we need its membership certificate
    NeedCertificate,
    Drop,
}

/// State of one joined network
pub struct Network {
    id: u64,
    mac: Mac,
    status: Mutex<NetworkStatus>,
    config: RwLock<Option<NetworkConfig>>,
    memberships: Mutex<HashMap<Address, CertificateOfMembership>>,
    subscriptions: Mutex<HashSet<MulticastGroup>>,
    last_config_request: AtomicU64,
    last_like: AtomicU64,
    refresh_forced: AtomicBool,
}

impl Network {
    pub fn new(id: u64, our_address: Address) -> Self {
        Self {
            id,
            mac: Mac::from_address(our_address, id),
            status: Mutex::new(NetworkStatus::RequestingConfiguration),
            config: RwLock::new(None),
            memberships: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashSet::new()),
            last_config_request: AtomicU64::new(0),
            last_like: AtomicU64::new(0),
            refresh_forced: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Our deterministic MAC on this network
    pub fn mac(&self) -> Mac {
        self.mac
    }

    /// The controller is the node whose address is the top 40 bits
    pub fn controller_address(&self) -> Address {
        Address::from_u64(self.id >> 24)
    }

    /// Networks with a reserved controller address configure themselves
    pub fn is_ad_hoc(&self) -> bool {
        self.controller_address().is_reserved()
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: NetworkStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn config(&self) -> Option<NetworkConfig> {
        self.config.read().unwrap().clone()
    }

    /// Our own membership certificate, from the current config
    pub fn our_com(&self) -> Option<CertificateOfMembership> {
        self.config.read().unwrap().as_ref().and_then(|c| c.com.clone())
    }

    /// Timestamp of the config we hold, 0 for none
    pub fn config_timestamp(&self) -> u64 {
        self.config
            .read()
            .unwrap()
            .as_ref()
            .map(|c| c.timestamp)
            .unwrap_or(0)
    }

    /// Install a config. Returns true when it changed anything (drives the
    /// UP vs CONFIG_UPDATE port callback distinction at the node level).
    pub fn set_config(&self, config: NetworkConfig) -> bool {
        if !config.validate(self.id) {
            debug!(network = format_args!("{:016x}", self.id), "rejecting invalid config");
            return false;
        }
        let mut slot = self.config.write().unwrap();
        let changed = match slot.as_ref() {
            Some(existing) => existing.timestamp < config.timestamp,
            None => true,
        };
        if changed {
            *slot = Some(config);
            *self.status.lock().unwrap() = NetworkStatus::Ok;
        }
        changed
    }

    /// Whether a config request should go out now, pacing retries and
    /// refreshes separately.
    pub fn config_request_due(&self, now: u64, engine: &EngineConfig) -> bool {
        if self.is_ad_hoc() {
            return false;
        }
        if matches!(
            self.status(),
            NetworkStatus::AccessDenied | NetworkStatus::NotFound
        ) && !self.refresh_forced.load(Ordering::Relaxed)
        {
            // Denied networks re-poll at the slow refresh cadence only
            let last = self.last_config_request.load(Ordering::Relaxed);
            if now.saturating_sub(last) < engine.network_config_refresh_ms {
                return false;
            }
        }
        let interval = if self.refresh_forced.swap(false, Ordering::Relaxed) {
            0
        } else if self.config.read().unwrap().is_some() {
            engine.network_config_refresh_ms
        } else {
            engine.network_config_retry_ms
        };
        let last = self.last_config_request.load(Ordering::Relaxed);
        if last == 0 || now.saturating_sub(last) >= interval {
            self.last_config_request.store(now.max(1), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Controller asked us to re-fetch
    pub fn force_refresh(&self) {
        self.refresh_forced.store(true, Ordering::Relaxed);
    }

    /// Gate an inbound frame from `src` against membership policy
    pub fn gate_inbound_frame(&self, src: Address) -> FrameGate {
        let config = self.config.read().unwrap();
        let Some(config) = config.as_ref() else {
            return FrameGate::Drop;
        };
        if config.is_public {
            return FrameGate::Accept;
        }
        let Some(our_com) = config.com.as_ref() else {
            return FrameGate::Drop;
        };
        match self.memberships.lock().unwrap().get(&src) {
            Some(theirs) if theirs.agrees_with(our_com) => FrameGate::Accept,
            _ => FrameGate::NeedCertificate,
        }
    }

    /// Record a peer's pushed membership certificate. Structurally validated
    /// here; signature verification happens in the switch where the
    /// controller identity may be known.
    pub fn add_membership(&self, src: Address, com: CertificateOfMembership) -> bool {
        if com.network_id() != Some(self.id)
            || com.signed_by() != self.controller_address()
            || com.issued_to() != Some(src)
            || !com.is_signed()
        {
            return false;
        }
        self.memberships.lock().unwrap().insert(src, com);
        true
    }

    /// Addresses we hold certificates for
    pub fn members(&self) -> Vec<Address> {
        self.memberships.lock().unwrap().keys().copied().collect()
    }

    /// Whether an ethertype is permitted on this network
    pub fn ethertype_allowed(&self, ethertype: u16) -> bool {
        let config = self.config.read().unwrap();
        match config.as_ref() {
            Some(c) => c.allowed_ethertypes.is_empty() || c.allowed_ethertypes.contains(&ethertype),
            None => false,
        }
    }

    /// Per-group subscriber cap from the config
    pub fn multicast_limit(&self) -> usize {
        self.config
            .read()
            .unwrap()
            .as_ref()
            .map(|c| c.multicast_limit as usize)
            .unwrap_or(32)
    }

    /// Subscribe to a multicast group. Returns true when new.
    pub fn subscribe(&self, group: MulticastGroup) -> bool {
        let mut subs = self.subscriptions.lock().unwrap();
        if subs.len() >= MAX_NETWORK_MULTICAST_SUBSCRIPTIONS {
            return false;
        }
        subs.insert(group)
    }

    /// Unsubscribe from a group (or everything)
    pub fn unsubscribe(&self, group: Option<MulticastGroup>) {
        let mut subs = self.subscriptions.lock().unwrap();
        match group {
            Some(g) => {
                subs.remove(&g);
            }
            None => subs.clear(),
        }
    }

    pub fn subscriptions(&self) -> Vec<MulticastGroup> {
        self.subscriptions.lock().unwrap().iter().copied().collect()
    }

    pub fn is_subscribed(&self, group: &MulticastGroup) -> bool {
        self.subscriptions.lock().unwrap().contains(group)
    }

    /// Whether a MULTICAST_LIKE re-advertisement round is due
    pub fn like_due(&self, now: u64, engine: &EngineConfig) -> bool {
        let last = self.last_like.load(Ordering::Relaxed);
        if last == 0 || now.saturating_sub(last) >= engine.multicast_like_refresh_ms {
            self.last_like.store(now.max(1), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Reset LIKE pacing so the next tick re-advertises immediately
    pub fn mark_likes_stale(&self) {
        self.last_like.store(0, Ordering::Relaxed);
    }
}

/// If this is an IPv4 ARP request frame, extract the target protocol address
pub fn ipv4_arp_target(ethertype: u16, payload: &[u8]) -> Option<Ipv4Addr> {
    if ethertype != 0x0806 || payload.len() < 28 {
        return None;
    }
    // Ethernet/IPv4 ARP: htype 1, ptype 0x0800, hlen 6, plen 4
    if payload[0..2] != [0x00, 0x01]
        || payload[2..4] != [0x08, 0x00]
        || payload[4] != 6
        || payload[5] != 4
    {
        return None;
    }
    Some(Ipv4Addr::new(
        payload[24],
        payload[25],
        payload[26],
        payload[27],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethermesh_crypto::Identity;

    fn private_config(nwid: u64, member: Address, timestamp: u64) -> NetworkConfig {
        NetworkConfig {
            network_id: nwid,
            timestamp,
            name: "test-net".into(),
            is_public: false,
            mtu: 2800,
            enable_broadcast: true,
            multicast_limit: 32,
            allowed_ethertypes: vec![0x0800, 0x0806, 0x86dd],
            static_addresses: vec![],
            com: Some(CertificateOfMembership::for_member(
                timestamp, 60_000, nwid, member,
            )),
        }
    }

    #[test]
    fn test_mac_is_deterministic() {
        let addr = Address::from_u64(0x1122334455);
        let a = Network::new(0xaabbccddee000001, addr);
        let b = Network::new(0xaabbccddee000001, addr);
        assert_eq!(a.mac(), b.mac());
        assert_eq!(a.mac().to_address(a.id()), addr);
    }

    #[test]
    fn test_controller_address_is_top_40_bits() {
        let network = Network::new(0x1a2b3c4d5e000007, Address::from_u64(1));
        assert_eq!(network.controller_address(), Address::from_u64(0x1a2b3c4d5e));
        assert!(!network.is_ad_hoc());

        let adhoc = Network::new(0x0000000000000001, Address::from_u64(1));
        assert!(adhoc.is_ad_hoc());
    }

    #[test]
    fn test_config_lifecycle() {
        let me = Address::from_u64(0x1111111111);
        let nwid = 0x2222222222000001;
        let network = Network::new(nwid, me);

        assert_eq!(network.status(), NetworkStatus::RequestingConfiguration);
        assert!(network.set_config(private_config(nwid, me, 100)));
        assert_eq!(network.status(), NetworkStatus::Ok);

        // Older configs are ignored
        assert!(!network.set_config(private_config(nwid, me, 50)));
        // Newer replace
        assert!(network.set_config(private_config(nwid, me, 200)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let me = Address::from_u64(0x1111111111);
        let network = Network::new(0x2222222222000001, me);

        let mut wrong_net = private_config(0x3333333333000001, me, 100);
        assert!(!network.set_config(wrong_net.clone()));
        wrong_net.network_id = network.id();
        wrong_net.mtu = 60_000;
        assert!(!network.set_config(wrong_net));
    }

    #[test]
    fn test_public_network_accepts_anyone() {
        let network = Network::new(0x0000000000000001, Address::from_u64(1));
        assert!(network.set_config(NetworkConfig::ad_hoc(network.id())));
        assert_eq!(
            network.gate_inbound_frame(Address::from_u64(0x9999999999)),
            FrameGate::Accept
        );
    }

    #[test]
    fn test_private_network_gates_on_com() {
        let controller = Identity::generate();
        let nwid = (controller.address().as_u64() << 24) | 1;
        let me = Address::from_u64(0x1111111111);
        let them = Address::from_u64(0x9999999999);

        let network = Network::new(nwid, me);
        network.set_config(private_config(nwid, me, 1_000));

        // Unknown sender: need its certificate
        assert_eq!(network.gate_inbound_frame(them), FrameGate::NeedCertificate);

        // Sender pushes a compatible, controller-signed certificate
        let mut their_com = CertificateOfMembership::for_member(1_500, 60_000, nwid, them);
        their_com.sign(&controller).unwrap();
        assert!(network.add_membership(them, their_com));
        assert_eq!(network.gate_inbound_frame(them), FrameGate::Accept);
    }

    #[test]
    fn test_membership_for_wrong_network_rejected() {
        let controller = Identity::generate();
        let nwid = (controller.address().as_u64() << 24) | 1;
        let other_nwid = (controller.address().as_u64() << 24) | 2;
        let them = Address::from_u64(0x9999999999);

        let network = Network::new(nwid, Address::from_u64(1));
        let mut com = CertificateOfMembership::for_member(1, 60_000, other_nwid, them);
        com.sign(&controller).unwrap();
        assert!(!network.add_membership(them, com));
    }

    #[test]
    fn test_unconfigured_network_drops() {
        let network = Network::new(0x2222222222000001, Address::from_u64(1));
        assert_eq!(
            network.gate_inbound_frame(Address::from_u64(2)),
            FrameGate::Drop
        );
    }

    #[test]
    fn test_ethertype_gate() {
        let me = Address::from_u64(0x1111111111);
        let nwid = 0x2222222222000001;
        let network = Network::new(nwid, me);
        network.set_config(private_config(nwid, me, 100));

        assert!(network.ethertype_allowed(0x0800));
        assert!(!network.ethertype_allowed(0x88cc));
    }

    #[test]
    fn test_config_request_pacing() {
        let engine = EngineConfig::default();
        let network = Network::new(0x2222222222000001, Address::from_u64(1));

        assert!(network.config_request_due(10_000, &engine));
        assert!(!network.config_request_due(11_000, &engine));
        assert!(network.config_request_due(10_000 + engine.network_config_retry_ms, &engine));

        network.force_refresh();
        assert!(network.config_request_due(16_000, &engine));
    }

    #[test]
    fn test_subscription_set() {
        let network = Network::new(1, Address::from_u64(1));
        let group = MulticastGroup::broadcast();

        assert!(network.subscribe(group));
        assert!(!network.subscribe(group));
        assert!(network.is_subscribed(&group));

        network.unsubscribe(None);
        assert!(!network.is_subscribed(&group));
    }

    #[test]
    fn test_arp_target_extraction() {
        let mut arp = vec![
            0x00, 0x01, // htype ethernet
            0x08, 0x00, // ptype ipv4
            6, 4, // hlen, plen
            0x00, 0x01, // oper request
        ];
        arp.extend_from_slice(&[0x02; 6]); // sha
        arp.extend_from_slice(&[10, 0, 0, 1]); // spa
        arp.extend_from_slice(&[0x00; 6]); // tha
        arp.extend_from_slice(&[10, 0, 0, 42]); // tpa

        assert_eq!(
            ipv4_arp_target(0x0806, &arp),
            Some("10.0.0.42".parse().unwrap())
        );
        assert_eq!(ipv4_arp_target(0x0800, &arp), None);
        assert_eq!(ipv4_arp_target(0x0806, &arp[..20]), None);
    }
}
