//! The switch: VL1 packet pump
//!
//! Inbound wire datagrams come in here, get reassembled, deduplicated,
//! authenticated and dispatched to verb handlers; outbound verbs get
//! serialized, armored, fragmented and pushed to the host's wire-send
//! callback over the best available path. Unknown senders are parked while
//! a WHOIS resolves; peers with no direct path are reached through a root
//! relay, which in turn tries to rendezvous the two sides into a direct
//! path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use ethermesh_crypto::{Address, Identity};

use crate::circuit::{CircuitTestRegistry, CircuitTestReport};
use crate::cluster::{Cluster, ClusterAction};
use crate::config::EngineConfig;
use crate::error::CoreResult;
use crate::multicast::{MulticastGroup, Multicaster};
use crate::network::{FrameGate, Network};
use crate::node::{ConfigMaster, ConfigResponse, Event, HostHooks, VirtualPortEvent};
use crate::packet::{
    self, bump_hops, is_fragment, split_fragments, Cipher, Fragment, Packet, MIN_PACKET_SIZE,
};
use crate::peer::{Peer, PeerRole, QueuedPacket};
use crate::protocol::{
    self, decode_body, encode_body, CircuitTestBody, ErrorBody, ErrorCode, ExtFrameBody,
    FrameBody, HelloBody, Mac, MulticastFrameBody, MulticastGatherBody, MulticastLikeBody,
    NetworkConfigRefreshBody, NetworkConfigRequestBody, OkBody, OkPayload, PushDirectPathsBody,
    RendezvousBody, Verb, WhoisBody, MAX_FRAGMENTS, PROTOCOL_VERSION,
};
use crate::topology::Topology;

/// Endpoints accepted from one PUSH_DIRECT_PATHS
const MAX_PUSHED_PATHS: usize = 8;

/// A lookup in flight: packets parked until the identity arrives
struct WhoisEntry {
    parked_wire: Vec<(Option<SocketAddr>, SocketAddr, Vec<u8>)>,
    parked_send: Vec<QueuedPacket>,
    last_sent: u64,
    created: u64,
}

/// Fragments of one packet waiting for completion
struct ReassemblySlot {
    head: Option<Vec<u8>>,
    fragments: [Option<Bytes>; MAX_FRAGMENTS],
    total: u8,
    created: u64,
}

impl ReassemblySlot {
    fn new(now: u64) -> Self {
        Self {
            head: None,
            fragments: Default::default(),
            total: 0,
            created: now,
        }
    }

    fn complete(&self) -> bool {
        self.head.is_some()
            && self.total >= 2
            && (1..self.total).all(|i| self.fragments[i as usize].is_some())
    }

    fn assemble(mut self) -> Vec<u8> {
        let mut raw = self.head.take().unwrap();
        for i in 1..self.total {
            raw.extend_from_slice(&self.fragments[i as usize].take().unwrap());
        }
        raw
    }
}

/// The packet pump
pub struct Switch {
    identity: Arc<Identity>,
    version: (u16, u16, u16),
    config: EngineConfig,
    host: Arc<dyn HostHooks>,
    topology: Arc<Topology>,
    multicaster: Arc<Multicaster>,
    networks: Arc<RwLock<HashMap<u64, Arc<Network>>>>,
    controller: Arc<RwLock<Option<Arc<dyn ConfigMaster>>>>,
    circuit_tests: Arc<CircuitTestRegistry>,
    cluster: Arc<RwLock<Option<Arc<Cluster>>>>,
    whois: Mutex<HashMap<Address, WhoisEntry>>,
    dedup: Mutex<HashMap<(Address, u64), u64>>,
    reassembly: Mutex<HashMap<(SocketAddr, u64), ReassemblySlot>>,
    recent_unites: Mutex<HashMap<(Address, Address), u64>>,
    recent_path_pushes: Mutex<HashMap<Address, u64>>,
    packet_counter: AtomicU64,
}

impl Switch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<Identity>,
        version: (u16, u16, u16),
        config: EngineConfig,
        host: Arc<dyn HostHooks>,
        topology: Arc<Topology>,
        multicaster: Arc<Multicaster>,
        networks: Arc<RwLock<HashMap<u64, Arc<Network>>>>,
        controller: Arc<RwLock<Option<Arc<dyn ConfigMaster>>>>,
        circuit_tests: Arc<CircuitTestRegistry>,
        cluster: Arc<RwLock<Option<Arc<Cluster>>>>,
    ) -> Self {
        Self {
            identity,
            version,
            config,
            host,
            topology,
            multicaster,
            networks,
            controller,
            circuit_tests,
            cluster,
            whois: Mutex::new(HashMap::new()),
            dedup: Mutex::new(HashMap::new()),
            reassembly: Mutex::new(HashMap::new()),
            recent_unites: Mutex::new(HashMap::new()),
            recent_path_pushes: Mutex::new(HashMap::new()),
            packet_counter: AtomicU64::new(rand::random()),
        }
    }

    fn self_address(&self) -> Address {
        self.identity.address()
    }

    fn next_packet_id(&self) -> u64 {
        self.packet_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn network(&self, network_id: u64) -> Option<Arc<Network>> {
        self.networks.read().unwrap().get(&network_id).cloned()
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Entry point for every wire datagram the host receives
    pub fn on_wire_packet(
        &self,
        now: u64,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        data: &[u8],
    ) -> CoreResult<()> {
        if is_fragment(data) {
            return self.on_fragment(now, remote, data);
        }
        if data.len() < MIN_PACKET_SIZE {
            trace!(len = data.len(), "runt datagram dropped");
            return Ok(());
        }

        let dest = packet::peek_dest(data);
        let src = packet::peek_source(data);
        if src.is_reserved() || src == self.self_address() {
            return Ok(());
        }

        if dest != self.self_address() {
            self.relay(now, data);
            return Ok(());
        }

        // Cluster ownership: packets from peers owned by a sibling are
        // shipped over the backplane instead of being processed here.
        let cluster = self.cluster.read().unwrap().clone();
        if let Some(cluster) = cluster {
            if !cluster.note_peer_contact(now, src) {
                cluster.relay_to_owner(src, remote, data);
                return Ok(());
            }
            // Hand the peer to a geographically closer sibling when the
            // host gave us a locator; the peer learns the sibling's
            // endpoints and drifts over on its own.
            if let Some(endpoints) = cluster.better_sibling_endpoints(now, src, remote) {
                if let Ok(body) = encode_body(&PushDirectPathsBody { endpoints }) {
                    let _ = self.send(now, src, Verb::PushDirectPaths, body, true);
                }
            }
        }

        if Packet::is_flagged_fragmented(data) {
            let mut reassembly = self.reassembly.lock().unwrap();
            let slot = reassembly
                .entry((remote, packet::peek_packet_id(data)))
                .or_insert_with(|| ReassemblySlot::new(now));
            slot.head = Some(data.to_vec());
            if slot.complete() {
                let key = (remote, packet::peek_packet_id(data));
                let raw = reassembly.remove(&key).unwrap().assemble();
                drop(reassembly);
                return self.receive_head(now, local, remote, &raw);
            }
            return Ok(());
        }

        self.receive_head(now, local, remote, data)
    }

    fn on_fragment(&self, now: u64, remote: SocketAddr, data: &[u8]) -> CoreResult<()> {
        let Ok(fragment) = Fragment::decode(data) else {
            return Ok(());
        };

        if fragment.dest != self.self_address() {
            self.relay_fragment(now, fragment, data);
            return Ok(());
        }

        let key = (remote, fragment.packet_id);
        let mut reassembly = self.reassembly.lock().unwrap();
        let slot = reassembly
            .entry(key)
            .or_insert_with(|| ReassemblySlot::new(now));
        slot.total = fragment.total_fragments;
        // Duplicates overwrite
        slot.fragments[fragment.fragment_no as usize] = Some(fragment.payload);

        if slot.complete() {
            let raw = reassembly.remove(&key).unwrap().assemble();
            drop(reassembly);
            // A reassembled head has no single ingress tuple; the head's
            // arrival already learned the path.
            return self.receive_head(now, None, remote, &raw);
        }
        Ok(())
    }

    /// A whole packet addressed to us: authenticate, dedup and dispatch
    fn receive_head(
        &self,
        now: u64,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        raw: &[u8],
    ) -> CoreResult<()> {
        let src = packet::peek_source(raw);

        let Some(peer) = self.topology.get_peer(src) else {
            return self.receive_from_unknown(now, local, remote, raw);
        };

        let packet = match Packet::decode(raw, peer.key()) {
            Ok(packet) => packet,
            Err(_) => {
                trace!(src = %src, "authentication failed, dropped");
                return Ok(());
            }
        };

        if self.seen_before(now, src, packet.id) {
            return Ok(());
        }

        peer.received(local, remote, now);
        self.dispatch(now, &peer, local, remote, packet)?;
        self.flush_queue(now, &peer);
        Ok(())
    }

    /// Unknown source: a cleartext HELLO teaches us the identity inline,
    /// anything else is parked behind a WHOIS.
    fn receive_from_unknown(
        &self,
        now: u64,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        raw: &[u8],
    ) -> CoreResult<()> {
        let src = packet::peek_source(raw);

        let is_clear_hello = packet::peek_cipher(raw)
            .map(|c| c == Cipher::Cleartext)
            .unwrap_or(false)
            && packet::peek_verb_raw(raw) == Verb::Hello as u8;

        if is_clear_hello {
            // Identity deserialization re-validates the proof of work
            let Ok(hello) = decode_body::<HelloBody>(&raw[MIN_PACKET_SIZE..]) else {
                return Ok(());
            };
            if hello.identity.address() != src {
                return Ok(());
            }
            let peer = match self
                .topology
                .learn_identity(&self.identity, hello.identity.clone(), now)
            {
                Ok(peer) => peer,
                Err(_) => {
                    // A different identity already owns this address; tell
                    // the claimant and keep the first one.
                    self.reply_collision(local, remote, raw, &hello.identity);
                    return Ok(());
                }
            };

            // MAC still has to verify under the freshly agreed key
            let Ok(packet) = Packet::decode(raw, peer.key()) else {
                return Ok(());
            };
            if self.seen_before(now, src, packet.id) {
                return Ok(());
            }
            peer.received(local, remote, now);
            self.handle_hello(now, &peer, local, remote, &packet, hello);
            self.flush_queue(now, &peer);
            return Ok(());
        }

        trace!(src = %src, "parking packet from unknown source");
        self.park_wire(now, src, (local, remote, raw.to_vec()));
        Ok(())
    }

    /// A colliding HELLO gets an ERROR armored under the claimed identity's
    /// key so the remote can actually read it.
    fn reply_collision(
        &self,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        raw: &[u8],
        claimed: &Identity,
    ) {
        let Ok(shared) = self.identity.agree(claimed) else {
            return;
        };
        let Ok(body) = encode_body(&ErrorBody {
            in_re_verb: Verb::Hello as u8,
            in_re_packet_id: packet::peek_packet_id(raw),
            code: ErrorCode::IdentityCollision,
            network_id: None,
        }) else {
            return;
        };
        let packet = Packet::new_cleartext(
            self.next_packet_id(),
            claimed.address(),
            self.self_address(),
            Verb::Error,
            body,
        );
        if let Ok(reply) = packet.encode(&shared.packet_key()) {
            self.host.wire_send(local, remote, &reply);
        }
    }

    /// Exactly-once per packet ID within the dedup window
    fn seen_before(&self, now: u64, src: Address, packet_id: u64) -> bool {
        let mut dedup = self.dedup.lock().unwrap();
        match dedup.get(&(src, packet_id)) {
            Some(seen) if now.saturating_sub(*seen) <= self.config.dedup_ms => true,
            _ => {
                dedup.insert((src, packet_id), now);
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Relaying
    // -----------------------------------------------------------------------

    /// Forward a packet not addressed to us, then try to introduce the two
    /// endpoints to each other.
    fn relay(&self, now: u64, data: &[u8]) {
        let mut raw = data.to_vec();
        if bump_hops(&mut raw).is_none() {
            trace!("relay hop limit reached, dropped");
            return;
        }
        let dest = packet::peek_dest(&raw);
        let src = packet::peek_source(&raw);

        let target = self
            .topology
            .get_peer(dest)
            .filter(|p| p.has_alive_path(now, &self.config));
        match target {
            Some(peer) => {
                if let Some(path) = peer.best_path(now, &self.config) {
                    self.host.wire_send(path.local, path.remote, &raw);
                    peer.sent(path.remote, now);
                    self.try_unite(now, src, dest);
                }
            }
            None => {
                // Not ours to deliver; hand it upstream, hops bound the walk
                if let Some(root) = self.topology.best_root(now, &self.config) {
                    if root.address() != src && root.address() != self.self_address() {
                        if let Some(path) = root.best_path(now, &self.config) {
                            self.host.wire_send(path.local, path.remote, &raw);
                            root.sent(path.remote, now);
                        }
                    }
                }
            }
        }
    }

    fn relay_fragment(&self, now: u64, fragment: Fragment, data: &[u8]) {
        if fragment.hops >= protocol::MAX_HOPS {
            return;
        }
        let Some(peer) = self
            .topology
            .get_peer(fragment.dest)
            .filter(|p| p.has_alive_path(now, &self.config))
        else {
            return;
        };
        if let Some(path) = peer.best_path(now, &self.config) {
            let mut raw = data.to_vec();
            raw[15] = ((fragment.hops + 1) & 0b111) << 5;
            self.host.wire_send(path.local, path.remote, &raw);
        }
    }

    /// RENDEZVOUS both sides of a relayed conversation at each other's
    /// observed endpoints, rate-limited per pair.
    fn try_unite(&self, now: u64, a: Address, b: Address) {
        if a == b || a.is_reserved() || b.is_reserved() {
            return;
        }
        let pair = if a < b { (a, b) } else { (b, a) };
        {
            let mut unites = self.recent_unites.lock().unwrap();
            match unites.get(&pair) {
                Some(last) if now.saturating_sub(*last) < self.config.unite_interval_ms => return,
                _ => {
                    unites.insert(pair, now);
                }
            }
        }

        let (Some(peer_a), Some(peer_b)) =
            (self.topology.get_peer(a), self.topology.get_peer(b))
        else {
            return;
        };
        let (Some(path_a), Some(path_b)) = (
            peer_a.best_path(now, &self.config),
            peer_b.best_path(now, &self.config),
        ) else {
            return;
        };

        debug!(a = %a, b = %b, "uniting peers for a direct path");
        self.host
            .event(Event::Trace(format!("rendezvous initiated {} <> {}", a, b)));
        let to_a = RendezvousBody {
            peer: b,
            endpoint: path_b.remote,
        };
        let to_b = RendezvousBody {
            peer: a,
            endpoint: path_a.remote,
        };
        if let Ok(body) = encode_body(&to_a) {
            let _ = self.send(now, a, Verb::Rendezvous, body, true);
        }
        if let Ok(body) = encode_body(&to_b) {
            let _ = self.send(now, b, Verb::Rendezvous, body, true);
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Send a verb to a destination, queueing or relaying as needed
    pub fn send(
        &self,
        now: u64,
        dest: Address,
        verb: Verb,
        payload: Vec<u8>,
        encrypt: bool,
    ) -> CoreResult<()> {
        if dest == self.self_address() || dest.is_reserved() {
            return Ok(());
        }
        match self.topology.get_peer(dest) {
            Some(peer) => self.send_to_peer(now, &peer, verb, Bytes::from(payload), encrypt),
            None => {
                // A sibling may already hold this peer's connection
                if let Some(cluster) = self.cluster.read().unwrap().clone() {
                    cluster.want_peer(dest);
                }
                self.park_send(
                    now,
                    dest,
                    QueuedPacket {
                        verb,
                        payload: Bytes::from(payload),
                        encrypt,
                        queued_at: now,
                    },
                );
                Ok(())
            }
        }
    }

    fn send_to_peer(
        &self,
        now: u64,
        peer: &Arc<Peer>,
        verb: Verb,
        payload: Bytes,
        encrypt: bool,
    ) -> CoreResult<()> {
        if let Some(path) = peer.best_path(now, &self.config) {
            return self.transmit(now, peer, verb, payload, encrypt, path.local, path.remote);
        }

        // No direct path: relay through the best root, destination intact
        let relay = self
            .topology
            .best_root(now, &self.config)
            .filter(|r| r.address() != peer.address() && r.has_alive_path(now, &self.config));
        if let Some(root) = relay {
            if let Some(path) = root.best_path(now, &self.config) {
                let packet = self.build_packet(peer, verb, payload, encrypt);
                let raw = packet.encode(peer.key())?;
                for piece in split_fragments(raw)? {
                    self.host.wire_send(path.local, path.remote, &piece);
                }
                root.sent(path.remote, now);
                return Ok(());
            }
        }

        trace!(dest = %peer.address(), "no path and no relay, queueing");
        peer.queue_packet(
            QueuedPacket {
                verb,
                payload,
                encrypt,
                queued_at: now,
            },
            &self.config,
        );
        Ok(())
    }

    fn build_packet(&self, peer: &Peer, verb: Verb, payload: Bytes, encrypt: bool) -> Packet {
        let id = self.next_packet_id();
        if encrypt {
            Packet::new(id, peer.address(), self.self_address(), verb, payload)
        } else {
            Packet::new_cleartext(id, peer.address(), self.self_address(), verb, payload)
        }
    }

    fn transmit(
        &self,
        now: u64,
        peer: &Peer,
        verb: Verb,
        payload: Bytes,
        encrypt: bool,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> CoreResult<()> {
        let packet = self.build_packet(peer, verb, payload, encrypt);
        let raw = packet.encode(peer.key())?;
        for piece in split_fragments(raw)? {
            self.host.wire_send(local, remote, &piece);
        }
        peer.sent(remote, now);
        Ok(())
    }

    /// Drain a peer's parked queue once it has a usable path
    fn flush_queue(&self, now: u64, peer: &Arc<Peer>) {
        if !peer.has_alive_path(now, &self.config) {
            return;
        }
        for queued in peer.drain_queue() {
            let _ =
                self.send_to_peer(now, peer, queued.verb, queued.payload, queued.encrypt);
        }
    }

    /// HELLO a specific endpoint of a known peer (bootstrap, keepalive,
    /// rendezvous punch)
    pub fn send_hello(&self, now: u64, peer: &Arc<Peer>, endpoint: SocketAddr) {
        let Ok(body) = encode_body(&HelloBody {
            protocol_version: PROTOCOL_VERSION,
            version: self.version,
            timestamp: now,
            identity: self.identity.public_clone(),
        }) else {
            return;
        };
        let packet = Packet::new_cleartext(
            self.next_packet_id(),
            peer.address(),
            self.self_address(),
            Verb::Hello,
            body,
        );
        let Ok(raw) = packet.encode(peer.key()) else {
            return;
        };
        self.host.wire_send(None, endpoint, &raw);
        peer.sent(endpoint, now);
        peer.record_hello_sent(now);
    }

    // -----------------------------------------------------------------------
    // WHOIS
    // -----------------------------------------------------------------------

    fn park_wire(&self, now: u64, addr: Address, item: (Option<SocketAddr>, SocketAddr, Vec<u8>)) {
        let mut whois = self.whois.lock().unwrap();
        let entry = whois.entry(addr).or_insert(WhoisEntry {
            parked_wire: Vec::new(),
            parked_send: Vec::new(),
            last_sent: 0,
            created: now,
        });
        entry.parked_wire.push(item);
        let due = now.saturating_sub(entry.last_sent) >= self.config.whois_retry_ms;
        if due {
            entry.last_sent = now;
        }
        drop(whois);
        if due {
            self.send_whois(now, addr);
        }
    }

    fn park_send(&self, now: u64, addr: Address, packet: QueuedPacket) {
        let mut whois = self.whois.lock().unwrap();
        let entry = whois.entry(addr).or_insert(WhoisEntry {
            parked_wire: Vec::new(),
            parked_send: Vec::new(),
            last_sent: 0,
            created: now,
        });
        entry.parked_send.push(packet);
        let due = now.saturating_sub(entry.last_sent) >= self.config.whois_retry_ms;
        if due {
            entry.last_sent = now;
        }
        drop(whois);
        if due {
            self.send_whois(now, addr);
        }
    }

    fn send_whois(&self, now: u64, addr: Address) {
        let Some(root) = self.topology.best_root(now, &self.config) else {
            return;
        };
        if let Ok(body) = encode_body(&WhoisBody { address: addr }) {
            let _ = self.send_to_peer(now, &root, Verb::Whois, Bytes::from(body), true);
        }
    }

    /// An identity arrived (OK(WHOIS) or HELLO): replay whatever waited on it
    fn unpark(&self, now: u64, addr: Address) {
        let Some(entry) = self.whois.lock().unwrap().remove(&addr) else {
            return;
        };
        for (local, remote, raw) in entry.parked_wire {
            let _ = self.on_wire_packet(now, local, remote, &raw);
        }
        for queued in entry.parked_send {
            let _ = self.send(
                now,
                addr,
                queued.verb,
                queued.payload.to_vec(),
                queued.encrypt,
            );
        }
    }

    // -----------------------------------------------------------------------
    // Verb dispatch
    // -----------------------------------------------------------------------

    fn dispatch(
        &self,
        now: u64,
        peer: &Arc<Peer>,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        packet: Packet,
    ) -> CoreResult<()> {
        trace!(src = %peer.address(), verb = ?packet.verb, "dispatch");
        match packet.verb {
            Verb::Nop => {}
            Verb::Hello => {
                if let Ok(body) = decode_body::<HelloBody>(&packet.payload) {
                    if body.identity.address() == peer.address() {
                        self.handle_hello(now, peer, local, remote, &packet, body);
                    }
                }
            }
            Verb::Ok => {
                if let Ok(body) = decode_body::<OkBody>(&packet.payload) {
                    self.handle_ok(now, peer, body);
                }
            }
            Verb::Error => {
                if let Ok(body) = decode_body::<ErrorBody>(&packet.payload) {
                    self.handle_error(now, peer, body);
                }
            }
            Verb::Whois => {
                if let Ok(body) = decode_body::<WhoisBody>(&packet.payload) {
                    self.handle_whois(now, peer, local, remote, &packet, body);
                }
            }
            Verb::Rendezvous => {
                if let Ok(body) = decode_body::<RendezvousBody>(&packet.payload) {
                    self.handle_rendezvous(now, peer, body);
                }
            }
            Verb::Frame => {
                if let Ok(body) = decode_body::<FrameBody>(&packet.payload) {
                    self.handle_frame(now, peer, local, remote, &packet, body);
                }
            }
            Verb::ExtFrame => {
                if let Ok(body) = decode_body::<ExtFrameBody>(&packet.payload) {
                    self.handle_ext_frame(now, peer, local, remote, &packet, body);
                }
            }
            Verb::Echo => {
                self.send_ok(
                    now,
                    peer,
                    local,
                    remote,
                    &packet,
                    OkPayload::Echo {
                        data: packet.payload.to_vec(),
                    },
                );
            }
            Verb::MulticastLike => {
                if let Ok(body) = decode_body::<MulticastLikeBody>(&packet.payload) {
                    self.handle_multicast_like(now, peer, body);
                }
            }
            Verb::MulticastGather => {
                if let Ok(body) = decode_body::<MulticastGatherBody>(&packet.payload) {
                    self.handle_multicast_gather(now, peer, local, remote, &packet, body);
                }
            }
            Verb::MulticastFrame => {
                if let Ok(body) = decode_body::<MulticastFrameBody>(&packet.payload) {
                    self.handle_multicast_frame(now, peer, local, remote, &packet, body);
                }
            }
            Verb::NetworkConfigRequest => {
                if let Ok(body) = decode_body::<NetworkConfigRequestBody>(&packet.payload) {
                    self.handle_config_request(now, peer, local, remote, &packet, body);
                }
            }
            Verb::NetworkConfigRefresh => {
                if let Ok(body) = decode_body::<NetworkConfigRefreshBody>(&packet.payload) {
                    if let Some(network) = self.network(body.network_id) {
                        if network.controller_address() == peer.address() {
                            network.force_refresh();
                        }
                    }
                }
            }
            Verb::PushDirectPaths => {
                if let Ok(body) = decode_body::<PushDirectPathsBody>(&packet.payload) {
                    self.handle_push_direct_paths(now, peer, body);
                }
            }
            Verb::CircuitTest => {
                if let Ok(body) = decode_body::<CircuitTestBody>(&packet.payload) {
                    self.handle_circuit_test(now, peer, body);
                }
            }
            Verb::CircuitTestReport => {
                if let Ok(body) = decode_body::<CircuitTestReport>(&packet.payload) {
                    self.circuit_tests.deliver(&body);
                }
            }
        }
        Ok(())
    }

    fn handle_hello(
        &self,
        now: u64,
        peer: &Arc<Peer>,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        packet: &Packet,
        body: HelloBody,
    ) {
        peer.set_version(body.version);
        self.send_ok(
            now,
            peer,
            local,
            remote,
            packet,
            OkPayload::Hello {
                timestamp_echo: body.timestamp,
                protocol_version: PROTOCOL_VERSION,
                version: self.version,
                external_endpoint: remote,
            },
        );
    }

    fn handle_ok(&self, now: u64, peer: &Arc<Peer>, body: OkBody) {
        match body.payload {
            OkPayload::Hello {
                timestamp_echo,
                version,
                ..
            } => {
                peer.set_version(version);
                peer.record_latency(now.saturating_sub(timestamp_echo));
                trace!(peer = %peer.address(), rtt = peer.latency_ms(), "hello confirmed");
                self.push_direct_paths(now, peer);
            }
            OkPayload::Whois { identity } => {
                let addr = identity.address();
                if self
                    .topology
                    .learn_identity(&self.identity, identity, now)
                    .is_ok()
                {
                    self.unpark(now, addr);
                }
            }
            OkPayload::NetworkConfig { config } => {
                let Some(network) = self.network(config.network_id) else {
                    return;
                };
                if network.controller_address() != peer.address() {
                    return;
                }
                let had_config = network.config_timestamp() > 0;
                if network.set_config(config.clone()) {
                    let event = if had_config {
                        VirtualPortEvent::ConfigUpdate
                    } else {
                        VirtualPortEvent::Up
                    };
                    self.host.port_config(config.network_id, event, Some(&config));
                }
            }
            OkPayload::MulticastGather {
                network_id,
                group,
                members,
            } => {
                let limit = self
                    .network(network_id)
                    .map(|n| n.multicast_limit())
                    .unwrap_or(32);
                for member in members {
                    if member != self.self_address() && !member.is_reserved() {
                        self.multicaster.add(now, network_id, group, member, limit);
                    }
                }
            }
            OkPayload::Echo { .. } => {}
        }
    }

    fn handle_error(&self, now: u64, peer: &Arc<Peer>, body: ErrorBody) {
        match body.code {
            ErrorCode::NeedMembershipCertificate => {
                let Some(network_id) = body.network_id else {
                    return;
                };
                let Some(network) = self.network(network_id) else {
                    return;
                };
                if let Some(com) = network.our_com() {
                    debug!(peer = %peer.address(), network = format_args!("{:016x}", network_id), "pushing membership certificate");
                    let body = FrameBody {
                        network_id,
                        ethertype: 0,
                        com: Some(com),
                        payload: Vec::new(),
                    };
                    if let Ok(body) = encode_body(&body) {
                        let _ = self.send_to_peer(
                            now,
                            peer,
                            Verb::Frame,
                            Bytes::from(body),
                            true,
                        );
                        peer.record_com_push(now);
                    }
                }
            }
            ErrorCode::IdentityCollision => {
                if peer.role() == PeerRole::Root && body.in_re_verb == Verb::Hello as u8 {
                    warn!("upstream reports an identity collision on our address");
                    self.host.event(Event::IdentityCollision);
                }
            }
            ErrorCode::NetworkAccessDenied => {
                let Some(network_id) = body.network_id else {
                    return;
                };
                let Some(network) = self.network(network_id) else {
                    return;
                };
                if network.controller_address() == peer.address() {
                    network.set_status(crate::network::NetworkStatus::AccessDenied);
                    self.host
                        .port_config(network_id, VirtualPortEvent::Down, None);
                    self.host.event(Event::Trace(format!(
                        "controller denied access to network {:016x}",
                        network_id
                    )));
                }
            }
            ErrorCode::ObjNotFound => {
                if body.in_re_verb == Verb::NetworkConfigRequest as u8 {
                    if let Some(network_id) = body.network_id {
                        if let Some(network) = self.network(network_id) {
                            if network.controller_address() == peer.address() {
                                network.set_status(crate::network::NetworkStatus::NotFound);
                                self.host.port_config(
                                    network_id,
                                    VirtualPortEvent::Down,
                                    None,
                                );
                            }
                        }
                    }
                }
            }
            ErrorCode::NoSuchNetwork | ErrorCode::UnsupportedOperation => {
                trace!(peer = %peer.address(), code = ?body.code, "protocol error from peer");
            }
        }
    }

    fn handle_whois(
        &self,
        now: u64,
        peer: &Arc<Peer>,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        packet: &Packet,
        body: WhoisBody,
    ) {
        let identity = if body.address == self.self_address() {
            Some(self.identity.public_clone())
        } else {
            self.topology
                .get_peer(body.address)
                .map(|p| p.identity().public_clone())
        };
        match identity {
            Some(identity) => {
                self.send_ok(now, peer, local, remote, packet, OkPayload::Whois { identity });
            }
            None => {
                self.send_error(now, peer, local, remote, packet, ErrorCode::ObjNotFound, None);
            }
        }
    }

    /// Burst HELLOs at the candidate endpoint to punch the hole
    fn handle_rendezvous(&self, now: u64, peer: &Arc<Peer>, body: RendezvousBody) {
        if peer.role() != PeerRole::Root {
            trace!(from = %peer.address(), "ignoring rendezvous from non-root");
            return;
        }
        let Some(target) = self.topology.get_peer(body.peer) else {
            return;
        };
        debug!(peer = %body.peer, endpoint = %body.endpoint, "rendezvous: punching");
        self.host.event(Event::Trace(format!(
            "hole punching {} at {}",
            body.peer, body.endpoint
        )));
        for _ in 0..self.config.rendezvous_hello_burst {
            self.send_hello(now, &target, body.endpoint);
        }
    }

    /// Validate and record a pushed membership certificate
    fn absorb_com(
        &self,
        src: Address,
        network: &Arc<Network>,
        com: crate::membership::CertificateOfMembership,
    ) {
        // Verify the signature when the controller's identity is known;
        // structural checks alone otherwise (the gate still requires
        // agreement with our own certificate).
        if let Some(controller) = self.topology.get_peer(network.controller_address()) {
            if com.verify(controller.identity()).is_err() {
                trace!(src = %src, "membership certificate failed verification");
                return;
            }
        }
        network.add_membership(src, com);
    }

    fn handle_frame(
        &self,
        now: u64,
        peer: &Arc<Peer>,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        packet: &Packet,
        body: FrameBody,
    ) {
        let Some(network) = self.network(body.network_id) else {
            self.send_error(
                now,
                peer,
                local,
                remote,
                packet,
                ErrorCode::NoSuchNetwork,
                Some(body.network_id),
            );
            return;
        };

        if let Some(com) = body.com {
            self.absorb_com(peer.address(), &network, com);
        }
        if body.payload.is_empty() {
            return; // bare credential push
        }

        match network.gate_inbound_frame(peer.address()) {
            FrameGate::Accept => {}
            FrameGate::NeedCertificate => {
                self.send_error(
                    now,
                    peer,
                    local,
                    remote,
                    packet,
                    ErrorCode::NeedMembershipCertificate,
                    Some(body.network_id),
                );
                return;
            }
            FrameGate::Drop => return,
        }
        if !network.ethertype_allowed(body.ethertype) {
            return;
        }

        let src_mac = Mac::from_address(peer.address(), body.network_id);
        self.host.virtual_frame(
            body.network_id,
            src_mac,
            network.mac(),
            body.ethertype,
            0,
            &body.payload,
        );
    }

    fn handle_ext_frame(
        &self,
        now: u64,
        peer: &Arc<Peer>,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        packet: &Packet,
        body: ExtFrameBody,
    ) {
        let Some(network) = self.network(body.network_id) else {
            self.send_error(
                now,
                peer,
                local,
                remote,
                packet,
                ErrorCode::NoSuchNetwork,
                Some(body.network_id),
            );
            return;
        };

        if let Some(com) = body.com {
            self.absorb_com(peer.address(), &network, com);
        }
        if body.payload.is_empty() {
            return;
        }

        match network.gate_inbound_frame(peer.address()) {
            FrameGate::Accept => {}
            FrameGate::NeedCertificate => {
                self.send_error(
                    now,
                    peer,
                    local,
                    remote,
                    packet,
                    ErrorCode::NeedMembershipCertificate,
                    Some(body.network_id),
                );
                return;
            }
            FrameGate::Drop => return,
        }
        if !network.ethertype_allowed(body.ethertype) {
            return;
        }
        // Bridged frames may carry foreign MACs; deliver only what is for
        // us or for a group.
        if body.to != network.mac() && !body.to.is_multicast() {
            return;
        }

        self.host.virtual_frame(
            body.network_id,
            body.from,
            body.to,
            body.ethertype,
            body.vlan_id,
            &body.payload,
        );
    }

    fn handle_multicast_like(&self, now: u64, peer: &Arc<Peer>, body: MulticastLikeBody) {
        for (network_id, group) in body.likes {
            let limit = self
                .network(network_id)
                .map(|n| n.multicast_limit())
                .unwrap_or(32);
            self.multicaster
                .add(now, network_id, group, peer.address(), limit);
        }
    }

    fn handle_multicast_gather(
        &self,
        now: u64,
        peer: &Arc<Peer>,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        packet: &Packet,
        body: MulticastGatherBody,
    ) {
        let limit = (body.limit as usize).min(protocol::MAX_MULTICAST_FANOUT * 4);
        let members: Vec<Address> = self
            .multicaster
            .members(body.network_id, body.group, limit + 1)
            .into_iter()
            .filter(|m| *m != peer.address())
            .take(limit)
            .collect();
        self.send_ok(
            now,
            peer,
            local,
            remote,
            packet,
            OkPayload::MulticastGather {
                network_id: body.network_id,
                group: body.group,
                members,
            },
        );
    }

    fn handle_multicast_frame(
        &self,
        now: u64,
        peer: &Arc<Peer>,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        packet: &Packet,
        body: MulticastFrameBody,
    ) {
        let Some(network) = self.network(body.network_id) else {
            self.send_error(
                now,
                peer,
                local,
                remote,
                packet,
                ErrorCode::NoSuchNetwork,
                Some(body.network_id),
            );
            return;
        };

        // The sender implicitly subscribes to what it sends to
        self.multicaster.add(
            now,
            body.network_id,
            body.group,
            peer.address(),
            network.multicast_limit(),
        );

        if let Some(com) = body.com {
            self.absorb_com(peer.address(), &network, com);
        }

        match network.gate_inbound_frame(peer.address()) {
            FrameGate::Accept => {}
            FrameGate::NeedCertificate => {
                self.send_error(
                    now,
                    peer,
                    local,
                    remote,
                    packet,
                    ErrorCode::NeedMembershipCertificate,
                    Some(body.network_id),
                );
                return;
            }
            FrameGate::Drop => return,
        }
        if !network.ethertype_allowed(body.ethertype) {
            return;
        }

        let broadcast_ok = body.group.mac.is_broadcast()
            && network
                .config()
                .map(|c| c.enable_broadcast)
                .unwrap_or(false);
        if !broadcast_ok && !network.is_subscribed(&body.group) {
            return;
        }

        self.host.virtual_frame(
            body.network_id,
            body.from,
            body.group.mac,
            body.ethertype,
            0,
            &body.payload,
        );
    }

    fn handle_config_request(
        &self,
        now: u64,
        peer: &Arc<Peer>,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        packet: &Packet,
        body: NetworkConfigRequestBody,
    ) {
        let master = self.controller.read().unwrap().clone();
        let Some(master) = master else {
            self.send_error(
                now,
                peer,
                local,
                remote,
                packet,
                ErrorCode::UnsupportedOperation,
                Some(body.network_id),
            );
            return;
        };

        match master.handle_config_request(peer.address(), body.network_id, &body.metadata) {
            ConfigResponse::Config(config) => {
                self.send_ok(
                    now,
                    peer,
                    local,
                    remote,
                    packet,
                    OkPayload::NetworkConfig { config },
                );
            }
            ConfigResponse::AccessDenied => {
                self.send_error(
                    now,
                    peer,
                    local,
                    remote,
                    packet,
                    ErrorCode::NetworkAccessDenied,
                    Some(body.network_id),
                );
            }
            ConfigResponse::NotFound => {
                self.send_error(
                    now,
                    peer,
                    local,
                    remote,
                    packet,
                    ErrorCode::ObjNotFound,
                    Some(body.network_id),
                );
            }
        }
    }

    /// Advertise our host-declared interface addresses to a confirmed peer
    /// so it can try endpoints NAT reflection would hide, paced per peer.
    fn push_direct_paths(&self, now: u64, peer: &Arc<Peer>) {
        let endpoints = self.topology.advertisable_interfaces();
        if endpoints.is_empty() {
            return;
        }
        {
            let mut pushes = self.recent_path_pushes.lock().unwrap();
            match pushes.get(&peer.address()) {
                Some(last) if now.saturating_sub(*last) < self.config.unite_interval_ms => return,
                _ => {
                    pushes.insert(peer.address(), now);
                }
            }
        }
        if let Ok(body) = encode_body(&PushDirectPathsBody { endpoints }) {
            let _ = self.send_to_peer(now, peer, Verb::PushDirectPaths, Bytes::from(body), true);
        }
    }

    fn handle_push_direct_paths(&self, now: u64, peer: &Arc<Peer>, body: PushDirectPathsBody) {
        {
            let mut pushes = self.recent_path_pushes.lock().unwrap();
            match pushes.get(&peer.address()) {
                Some(last) if now.saturating_sub(*last) < self.config.unite_interval_ms => return,
                _ => {
                    pushes.insert(peer.address(), now);
                }
            }
        }
        for endpoint in body.endpoints.into_iter().take(MAX_PUSHED_PATHS) {
            self.send_hello(now, peer, endpoint);
        }
    }

    fn handle_circuit_test(&self, now: u64, peer: &Arc<Peer>, body: CircuitTestBody) {
        if body.test.validate(body.origin).is_err() {
            return;
        }
        let hop_index = body.hop_index as usize;
        if hop_index >= body.test.hops.len() {
            return;
        }

        let last_hop = hop_index + 1 >= body.test.hops.len();
        if body.test.report_at_every_hop || last_hop {
            let report = CircuitTestReport {
                test_id: body.test.test_id,
                reporter: self.self_address(),
                upstream: peer.address(),
                hop_index: body.hop_index,
                timestamp: now,
            };
            if let Ok(encoded) = encode_body(&report) {
                let _ = self.send(now, body.origin, Verb::CircuitTestReport, encoded, true);
            }
        }

        if !last_hop {
            let next = CircuitTestBody {
                origin: body.origin,
                hop_index: body.hop_index + 1,
                test: body.test,
            };
            let Ok(encoded) = encode_body(&next) else {
                return;
            };
            for addr in &next.test.hops[hop_index + 1] {
                if *addr != self.self_address() {
                    let _ = self.send(now, *addr, Verb::CircuitTest, encoded.clone(), true);
                }
            }
        }
    }

    fn send_ok(
        &self,
        now: u64,
        peer: &Arc<Peer>,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        in_re: &Packet,
        payload: OkPayload,
    ) {
        let Ok(body) = encode_body(&OkBody {
            in_re_verb: in_re.verb as u8,
            in_re_packet_id: in_re.id,
            payload,
        }) else {
            return;
        };
        let _ = self.transmit(now, peer, Verb::Ok, Bytes::from(body), true, local, remote);
    }

    fn send_error(
        &self,
        now: u64,
        peer: &Arc<Peer>,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        in_re: &Packet,
        code: ErrorCode,
        network_id: Option<u64>,
    ) {
        let Ok(body) = encode_body(&ErrorBody {
            in_re_verb: in_re.verb as u8,
            in_re_packet_id: in_re.id,
            code,
            network_id,
        }) else {
            return;
        };
        let _ = self.transmit(now, peer, Verb::Error, Bytes::from(body), true, local, remote);
    }

    // -----------------------------------------------------------------------
    // Frame TX (called by the node facade)
    // -----------------------------------------------------------------------

    /// Unicast an Ethernet frame to another member of a network,
    /// piggybacking our membership certificate when one is due.
    pub fn send_frame(
        &self,
        now: u64,
        network: &Arc<Network>,
        dest: Address,
        ethertype: u16,
        payload: &[u8],
    ) -> CoreResult<()> {
        let com = match network.our_com() {
            Some(com) => {
                let due = self
                    .topology
                    .get_peer(dest)
                    .map(|p| {
                        let due = p.com_push_due(now, &self.config);
                        if due {
                            p.record_com_push(now);
                        }
                        due
                    })
                    .unwrap_or(true);
                if due {
                    Some(com)
                } else {
                    None
                }
            }
            None => None,
        };
        let body = encode_body(&FrameBody {
            network_id: network.id(),
            ethertype,
            com,
            payload: payload.to_vec(),
        })?;
        self.send(now, dest, Verb::Frame, body, true)
    }

    /// Bridge an Ethernet frame whose source MAC is not our own
    pub fn send_ext_frame(
        &self,
        now: u64,
        network: &Arc<Network>,
        dest: Address,
        to: Mac,
        from: Mac,
        ethertype: u16,
        vlan_id: u16,
        payload: &[u8],
    ) -> CoreResult<()> {
        let body = encode_body(&ExtFrameBody {
            network_id: network.id(),
            com: network.our_com(),
            to,
            from,
            ethertype,
            vlan_id,
            payload: payload.to_vec(),
        })?;
        self.send(now, dest, Verb::ExtFrame, body, true)
    }

    /// Propagate a multicast frame to the freshest known subscribers,
    /// gathering more from an upstream when the set runs short.
    pub fn multicast_frame(
        &self,
        now: u64,
        network: &Arc<Network>,
        group: MulticastGroup,
        from: Mac,
        ethertype: u16,
        payload: &[u8],
    ) -> CoreResult<()> {
        let want = self.config.multicast_fanout.min(network.multicast_limit());
        let recipients =
            self.multicaster
                .pick_recipients(network.id(), group, want, self.self_address());

        if recipients.len() < want
            && self
                .multicaster
                .gather_due(now, network.id(), group, self.config.whois_retry_ms)
        {
            if let Some(root) = self.topology.best_root(now, &self.config) {
                let gather = encode_body(&MulticastGatherBody {
                    network_id: network.id(),
                    group,
                    limit: want as u32,
                })?;
                let _ = self.send_to_peer(now, &root, Verb::MulticastGather, Bytes::from(gather), true);
            }
        }

        if recipients.is_empty() {
            trace!(group = ?group, "no known members, multicast dropped");
            return Ok(());
        }

        let body = encode_body(&MulticastFrameBody {
            network_id: network.id(),
            group,
            from,
            ethertype,
            com: if network.config().map(|c| !c.is_public).unwrap_or(false) {
                network.our_com()
            } else {
                None
            },
            payload: payload.to_vec(),
        })?;
        for recipient in recipients {
            let _ = self.send(now, recipient, Verb::MulticastFrame, body.clone(), true);
        }
        Ok(())
    }

    /// Advertise our subscriptions on a network to the peers that matter:
    /// the best root plus everyone we hold a certificate from.
    pub fn send_likes(&self, now: u64, network: &Arc<Network>) {
        let likes: Vec<(u64, MulticastGroup)> = network
            .subscriptions()
            .into_iter()
            .map(|g| (network.id(), g))
            .collect();
        if likes.is_empty() {
            return;
        }
        let Ok(body) = encode_body(&MulticastLikeBody { likes }) else {
            return;
        };

        let mut targets: Vec<Address> = network.members();
        if let Some(root) = self.topology.best_root(now, &self.config) {
            targets.push(root.address());
        }
        targets.sort_unstable();
        targets.dedup();
        for target in targets.into_iter().take(64) {
            let _ = self.send(now, target, Verb::MulticastLike, body.clone(), true);
        }
    }

    /// Ask a network's controller for its config. A controller joined to
    /// its own network serves itself without touching the wire.
    pub fn request_network_config(&self, now: u64, network: &Arc<Network>) {
        let controller = network.controller_address();

        if controller == self.self_address() {
            let master = self.controller.read().unwrap().clone();
            let Some(master) = master else {
                return;
            };
            match master.handle_config_request(self.self_address(), network.id(), &[]) {
                ConfigResponse::Config(config) => {
                    let had_config = network.config_timestamp() > 0;
                    if network.set_config(config.clone()) {
                        let event = if had_config {
                            VirtualPortEvent::ConfigUpdate
                        } else {
                            VirtualPortEvent::Up
                        };
                        self.host.port_config(network.id(), event, Some(&config));
                    }
                }
                ConfigResponse::AccessDenied => {
                    network.set_status(crate::network::NetworkStatus::AccessDenied);
                    self.host
                        .port_config(network.id(), VirtualPortEvent::Down, None);
                }
                ConfigResponse::NotFound => {
                    network.set_status(crate::network::NetworkStatus::NotFound);
                    self.host
                        .port_config(network.id(), VirtualPortEvent::Down, None);
                }
            }
            return;
        }

        let Ok(body) = encode_body(&NetworkConfigRequestBody {
            network_id: network.id(),
            have_timestamp: network.config_timestamp(),
            metadata: Vec::new(),
        }) else {
            return;
        };
        debug!(network = format_args!("{:016x}", network.id()), controller = %controller, "requesting network config");
        let _ = self.send(now, controller, Verb::NetworkConfigRequest, body, true);
    }

    /// Launch a circuit test we originate
    pub fn originate_circuit_test(&self, now: u64, test: &crate::circuit::CircuitTest) -> CoreResult<()> {
        test.validate(self.self_address())?;
        let body = CircuitTestBody {
            origin: self.self_address(),
            hop_index: 0,
            test: test.clone(),
        };
        let encoded = encode_body(&body)?;
        for addr in &test.hops[0] {
            let _ = self.send(now, *addr, Verb::CircuitTest, encoded.clone(), true);
        }
        Ok(())
    }

    /// Feed a cluster backplane message through to the switch when it
    /// carries a relayed wire packet.
    pub fn on_cluster_message(&self, now: u64, data: &[u8]) -> CoreResult<()> {
        let cluster = self.cluster.read().unwrap().clone();
        let Some(cluster) = cluster else {
            return Ok(());
        };
        match cluster.handle_incoming(now, data)? {
            ClusterAction::ProcessWire { remote, data } => {
                self.on_wire_packet(now, None, remote, &data)
            }
            ClusterAction::ExpectPeer { peer } => {
                trace!(peer = %peer, "sibling redirected a peer to us");
                Ok(())
            }
            ClusterAction::None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Maintenance (driven by the node's background tick)
    // -----------------------------------------------------------------------

    /// Expire dedup records, reassembly slots, parked packets and unite
    /// markers; retransmit WHOIS for lookups still pending.
    pub fn clean(&self, now: u64) {
        self.dedup
            .lock()
            .unwrap()
            .retain(|_, seen| now.saturating_sub(*seen) <= self.config.dedup_ms);

        self.reassembly
            .lock()
            .unwrap()
            .retain(|_, slot| now.saturating_sub(slot.created) <= self.config.reassembly_ms);

        self.recent_unites
            .lock()
            .unwrap()
            .retain(|_, last| now.saturating_sub(*last) <= self.config.unite_interval_ms);
        self.recent_path_pushes
            .lock()
            .unwrap()
            .retain(|_, last| now.saturating_sub(*last) <= self.config.unite_interval_ms);

        let mut retry = Vec::new();
        self.whois.lock().unwrap().retain(|addr, entry| {
            if now.saturating_sub(entry.created) > self.config.whois_park_ms {
                trace!(addr = %addr, "whois expired, dropping parked packets");
                return false;
            }
            if now.saturating_sub(entry.last_sent) >= self.config.whois_retry_ms {
                entry.last_sent = now;
                retry.push(*addr);
            }
            true
        });
        for addr in retry {
            self.send_whois(now, addr);
        }
    }

    /// Earliest future moment any switch timer needs service
    pub fn next_deadline(&self, now: u64) -> u64 {
        let mut deadline = now + self.config.hello_interval_ms;
        if !self.reassembly.lock().unwrap().is_empty() {
            deadline = deadline.min(now + self.config.reassembly_ms);
        }
        if !self.whois.lock().unwrap().is_empty() {
            deadline = deadline.min(now + self.config.whois_retry_ms);
        }
        if !self.dedup.lock().unwrap().is_empty() {
            deadline = deadline.min(now + self.config.dedup_ms);
        }
        deadline
    }
}
