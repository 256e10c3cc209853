//! Cluster coordination
//!
//! Several engines can share one fleet of connections behind a common
//! anycast endpoint. Members exchange authenticated messages on a private
//! backplane the host transports for us: heartbeats carry load and
//! location, HAVE_PEER claims peer ownership, RELAY forwards wire packets
//! to the member that owns their sender, REDIRECT hands a peer to a better
//! located sibling. Message content is opaque to hosts.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use ethermesh_crypto::Address;

use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::protocol::{MAX_CLUSTER_MEMBERS, MAX_CLUSTER_MESSAGE_LENGTH};

/// Liveness window used when no engine config is in reach (status display,
/// per-packet ownership checks); GC uses the configured timeout.
const MEMBER_ALIVE_MS: u64 = 30_000;

/// Physical location of a member, in arbitrary host units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterGeo {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ClusterGeo {
    fn distance_sq(&self, other: &ClusterGeo) -> i64 {
        let dx = i64::from(self.x - other.x);
        let dy = i64::from(self.y - other.y);
        let dz = i64::from(self.z - other.z);
        dx * dx + dy * dy + dz * dz
    }
}

/// Host-supplied backplane transport between members
pub trait ClusterTransport: Send + Sync {
    fn send_to(&self, member: u16, data: &[u8]);
}

/// Host-supplied address-to-location value function; members with no geo
/// data supply None and geographic handoff is skipped.
pub type GeoLocator = Arc<dyn Fn(IpAddr) -> Option<ClusterGeo> + Send + Sync>;

/// Status of one member for `cluster_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMemberStatus {
    pub id: u16,
    pub alive: bool,
    pub load: u32,
    pub peer_count: u32,
    pub geo: ClusterGeo,
    pub endpoints: Vec<SocketAddr>,
    pub last_heartbeat: u64,
}

/// Status of the whole cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub my_id: u16,
    pub members: Vec<ClusterMemberStatus>,
}

/// What the switch should do after feeding in a backplane message
pub enum ClusterAction {
    None,
    /// A sibling relayed a wire packet for us; process it as received
    ProcessWire { remote: SocketAddr, data: Vec<u8> },
    /// A sibling redirected one of its peers toward us; expect it
    ExpectPeer { peer: Address },
}

#[derive(Serialize, Deserialize)]
enum ClusterMessage {
    Heartbeat {
        load: u32,
        peer_count: u32,
        geo: ClusterGeo,
        endpoints: Vec<SocketAddr>,
    },
    HavePeer {
        peer: Address,
        load: u32,
    },
    WantPeer {
        peer: Address,
    },
    Redirect {
        peer: Address,
        endpoints: Vec<SocketAddr>,
    },
    Relay {
        remote: SocketAddr,
        data: Vec<u8>,
    },
}

struct MemberState {
    load: u32,
    peer_count: u32,
    geo: ClusterGeo,
    endpoints: Vec<SocketAddr>,
    last_heartbeat: u64,
    last_counter: u64,
}

/// One engine's view of the cluster it belongs to
pub struct Cluster {
    my_id: u16,
    key: [u8; 32],
    geo: ClusterGeo,
    endpoints: Vec<SocketAddr>,
    transport: Arc<dyn ClusterTransport>,
    locator: Option<GeoLocator>,
    members: Mutex<HashMap<u16, MemberState>>,
    affinities: Mutex<HashMap<Address, u16>>,
    tx_counter: AtomicU64,
    last_heartbeat_sent: AtomicU64,
}

impl Cluster {
    /// Join a cluster as member `my_id`. The shared secret authenticates
    /// the backplane; all members must hold the same one.
    pub fn new(
        my_id: u16,
        secret: &[u8],
        endpoints: Vec<SocketAddr>,
        geo: ClusterGeo,
        transport: Arc<dyn ClusterTransport>,
        locator: Option<GeoLocator>,
    ) -> CoreResult<Self> {
        if my_id >= MAX_CLUSTER_MEMBERS {
            return Err(CoreError::BadParameter(format!(
                "cluster member id {} out of range",
                my_id
            )));
        }
        Ok(Self {
            my_id,
            key: blake3::derive_key("ethermesh cluster backplane v1", secret),
            geo,
            endpoints,
            transport,
            locator,
            members: Mutex::new(HashMap::new()),
            affinities: Mutex::new(HashMap::new()),
            tx_counter: AtomicU64::new(1),
            last_heartbeat_sent: AtomicU64::new(0),
        })
    }

    pub fn my_id(&self) -> u16 {
        self.my_id
    }

    /// Register a sibling member
    pub fn add_member(&self, id: u16) -> CoreResult<()> {
        if id >= MAX_CLUSTER_MEMBERS || id == self.my_id {
            return Err(CoreError::BadParameter("bad cluster member id".into()));
        }
        self.members.lock().unwrap().entry(id).or_insert(MemberState {
            load: 0,
            peer_count: 0,
            geo: ClusterGeo::default(),
            endpoints: Vec::new(),
            last_heartbeat: 0,
            last_counter: 0,
        });
        Ok(())
    }

    /// Remove a member, releasing the peers it owned
    pub fn remove_member(&self, id: u16) {
        self.members.lock().unwrap().remove(&id);
        self.affinities
            .lock()
            .unwrap()
            .retain(|_, owner| *owner != id);
    }

    /// Number of peers this member currently owns
    pub fn my_load(&self) -> u32 {
        self.affinities
            .lock()
            .unwrap()
            .values()
            .filter(|o| **o == self.my_id)
            .count() as u32
    }

    /// The member owning a peer, if any
    pub fn owner_of(&self, peer: Address) -> Option<u16> {
        self.affinities.lock().unwrap().get(&peer).copied()
    }

    /// Called for every head packet arriving from a peer. Claims unowned
    /// peers (announcing HAVE_PEER) and answers whether this member should
    /// process the packet itself; if not, the caller relays it.
    pub fn note_peer_contact(&self, now: u64, peer: Address) -> bool {
        let (owner, fresh_claim) = {
            let mut affinities = self.affinities.lock().unwrap();
            match affinities.get(&peer).copied() {
                Some(owner) => (owner, false),
                None => {
                    affinities.insert(peer, self.my_id);
                    (self.my_id, true)
                }
            }
        };
        if owner == self.my_id {
            if fresh_claim {
                self.broadcast(&ClusterMessage::HavePeer {
                    peer,
                    load: self.my_load(),
                });
            }
            true
        } else if self.member_alive(now, owner) {
            false
        } else {
            // Owner died; take the peer back
            self.affinities.lock().unwrap().insert(peer, self.my_id);
            true
        }
    }

    fn member_alive(&self, now: u64, id: u16) -> bool {
        self.members
            .lock()
            .unwrap()
            .get(&id)
            .map(|m| m.last_heartbeat > 0 && now.saturating_sub(m.last_heartbeat) < MEMBER_ALIVE_MS)
            .unwrap_or(false)
    }

    /// Ask the siblings which of them owns a peer we need
    pub fn want_peer(&self, peer: Address) {
        self.broadcast(&ClusterMessage::WantPeer { peer });
    }

    /// Forward a wire packet to the member owning its source
    pub fn relay_to_owner(&self, peer: Address, remote: SocketAddr, data: &[u8]) {
        if let Some(owner) = self.owner_of(peer) {
            if owner != self.my_id {
                trace!(peer = %peer, owner, "relaying packet to owning member");
                self.send_message(
                    owner,
                    &ClusterMessage::Relay {
                        remote,
                        data: data.to_vec(),
                    },
                );
            }
        }
    }

    /// If a sibling is geographically closer to `endpoint` than we are,
    /// hand the peer off: tell the sibling to expect it and return the
    /// sibling's endpoints for a direct-path push to the peer.
    pub fn better_sibling_endpoints(
        &self,
        now: u64,
        peer: Address,
        endpoint: SocketAddr,
    ) -> Option<Vec<SocketAddr>> {
        let locator = self.locator.as_ref()?;
        let peer_geo = locator(endpoint.ip())?;
        if self.owner_of(peer) != Some(self.my_id) {
            return None;
        }

        let my_distance = self.geo.distance_sq(&peer_geo);
        let best = {
            let members = self.members.lock().unwrap();
            members
                .iter()
                .filter(|(id, m)| {
                    m.last_heartbeat > 0
                        && now.saturating_sub(m.last_heartbeat) < MEMBER_ALIVE_MS
                        && !m.endpoints.is_empty()
                        && **id != self.my_id
                })
                .map(|(id, m)| (*id, m.geo.distance_sq(&peer_geo), m.endpoints.clone()))
                .min_by_key(|(_, d, _)| *d)
        };

        let (sibling, distance, endpoints) = best?;
        if distance >= my_distance {
            return None;
        }
        debug!(peer = %peer, sibling, "handing peer to closer member");
        self.affinities.lock().unwrap().insert(peer, sibling);
        self.send_message(
            sibling,
            &ClusterMessage::Redirect {
                peer,
                endpoints: endpoints.clone(),
            },
        );
        Some(endpoints)
    }

    /// Send a heartbeat if one is due
    pub fn heartbeat_if_due(&self, now: u64, config: &EngineConfig) {
        let last = self.last_heartbeat_sent.load(Ordering::Relaxed);
        if now.saturating_sub(last) < config.cluster_heartbeat_ms {
            return;
        }
        self.last_heartbeat_sent.store(now, Ordering::Relaxed);
        self.broadcast(&ClusterMessage::Heartbeat {
            load: self.my_load(),
            peer_count: self.my_load(),
            geo: self.geo,
            endpoints: self.endpoints.clone(),
        });
    }

    /// Release peers owned by members that stopped heartbeating
    pub fn gc(&self, now: u64, config: &EngineConfig) {
        let dead: Vec<u16> = {
            let members = self.members.lock().unwrap();
            members
                .iter()
                .filter(|(_, m)| {
                    m.last_heartbeat > 0
                        && now.saturating_sub(m.last_heartbeat) >= config.cluster_dead_ms
                })
                .map(|(id, _)| *id)
                .collect()
        };
        if !dead.is_empty() {
            let mut affinities = self.affinities.lock().unwrap();
            affinities.retain(|_, owner| !dead.contains(owner));
        }
    }

    /// Feed in a backplane message received by the host
    pub fn handle_incoming(&self, now: u64, data: &[u8]) -> CoreResult<ClusterAction> {
        let (from, message) = self.open(data)?;
        match message {
            ClusterMessage::Heartbeat {
                load,
                peer_count,
                geo,
                endpoints,
            } => {
                let mut members = self.members.lock().unwrap();
                if let Some(member) = members.get_mut(&from) {
                    member.load = load;
                    member.peer_count = peer_count;
                    member.geo = geo;
                    member.endpoints = endpoints;
                    member.last_heartbeat = now;
                }
                Ok(ClusterAction::None)
            }
            ClusterMessage::HavePeer { peer, load } => {
                self.handle_have_peer(from, peer, load);
                Ok(ClusterAction::None)
            }
            ClusterMessage::WantPeer { peer } => {
                if self.owner_of(peer) == Some(self.my_id) {
                    self.send_message(
                        from,
                        &ClusterMessage::HavePeer {
                            peer,
                            load: self.my_load(),
                        },
                    );
                }
                Ok(ClusterAction::None)
            }
            ClusterMessage::Redirect { peer, .. } => {
                self.affinities.lock().unwrap().insert(peer, self.my_id);
                Ok(ClusterAction::ExpectPeer { peer })
            }
            ClusterMessage::Relay { remote, data } => {
                Ok(ClusterAction::ProcessWire { remote, data })
            }
        }
    }

    fn handle_have_peer(&self, from: u16, peer: Address, their_load: u32) {
        let my_load = self.my_load();
        let mut affinities = self.affinities.lock().unwrap();
        match affinities.get(&peer).copied() {
            Some(owner) if owner == self.my_id => {
                // Contested claim: lower load wins, lower id breaks ties
                if their_load < my_load || (their_load == my_load && from < self.my_id) {
                    debug!(peer = %peer, from, "ceding peer to lower-load member");
                    affinities.insert(peer, from);
                } else {
                    drop(affinities);
                    self.broadcast(&ClusterMessage::HavePeer {
                        peer,
                        load: my_load,
                    });
                }
            }
            Some(owner) => {
                // Two siblings contesting: apply the same rule symmetrically
                let owner_load = self
                    .members
                    .lock()
                    .unwrap()
                    .get(&owner)
                    .map(|m| m.load)
                    .unwrap_or(u32::MAX);
                if their_load < owner_load || (their_load == owner_load && from < owner) {
                    affinities.insert(peer, from);
                }
            }
            None => {
                // Takeover: if we are strictly less loaded, claim it
                if my_load < their_load {
                    affinities.insert(peer, self.my_id);
                    drop(affinities);
                    debug!(peer = %peer, from, "taking over peer from busier member");
                    self.broadcast(&ClusterMessage::HavePeer {
                        peer,
                        load: my_load,
                    });
                } else {
                    affinities.insert(peer, from);
                }
            }
        }
    }

    /// Status snapshot, self included
    pub fn status(&self, now: u64) -> ClusterStatus {
        let affinities = self.affinities.lock().unwrap();
        let owned_by = |id: u16| affinities.values().filter(|o| **o == id).count() as u32;

        let mut out = vec![ClusterMemberStatus {
            id: self.my_id,
            alive: true,
            load: owned_by(self.my_id),
            peer_count: owned_by(self.my_id),
            geo: self.geo,
            endpoints: self.endpoints.clone(),
            last_heartbeat: now,
        }];
        let members = self.members.lock().unwrap();
        for (id, m) in members.iter() {
            out.push(ClusterMemberStatus {
                id: *id,
                alive: m.last_heartbeat > 0
                    && now.saturating_sub(m.last_heartbeat) < MEMBER_ALIVE_MS,
                load: m.load,
                peer_count: owned_by(*id),
                geo: m.geo,
                endpoints: m.endpoints.clone(),
                last_heartbeat: m.last_heartbeat,
            });
        }
        out.sort_by_key(|m| m.id);
        ClusterStatus {
            my_id: self.my_id,
            members: out,
        }
    }

    fn broadcast(&self, message: &ClusterMessage) {
        let ids: Vec<u16> = self.members.lock().unwrap().keys().copied().collect();
        for id in ids {
            self.send_message(id, message);
        }
    }

    fn send_message(&self, to: u16, message: &ClusterMessage) {
        match self.seal(message) {
            Ok(data) => self.transport.send_to(to, &data),
            Err(e) => debug!("cluster message dropped: {}", e),
        }
    }

    /// Wire form: [from:2][counter:8][tag:16][bincode body], tag is a keyed
    /// blake3 over everything before it plus the body.
    fn seal(&self, message: &ClusterMessage) -> CoreResult<Vec<u8>> {
        let body = bincode::serialize(message)
            .map_err(|e| CoreError::Internal(format!("cluster encode: {}", e)))?;
        let counter = self.tx_counter.fetch_add(1, Ordering::SeqCst);

        let mut out = Vec::with_capacity(26 + body.len());
        out.extend_from_slice(&self.my_id.to_be_bytes());
        out.extend_from_slice(&counter.to_be_bytes());
        let tag = self.tag(self.my_id, counter, &body);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&body);

        if out.len() > MAX_CLUSTER_MESSAGE_LENGTH {
            return Err(CoreError::BadParameter("cluster message too large".into()));
        }
        Ok(out)
    }

    fn open(&self, data: &[u8]) -> CoreResult<(u16, ClusterMessage)> {
        if data.len() < 27 {
            return Err(CoreError::BadParameter("cluster message too short".into()));
        }
        let from = u16::from_be_bytes(data[..2].try_into().unwrap());
        let counter = u64::from_be_bytes(data[2..10].try_into().unwrap());
        let body = &data[26..];

        let expected = self.tag(from, counter, body);
        let mut diff = 0u8;
        for (a, b) in data[10..26].iter().zip(expected.iter()) {
            diff |= a ^ b;
        }
        if diff != 0 {
            return Err(CoreError::BadParameter("cluster message bad tag".into()));
        }

        // Anti-replay: counters must strictly increase per sender
        {
            let mut members = self.members.lock().unwrap();
            let member = members
                .get_mut(&from)
                .ok_or_else(|| CoreError::BadParameter("unknown cluster member".into()))?;
            if counter <= member.last_counter {
                return Err(CoreError::BadParameter("cluster message replayed".into()));
            }
            member.last_counter = counter;
        }

        let message = bincode::deserialize(body)
            .map_err(|e| CoreError::BadParameter(format!("cluster decode: {}", e)))?;
        Ok((from, message))
    }

    fn tag(&self, from: u16, counter: u64, body: &[u8]) -> [u8; 16] {
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(&from.to_be_bytes());
        hasher.update(&counter.to_be_bytes());
        hasher.update(body);
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Captures backplane traffic for inspection and manual pumping
    struct TestTransport {
        sent: StdMutex<Vec<(u16, Vec<u8>)>>,
    }

    impl TestTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn drain(&self) -> Vec<(u16, Vec<u8>)> {
            self.sent.lock().unwrap().drain(..).collect()
        }
    }

    impl ClusterTransport for TestTransport {
        fn send_to(&self, member: u16, data: &[u8]) {
            self.sent.lock().unwrap().push((member, data.to_vec()));
        }
    }

    fn make_cluster(id: u16, transport: Arc<TestTransport>) -> Cluster {
        Cluster::new(
            id,
            b"shared-cluster-secret",
            vec![format!("203.0.113.{}:9993", id + 1).parse().unwrap()],
            ClusterGeo::default(),
            transport,
            None,
        )
        .unwrap()
    }

    /// Deliver every queued message from `from` into the other clusters
    fn pump(now: u64, from: (&Cluster, &Arc<TestTransport>), others: &[(&Cluster, u16)]) {
        for (to, data) in from.1.drain() {
            for (cluster, id) in others {
                if *id == to {
                    let _ = cluster.handle_incoming(now, &data);
                }
            }
        }
    }

    #[test]
    fn test_member_id_range() {
        let t = TestTransport::new();
        assert!(Cluster::new(
            200,
            b"s",
            vec![],
            ClusterGeo::default(),
            t,
            None
        )
        .is_err());
    }

    #[test]
    fn test_message_authentication_and_replay() {
        let t1 = TestTransport::new();
        let t2 = TestTransport::new();
        let c1 = make_cluster(1, Arc::clone(&t1));
        let c2 = make_cluster(2, Arc::clone(&t2));
        c1.add_member(2).unwrap();
        c2.add_member(1).unwrap();

        c1.heartbeat_if_due(1_000, &EngineConfig::default());
        let sent = t1.drain();
        assert_eq!(sent.len(), 1);
        let (_, data) = &sent[0];

        // Valid message accepted once
        assert!(c2.handle_incoming(1_000, data).is_ok());
        // Replay rejected
        assert!(c2.handle_incoming(1_001, data).is_err());

        // Tampered message rejected
        let mut bad = data.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        assert!(c2.handle_incoming(1_002, &bad).is_err());
    }

    #[test]
    fn test_first_contact_claims_peer() {
        let t1 = TestTransport::new();
        let c1 = make_cluster(1, Arc::clone(&t1));
        c1.add_member(2).unwrap();

        let peer = Address::from_u64(0xaaaaaaaaaa);
        assert!(c1.note_peer_contact(1_000, peer));
        assert_eq!(c1.owner_of(peer), Some(1));

        // A HAVE_PEER went out to the sibling
        let sent = t1.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 2);
    }

    #[test]
    fn test_lower_load_member_takes_over() {
        let t1 = TestTransport::new();
        let t2 = TestTransport::new();
        let c1 = make_cluster(1, Arc::clone(&t1));
        let c2 = make_cluster(2, Arc::clone(&t2));
        c1.add_member(2).unwrap();
        c2.add_member(1).unwrap();

        // Load up c1 with some owned peers
        for i in 0..3u64 {
            c1.note_peer_contact(1_000, Address::from_u64(0x1000000000 + i));
        }
        t1.drain();

        // New peer contacts c1
        let peer = Address::from_u64(0xbbbbbbbbbb);
        assert!(c1.note_peer_contact(2_000, peer));

        // c2 (zero load) sees the claim and takes over
        pump(2_000, (&c1, &t1), &[(&c2, 2)]);
        assert_eq!(c2.owner_of(peer), Some(2));

        // c1 sees the takeover and cedes
        pump(2_000, (&c2, &t2), &[(&c1, 1)]);
        assert_eq!(c1.owner_of(peer), Some(2));
    }

    #[test]
    fn test_relay_flows_to_owner() {
        let t1 = TestTransport::new();
        let t2 = TestTransport::new();
        let c1 = make_cluster(1, Arc::clone(&t1));
        let c2 = make_cluster(2, Arc::clone(&t2));
        c1.add_member(2).unwrap();
        c2.add_member(1).unwrap();

        // Mark member 2 alive from c1's point of view
        c2.heartbeat_if_due(1_000, &EngineConfig::default());
        pump(1_000, (&c2, &t2), &[(&c1, 1)]);

        let peer = Address::from_u64(0xcccccccccc);
        // c2 owns the peer (simulate a finished handoff on c1's side)
        c1.affinities.lock().unwrap().insert(peer, 2);

        assert!(!c1.note_peer_contact(2_000, peer));
        let remote: SocketAddr = "198.51.100.9:40000".parse().unwrap();
        c1.relay_to_owner(peer, remote, b"wire-packet-bytes");

        let mut relayed = None;
        for (to, data) in t1.drain() {
            if to == 2 {
                if let Ok(ClusterAction::ProcessWire { remote: r, data }) =
                    c2.handle_incoming(2_000, &data)
                {
                    relayed = Some((r, data));
                }
            }
        }
        let (r, data) = relayed.expect("relay should arrive");
        assert_eq!(r, remote);
        assert_eq!(data, b"wire-packet-bytes");
    }

    #[test]
    fn test_dead_member_releases_peers() {
        let t1 = TestTransport::new();
        let t2 = TestTransport::new();
        let c1 = make_cluster(1, Arc::clone(&t1));
        let c2 = make_cluster(2, Arc::clone(&t2));
        c1.add_member(2).unwrap();
        c2.add_member(1).unwrap();

        c2.heartbeat_if_due(1_000, &EngineConfig::default());
        pump(1_000, (&c2, &t2), &[(&c1, 1)]);

        let peer = Address::from_u64(0xdddddddddd);
        c1.affinities.lock().unwrap().insert(peer, 2);

        // Member 2 goes silent past the death timeout
        let config = EngineConfig::default();
        c1.gc(1_000 + config.cluster_dead_ms, &config);
        assert_eq!(c1.owner_of(peer), None);

        // Next contact claims it locally again
        assert!(c1.note_peer_contact(40_000, peer));
        assert_eq!(c1.owner_of(peer), Some(1));
    }

    #[test]
    fn test_status_reports_ownership() {
        let t1 = TestTransport::new();
        let c1 = make_cluster(1, Arc::clone(&t1));
        c1.add_member(2).unwrap();

        c1.note_peer_contact(1_000, Address::from_u64(0xeeeeeeeeee));
        let status = c1.status(1_000);

        assert_eq!(status.my_id, 1);
        assert_eq!(status.members.len(), 2);
        let me = status.members.iter().find(|m| m.id == 1).unwrap();
        assert_eq!(me.peer_count, 1);
        assert!(me.alive);
    }
}
