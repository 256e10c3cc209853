//! Multicast propagation
//!
//! The engine keeps a bounded, freshness-ordered set of known subscribers
//! per (network, group) learned from MULTICAST_LIKE gossip and GATHER
//! responses. Multicast frames are unicast to a capped pick of the freshest
//! members; ARP broadcast shards into per-target groups via the ADI field.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use ethermesh_crypto::Address;

use crate::protocol::Mac;

/// A multicast group: 48-bit MAC plus 32 bits of additional distinguishing
/// information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MulticastGroup {
    pub mac: Mac,
    pub adi: u32,
}

impl MulticastGroup {
    pub fn new(mac: Mac, adi: u32) -> Self {
        Self { mac, adi }
    }

    /// The all-nodes broadcast group of a network
    pub fn broadcast() -> Self {
        Self {
            mac: Mac::BROADCAST,
            adi: 0,
        }
    }

    /// ARP requests for one IPv4 target shard into their own group so
    /// broadcast scales with network size
    pub fn for_arp_target(target: Ipv4Addr) -> Self {
        Self {
            mac: Mac::BROADCAST,
            adi: u32::from(target),
        }
    }
}

struct GroupMembers {
    /// (member, last_seen), kept sorted freshest-first on access
    members: Vec<(Address, u64)>,
    last_gather: u64,
}

/// Gossip-fed directory of multicast subscribers
pub struct Multicaster {
    groups: Mutex<HashMap<(u64, MulticastGroup), GroupMembers>>,
}

impl Multicaster {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `member` subscribes to `group` on `network_id`
    pub fn add(&self, now: u64, network_id: u64, group: MulticastGroup, member: Address, limit: usize) {
        let mut groups = self.groups.lock().unwrap();
        let entry = groups.entry((network_id, group)).or_insert(GroupMembers {
            members: Vec::new(),
            last_gather: 0,
        });

        if let Some(existing) = entry.members.iter_mut().find(|(a, _)| *a == member) {
            existing.1 = now;
            return;
        }
        if entry.members.len() >= limit {
            // Evict the stalest member to make room
            if let Some(stalest) = entry
                .members
                .iter()
                .enumerate()
                .min_by_key(|(_, (_, seen))| *seen)
                .map(|(i, _)| i)
            {
                if entry.members[stalest].1 >= now {
                    return;
                }
                entry.members.remove(stalest);
            }
        }
        entry.members.push((member, now));
    }

    /// Pick up to `fanout` recipients, freshest first, excluding the frame's
    /// originator so it never echoes back.
    pub fn pick_recipients(
        &self,
        network_id: u64,
        group: MulticastGroup,
        fanout: usize,
        exclude: Address,
    ) -> Vec<Address> {
        let mut groups = self.groups.lock().unwrap();
        let Some(entry) = groups.get_mut(&(network_id, group)) else {
            return Vec::new();
        };
        entry.members.sort_by(|a, b| b.1.cmp(&a.1));
        entry
            .members
            .iter()
            .filter(|(a, _)| *a != exclude)
            .take(fanout)
            .map(|(a, _)| *a)
            .collect()
    }

    /// Known subscribers of a group, freshest first, for GATHER replies
    pub fn members(&self, network_id: u64, group: MulticastGroup, limit: usize) -> Vec<Address> {
        self.pick_recipients(network_id, group, limit, Address::from_u64(0))
    }

    /// Number of known subscribers of a group
    pub fn known_count(&self, network_id: u64, group: MulticastGroup) -> usize {
        self.groups
            .lock()
            .unwrap()
            .get(&(network_id, group))
            .map(|e| e.members.len())
            .unwrap_or(0)
    }

    /// Whether a GATHER toward an upstream is due for this group
    pub fn gather_due(&self, now: u64, network_id: u64, group: MulticastGroup, interval_ms: u64) -> bool {
        let mut groups = self.groups.lock().unwrap();
        let entry = groups.entry((network_id, group)).or_insert(GroupMembers {
            members: Vec::new(),
            last_gather: 0,
        });
        if now.saturating_sub(entry.last_gather) >= interval_ms {
            entry.last_gather = now;
            true
        } else {
            false
        }
    }

    /// Age out members unseen past the expiry window; empty groups vanish
    pub fn age(&self, now: u64, expiry_ms: u64) {
        let mut groups = self.groups.lock().unwrap();
        groups.retain(|_, entry| {
            entry
                .members
                .retain(|(_, seen)| now.saturating_sub(*seen) <= expiry_ms);
            !entry.members.is_empty() || now.saturating_sub(entry.last_gather) <= expiry_ms
        });
    }

    /// Forget everything about a network (leave)
    pub fn forget_network(&self, network_id: u64) {
        self.groups
            .lock()
            .unwrap()
            .retain(|(nwid, _), _| *nwid != network_id);
    }
}

impl Default for Multicaster {
    fn default() -> Self {
        Self::new()
    }
}
