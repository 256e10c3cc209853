//! Ethermesh Core Engine
//!
//! The embeddable core of a peer-to-peer Ethernet virtualization service:
//! - VL1: authenticated, optionally encrypted datagrams between 40-bit node
//!   addresses, with fragmentation, relaying and NAT-traversal rendezvous
//! - VL2: virtual Ethernet frames on 64-bit network IDs, gated by
//!   certificates of membership, with gossip-driven multicast
//! - An optional cluster coordinator sharding peers across sibling engines
//!
//! The engine performs no I/O of its own: the host feeds in wire datagrams,
//! Ethernet frames and clock ticks, and receives everything outbound through
//! the [`node::HostHooks`] callbacks.

pub mod circuit;
pub mod cluster;
pub mod config;
pub mod error;
pub mod membership;
pub mod multicast;
pub mod network;
pub mod node;
pub mod packet;
pub mod path;
pub mod peer;
pub mod protocol;
pub mod switch;
pub mod topology;
pub mod world;

pub use circuit::{CircuitTest, CircuitTestCallback, CircuitTestReport};
pub use cluster::{ClusterGeo, ClusterStatus, ClusterTransport, GeoLocator};
pub use config::EngineConfig;
pub use error::{CoreError, CoreResult, ResultCode};
pub use membership::CertificateOfMembership;
pub use multicast::MulticastGroup;
pub use network::{AssignedAddress, NetworkConfig, NetworkStatus};
pub use node::{
    ConfigMaster, ConfigResponse, DataStoreError, Event, HostHooks, NetworkInfo, Node,
    NodeStatus, PeerStatus, VirtualPortEvent, VERSION,
};
pub use peer::PeerRole;
pub use protocol::{Mac, Verb, DEFAULT_PORT, MAX_MTU};
pub use topology::AddressTrust;
pub use world::{Root, World};

pub use ethermesh_crypto::{Address, Identity};
