//! VL1 protocol definitions
//!
//! Verbs, error codes, wire limits, the network MAC derivation, and the
//! serde-encoded payload bodies carried inside VL1 packets. The fixed packet
//! header itself is hand-encoded in `packet`; everything after the verb byte
//! is a bincode body defined here.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use ethermesh_crypto::{Address, Identity};

use crate::circuit::CircuitTest;
use crate::error::{CoreError, CoreResult};
use crate::membership::CertificateOfMembership;
use crate::multicast::MulticastGroup;
use crate::network::NetworkConfig;

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u8 = 1;

/// Default UDP port
pub const DEFAULT_PORT: u16 = 9993;

/// Maximum virtual network MTU
pub const MAX_MTU: usize = 2800;

/// Payload budget of an unfragmented (head) wire packet
pub const WIRE_MTU: usize = 1414;

/// Payload budget of a tail fragment
pub const FRAGMENT_MTU: usize = 1400;

/// Maximum fragments per packet, head included
pub const MAX_FRAGMENTS: usize = 16;

/// Maximum relay hops
pub const MAX_HOPS: u8 = 7;

/// Maximum live paths per peer
pub const MAX_PEER_PATHS: usize = 4;

/// Maximum multicast subscriptions per network
pub const MAX_NETWORK_MULTICAST_SUBSCRIPTIONS: usize = 4096;

/// Maximum recipients of one propagated multicast frame
pub const MAX_MULTICAST_FANOUT: usize = 32;

/// Maximum static addresses per network
pub const MAX_ASSIGNED_ADDRESSES: usize = 16;

/// Circuit test limits
pub const MAX_CIRCUIT_TEST_HOPS: usize = 512;
pub const MAX_CIRCUIT_TEST_BREADTH: usize = 256;

/// Cluster limits
pub const MAX_CLUSTER_MEMBERS: u16 = 128;
pub const MAX_CLUSTER_MESSAGE_LENGTH: usize = 1452;

/// VL1 verb identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Verb {
    /// No operation, payload ignored
    Nop = 0x00,

    /// Identity announcement + liveness probe (cleartext, still MACed)
    Hello = 0x01,

    /// Error in response to a specific packet
    Error = 0x02,

    /// Success response to a specific packet
    Ok = 0x03,

    /// Address-to-identity lookup
    Whois = 0x04,

    /// NAT traversal hint from a shared relay
    Rendezvous = 0x05,

    /// Unicast Ethernet frame, MACs implied by addresses
    Frame = 0x06,

    /// Ethernet frame with explicit MACs (bridging)
    ExtFrame = 0x07,

    /// Payload echo for diagnostics
    Echo = 0x08,

    /// Multicast subscription advertisement
    MulticastLike = 0x09,

    /// Network configuration request to a controller
    NetworkConfigRequest = 0x0b,

    /// Controller hint that a config should be re-requested
    NetworkConfigRefresh = 0x0c,

    /// Request for known multicast group members
    MulticastGather = 0x0d,

    /// Propagated multicast Ethernet frame
    MulticastFrame = 0x0e,

    /// Advertisement of candidate direct endpoints
    PushDirectPaths = 0x10,

    /// Source-routed connectivity probe
    CircuitTest = 0x11,

    /// Report from a circuit test hop
    CircuitTestReport = 0x12,
}

impl TryFrom<u8> for Verb {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, CoreError> {
        match value {
            0x00 => Ok(Self::Nop),
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Error),
            0x03 => Ok(Self::Ok),
            0x04 => Ok(Self::Whois),
            0x05 => Ok(Self::Rendezvous),
            0x06 => Ok(Self::Frame),
            0x07 => Ok(Self::ExtFrame),
            0x08 => Ok(Self::Echo),
            0x09 => Ok(Self::MulticastLike),
            0x0b => Ok(Self::NetworkConfigRequest),
            0x0c => Ok(Self::NetworkConfigRefresh),
            0x0d => Ok(Self::MulticastGather),
            0x0e => Ok(Self::MulticastFrame),
            0x10 => Ok(Self::PushDirectPaths),
            0x11 => Ok(Self::CircuitTest),
            0x12 => Ok(Self::CircuitTestReport),
            _ => Err(CoreError::BadParameter(format!(
                "unknown verb 0x{:02x}",
                value
            ))),
        }
    }
}

/// ERROR verb codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    /// Requested object (identity, network, test) is unknown here
    ObjNotFound = 0x01,

    /// Another identity already claims the sender's address
    IdentityCollision = 0x02,

    /// Frame rejected pending a membership certificate
    NeedMembershipCertificate = 0x03,

    /// Destination network does not exist on this node
    NoSuchNetwork = 0x04,

    /// Verb understood but not supported in this configuration
    UnsupportedOperation = 0x05,

    /// Controller refused membership
    NetworkAccessDenied = 0x06,
}

/// A 48-bit Ethernet MAC address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mac(u64);

impl Mac {
    /// The broadcast MAC ff:ff:ff:ff:ff:ff
    pub const BROADCAST: Mac = Mac(0xffff_ffff_ffff);

    /// Create from a u64, masking to 48 bits
    pub fn from_u64(value: u64) -> Self {
        Self(value & 0xffff_ffff_ffff)
    }

    /// Create from the 6-byte wire form
    pub fn from_bytes(bytes: &[u8; 6]) -> Self {
        let mut value = 0u64;
        for b in bytes {
            value = (value << 8) | u64::from(*b);
        }
        Self(value)
    }

    /// 6-byte big-endian wire form
    pub fn to_bytes(self) -> [u8; 6] {
        let mut bytes = [0u8; 6];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (self.0 >> (40 - 8 * i)) as u8;
        }
        bytes
    }

    /// Numeric value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The deterministic MAC a node wears on a given network
    pub fn from_address(address: Address, network_id: u64) -> Self {
        let mut bytes = [0u8; 6];
        let mut first = ((network_id >> 56) as u8 & 0xfe) | 0x02;
        if first == 0x52 {
            // 52:xx conflicts with common virtualization OUIs
            first = 0x32;
        }
        bytes[0] = first;
        let addr = address.to_bytes();
        for i in 0..5 {
            bytes[i + 1] = addr[i] ^ ((network_id >> (48 - 8 * i)) as u8);
        }
        Self::from_bytes(&bytes)
    }

    /// Invert `from_address`: recover the node address behind a network MAC
    pub fn to_address(self, network_id: u64) -> Address {
        let bytes = self.to_bytes();
        let mut addr = [0u8; 5];
        for i in 0..5 {
            addr[i] = bytes[i + 1] ^ ((network_id >> (48 - 8 * i)) as u8);
        }
        Address::from_bytes(&addr)
    }

    /// Group bit set (includes broadcast)
    pub fn is_multicast(self) -> bool {
        self.0 & 0x0100_0000_0000 != 0
    }

    /// All-ones broadcast MAC
    pub fn is_broadcast(self) -> bool {
        self.0 == Self::BROADCAST.0
    }
}

impl std::fmt::Debug for Mac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mac({})", self)
    }
}

impl std::fmt::Display for Mac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

// ---------------------------------------------------------------------------
// Verb payload bodies
// ---------------------------------------------------------------------------

/// HELLO: identity announcement, sent cleartext so unknown peers can learn us
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloBody {
    pub protocol_version: u8,
    pub version: (u16, u16, u16),
    pub timestamp: u64,
    pub identity: Identity,
}

/// OK: positive response, tagged with the packet it answers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkBody {
    pub in_re_verb: u8,
    pub in_re_packet_id: u64,
    pub payload: OkPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OkPayload {
    Hello {
        timestamp_echo: u64,
        protocol_version: u8,
        version: (u16, u16, u16),
        /// The physical endpoint the responder saw us on (external surface)
        external_endpoint: SocketAddr,
    },
    Whois {
        identity: Identity,
    },
    NetworkConfig {
        config: NetworkConfig,
    },
    MulticastGather {
        network_id: u64,
        group: MulticastGroup,
        members: Vec<Address>,
    },
    Echo {
        data: Vec<u8>,
    },
}

/// ERROR: negative response, tagged with the packet it answers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub in_re_verb: u8,
    pub in_re_packet_id: u64,
    pub code: ErrorCode,
    /// Network the error concerns, when applicable
    pub network_id: Option<u64>,
}

/// WHOIS: resolve an address to an identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoisBody {
    pub address: Address,
}

/// RENDEZVOUS: a shared relay tells us where to punch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousBody {
    pub peer: Address,
    pub endpoint: SocketAddr,
}

/// FRAME: unicast Ethernet frame; MACs are implied by node addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameBody {
    pub network_id: u64,
    pub ethertype: u16,
    /// Piggybacked membership certificate (credential push)
    pub com: Option<CertificateOfMembership>,
    pub payload: Vec<u8>,
}

/// EXT_FRAME: Ethernet frame with explicit MACs, used when bridging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtFrameBody {
    pub network_id: u64,
    pub com: Option<CertificateOfMembership>,
    pub to: Mac,
    pub from: Mac,
    pub ethertype: u16,
    pub vlan_id: u16,
    pub payload: Vec<u8>,
}

/// MULTICAST_LIKE: subscription advertisements
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticastLikeBody {
    pub likes: Vec<(u64, MulticastGroup)>,
}

/// MULTICAST_GATHER: ask an upstream for known group members
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticastGatherBody {
    pub network_id: u64,
    pub group: MulticastGroup,
    pub limit: u32,
}

/// MULTICAST_FRAME: propagated multicast Ethernet frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticastFrameBody {
    pub network_id: u64,
    pub group: MulticastGroup,
    pub from: Mac,
    pub ethertype: u16,
    pub com: Option<CertificateOfMembership>,
    pub payload: Vec<u8>,
}

/// NETWORK_CONFIG_REQUEST: fetch or refresh a network config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfigRequestBody {
    pub network_id: u64,
    /// Timestamp of the config we already hold, 0 for none
    pub have_timestamp: u64,
    /// Opaque requester metadata passed through to the controller
    pub metadata: Vec<u8>,
}

/// NETWORK_CONFIG_REFRESH: controller-initiated re-request hint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfigRefreshBody {
    pub network_id: u64,
}

/// PUSH_DIRECT_PATHS: candidate endpoints for a direct path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushDirectPathsBody {
    pub endpoints: Vec<SocketAddr>,
}

/// CIRCUIT_TEST: source-routed probe in flight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitTestBody {
    pub origin: Address,
    pub hop_index: u16,
    pub test: CircuitTest,
}

/// Encode a verb body
pub fn encode_body<T: Serialize>(body: &T) -> CoreResult<Vec<u8>> {
    bincode::serialize(body).map_err(|e| CoreError::Internal(format!("body encode: {}", e)))
}

/// Decode a verb body; failure means a malformed packet (drop, not error)
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| CoreError::BadParameter(format!("body decode: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_round_trip() {
        for v in [
            Verb::Nop,
            Verb::Hello,
            Verb::Error,
            Verb::Ok,
            Verb::Whois,
            Verb::Rendezvous,
            Verb::Frame,
            Verb::ExtFrame,
            Verb::Echo,
            Verb::MulticastLike,
            Verb::NetworkConfigRequest,
            Verb::NetworkConfigRefresh,
            Verb::MulticastGather,
            Verb::MulticastFrame,
            Verb::PushDirectPaths,
            Verb::CircuitTest,
            Verb::CircuitTestReport,
        ] {
            assert_eq!(Verb::try_from(v as u8).unwrap(), v);
        }
    }

    #[test]
    fn test_unknown_verb_rejected() {
        assert!(Verb::try_from(0x7f).is_err());
    }

    #[test]
    fn test_mac_round_trip() {
        let mac = Mac::from_u64(0x0123456789ab);
        assert_eq!(Mac::from_bytes(&mac.to_bytes()), mac);
    }

    #[test]
    fn test_network_mac_derivation_inverts() {
        let address = Address::from_u64(0x1a2b3c4d5e);
        let nwid = 0x8056c2e21c000001u64;

        let mac = Mac::from_address(address, nwid);
        assert!(!mac.is_multicast());
        assert_eq!(mac.to_address(nwid), address);
    }

    #[test]
    fn test_network_macs_differ_across_networks() {
        let address = Address::from_u64(0x1a2b3c4d5e);
        let a = Mac::from_address(address, 0x1111111111111111);
        let b = Mac::from_address(address, 0x2222222222222222);
        assert_ne!(a, b);
    }

    #[test]
    fn test_broadcast_and_multicast_bits() {
        assert!(Mac::BROADCAST.is_broadcast());
        assert!(Mac::BROADCAST.is_multicast());
        assert!(Mac::from_u64(0x0100_5e00_0001).is_multicast());
        assert!(!Mac::from_u64(0x02aa_bbcc_ddee).is_multicast());
    }
}
