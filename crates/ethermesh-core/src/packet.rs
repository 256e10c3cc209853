//! VL1 packet codec
//!
//! Fixed wire header, big-endian:
//! `[packetID:8][dest:5][src:5][flags(3b)|hops(3b)|cipher(2b)][MAC:8][verb:1][payload]`
//!
//! The MAC covers a canonicalized header (hops bits zeroed, MAC field
//! excluded) plus the verb+payload region after encryption, so relays can
//! bump the hop count without touching the MAC and any other mutation is
//! rejected. Packets larger than the wire MTU split into a head packet and
//! up to 15 tail fragments:
//! `[packetID:8][dest:5][0xff:1][fragNo(4b)|totalFrags(4b)][hops(3b)|reserved(5b)][data]`

use bytes::{BufMut, Bytes, BytesMut};

use ethermesh_crypto::{one_time_mac, truncated_mac_matches, Address, ArmorCipher, CryptoError};

use crate::error::{CoreError, CoreResult};
use crate::protocol::{Verb, FRAGMENT_MTU, MAX_FRAGMENTS, MAX_HOPS, WIRE_MTU};

/// Header length; the verb byte follows immediately
pub const HEADER_SIZE: usize = 27;

/// Minimum valid packet: header + verb
pub const MIN_PACKET_SIZE: usize = HEADER_SIZE + 1;

/// Fragment header length
pub const FRAGMENT_HEADER_SIZE: usize = 16;

/// Minimum valid fragment: header + at least one data byte
pub const MIN_FRAGMENT_SIZE: usize = FRAGMENT_HEADER_SIZE + 1;

/// Byte 13 of a fragment; a VL1 source address never starts with 0xff
pub const FRAGMENT_INDICATOR: u8 = 0xff;

/// Flag bit (within the 3-bit flags field) marking that fragments follow
pub const FLAG_FRAGMENTED: u8 = 0b001;

/// Largest payload a fully fragmented packet can carry. The 4-bit total
/// field caps a packet at 15 datagrams, head included.
pub const MAX_PACKET_PAYLOAD: usize =
    (WIRE_MTU - MIN_PACKET_SIZE) + (MAX_FRAGMENTS - 2) * FRAGMENT_MTU;

const IDX_FLAGS: usize = 18;
const IDX_MAC: usize = 19;
const IDX_VERB: usize = HEADER_SIZE;

/// Wire cipher suite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cipher {
    /// Cleartext payload, still MACed; only HELLO and its responses use this
    Cleartext = 0,

    /// Salsa20/12 encrypted payload with one-time Poly1305 (default)
    Salsa2012Poly1305 = 1,
}

impl TryFrom<u8> for Cipher {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, CoreError> {
        match value {
            0 => Ok(Self::Cleartext),
            1 => Ok(Self::Salsa2012Poly1305),
            _ => Err(CoreError::BadParameter(format!(
                "unknown cipher suite {}",
                value
            ))),
        }
    }
}

/// A parsed VL1 packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub id: u64,
    pub dest: Address,
    pub src: Address,
    pub flags: u8,
    pub hops: u8,
    pub cipher: Cipher,
    pub verb: Verb,
    pub payload: Bytes,
}

impl Packet {
    /// Create an outbound packet (hops 0, default cipher)
    pub fn new(id: u64, dest: Address, src: Address, verb: Verb, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            dest,
            src,
            flags: 0,
            hops: 0,
            cipher: Cipher::Salsa2012Poly1305,
            verb,
            payload: payload.into(),
        }
    }

    /// Create a cleartext outbound packet (HELLO)
    pub fn new_cleartext(
        id: u64,
        dest: Address,
        src: Address,
        verb: Verb,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            cipher: Cipher::Cleartext,
            ..Self::new(id, dest, src, verb, payload)
        }
    }

    /// Serialize, encrypt and MAC into the wire form
    pub fn encode(&self, key: &[u8; 32]) -> CoreResult<Vec<u8>> {
        if self.payload.len() > MAX_PACKET_PAYLOAD {
            return Err(CoreError::BadParameter(format!(
                "payload of {} exceeds maximum packet size",
                self.payload.len()
            )));
        }

        let total = MIN_PACKET_SIZE + self.payload.len();
        let mut flags = self.flags;
        if total > WIRE_MTU {
            flags |= FLAG_FRAGMENTED;
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u64(self.id);
        buf.put_slice(&self.dest.to_bytes());
        buf.put_slice(&self.src.to_bytes());
        buf.put_u8(flag_byte(flags, self.hops, self.cipher));
        buf.put_slice(&[0u8; 8]); // MAC, filled below
        buf.put_u8(self.verb as u8);
        buf.put_slice(&self.payload);
        let mut raw = buf.to_vec();

        let mut armor = ArmorCipher::new(key, self.id);
        if self.cipher == Cipher::Salsa2012Poly1305 {
            armor.apply_keystream(&mut raw[IDX_VERB..]);
        }

        let canonical = canonical_header(&raw);
        let tag = one_time_mac(armor.poly_key(), &[&canonical, &raw[IDX_VERB..]]);
        raw[IDX_MAC..IDX_MAC + 8].copy_from_slice(&tag[..8]);

        Ok(raw)
    }

    /// Verify the MAC, decrypt and parse the wire form
    pub fn decode(raw: &[u8], key: &[u8; 32]) -> CoreResult<Packet> {
        if raw.len() < MIN_PACKET_SIZE {
            return Err(CoreError::BadParameter("packet too short".into()));
        }

        let id = peek_packet_id(raw);
        let flag = raw[IDX_FLAGS];
        let cipher = Cipher::try_from(flag & 0b11)?;

        let mut armor = ArmorCipher::new(key, id);
        let canonical = canonical_header(raw);
        let tag = one_time_mac(armor.poly_key(), &[&canonical, &raw[IDX_VERB..]]);
        if !truncated_mac_matches(&raw[IDX_MAC..IDX_MAC + 8], &tag) {
            return Err(CoreError::Crypto(CryptoError::MacMismatch));
        }

        let mut region = raw[IDX_VERB..].to_vec();
        if cipher == Cipher::Salsa2012Poly1305 {
            armor.apply_keystream(&mut region);
        }

        let verb = Verb::try_from(region[0])?;
        Ok(Packet {
            id,
            dest: peek_dest(raw),
            src: peek_source(raw),
            flags: flag >> 5,
            hops: (flag >> 2) & 0b111,
            cipher,
            verb,
            payload: Bytes::from(region.split_off(1)),
        })
    }

    /// Whether the encoded form carries the fragmented flag
    pub fn is_flagged_fragmented(raw: &[u8]) -> bool {
        raw.len() > IDX_FLAGS && (raw[IDX_FLAGS] >> 5) & FLAG_FRAGMENTED != 0
    }
}

fn flag_byte(flags: u8, hops: u8, cipher: Cipher) -> u8 {
    ((flags & 0b111) << 5) | ((hops & 0b111) << 2) | (cipher as u8)
}

/// Header with the MAC field dropped and hops bits zeroed; relays mutate
/// hops, so it cannot be under the MAC.
fn canonical_header(raw: &[u8]) -> [u8; IDX_MAC] {
    let mut canonical = [0u8; IDX_MAC];
    canonical.copy_from_slice(&raw[..IDX_MAC]);
    canonical[IDX_FLAGS] &= !(0b111 << 2);
    canonical
}

/// Packet ID of a raw head packet or fragment
pub fn peek_packet_id(raw: &[u8]) -> u64 {
    u64::from_be_bytes(raw[..8].try_into().unwrap())
}

/// Destination address of a raw head packet or fragment
pub fn peek_dest(raw: &[u8]) -> Address {
    Address::try_from_slice(&raw[8..13]).unwrap()
}

/// Source address of a raw head packet
pub fn peek_source(raw: &[u8]) -> Address {
    Address::try_from_slice(&raw[13..18]).unwrap()
}

/// Cipher suite of a raw head packet
pub fn peek_cipher(raw: &[u8]) -> CoreResult<Cipher> {
    Cipher::try_from(raw[IDX_FLAGS] & 0b11)
}

/// Verb byte of a raw head packet; only meaningful for cleartext packets
pub fn peek_verb_raw(raw: &[u8]) -> u8 {
    raw[IDX_VERB]
}

/// Hop count of a raw head packet
pub fn peek_hops(raw: &[u8]) -> u8 {
    (raw[IDX_FLAGS] >> 2) & 0b111
}

/// Whether a raw datagram is a tail fragment
pub fn is_fragment(raw: &[u8]) -> bool {
    raw.len() >= MIN_FRAGMENT_SIZE && raw[13] == FRAGMENT_INDICATOR
}

/// Increment the hop count of a raw head packet in place, without touching
/// the MAC. Returns the new count, or None if the packet has expired.
pub fn bump_hops(raw: &mut [u8]) -> Option<u8> {
    let hops = peek_hops(raw);
    if hops >= MAX_HOPS {
        return None;
    }
    let flag = raw[IDX_FLAGS];
    raw[IDX_FLAGS] = (flag & !(0b111 << 2)) | ((hops + 1) << 2);
    Some(hops + 1)
}

/// A tail fragment of an oversized packet
#[derive(Debug, Clone)]
pub struct Fragment {
    pub packet_id: u64,
    pub dest: Address,
    pub fragment_no: u8,
    pub total_fragments: u8,
    pub hops: u8,
    pub payload: Bytes,
}

impl Fragment {
    /// Serialize to the wire form
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_SIZE + self.payload.len());
        buf.put_u64(self.packet_id);
        buf.put_slice(&self.dest.to_bytes());
        buf.put_u8(FRAGMENT_INDICATOR);
        buf.put_u8((self.fragment_no << 4) | (self.total_fragments & 0x0f));
        buf.put_u8((self.hops & 0b111) << 5);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Parse the wire form
    pub fn decode(raw: &[u8]) -> CoreResult<Fragment> {
        if raw.len() < MIN_FRAGMENT_SIZE || raw[13] != FRAGMENT_INDICATOR {
            return Err(CoreError::BadParameter("not a fragment".into()));
        }
        let split = raw[14];
        let fragment_no = split >> 4;
        let total_fragments = split & 0x0f;
        if fragment_no == 0 || total_fragments < 2 || fragment_no >= total_fragments {
            return Err(CoreError::BadParameter("bad fragment numbering".into()));
        }
        Ok(Fragment {
            packet_id: peek_packet_id(raw),
            dest: peek_dest(raw),
            fragment_no,
            total_fragments,
            hops: raw[15] >> 5,
            payload: Bytes::copy_from_slice(&raw[FRAGMENT_HEADER_SIZE..]),
        })
    }
}

/// Split an encoded packet into wire datagrams: the head, then fragments.
/// Packets within the MTU come back as a single datagram.
pub fn split_fragments(raw: Vec<u8>) -> CoreResult<Vec<Vec<u8>>> {
    if raw.len() <= WIRE_MTU {
        return Ok(vec![raw]);
    }

    let tail = &raw[WIRE_MTU..];
    let tail_count = tail.len().div_ceil(FRAGMENT_MTU);
    let total = tail_count + 1;
    if total >= MAX_FRAGMENTS {
        return Err(CoreError::BadParameter(
            "packet too large to fragment".into(),
        ));
    }

    let packet_id = peek_packet_id(&raw);
    let dest = peek_dest(&raw);
    let hops = peek_hops(&raw);

    let mut out = Vec::with_capacity(total);
    for (i, chunk) in tail.chunks(FRAGMENT_MTU).enumerate() {
        out.push(
            Fragment {
                packet_id,
                dest,
                fragment_no: (i + 1) as u8,
                total_fragments: total as u8,
                hops,
                payload: Bytes::copy_from_slice(chunk),
            }
            .encode(),
        );
    }
    let mut head = raw;
    head.truncate(WIRE_MTU);
    out.insert(0, head);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addresses() -> (Address, Address) {
        (
            Address::from_u64(0x1122334455),
            Address::from_u64(0xaabbccdd00),
        )
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let (dest, src) = test_addresses();
        let key = [0x42u8; 32];
        let packet = Packet::new(7, dest, src, Verb::Echo, vec![1, 2, 3, 4, 5]);

        let raw = packet.encode(&key).unwrap();
        let decoded = Packet::decode(&raw, &key).unwrap();

        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.dest, dest);
        assert_eq!(decoded.src, src);
        assert_eq!(decoded.verb, Verb::Echo);
        assert_eq!(decoded.cipher, Cipher::Salsa2012Poly1305);
        assert_eq!(&decoded.payload[..], &[1, 2, 3, 4, 5]);

        // Re-encoding under the same key and ID yields the same bytes.
        assert_eq!(decoded.encode(&key).unwrap(), raw);
    }

    #[test]
    fn test_cleartext_round_trip() {
        let (dest, src) = test_addresses();
        let key = [9u8; 32];
        let packet = Packet::new_cleartext(1, dest, src, Verb::Hello, vec![7; 40]);

        let raw = packet.encode(&key).unwrap();
        // Payload visible on the wire
        assert_eq!(&raw[IDX_VERB + 1..], &[7u8; 40][..]);

        let decoded = Packet::decode(&raw, &key).unwrap();
        assert_eq!(decoded.cipher, Cipher::Cleartext);
        assert_eq!(&decoded.payload[..], &[7u8; 40][..]);
    }

    #[test]
    fn test_encrypted_payload_unreadable_on_wire() {
        let (dest, src) = test_addresses();
        let key = [3u8; 32];
        let packet = Packet::new(2, dest, src, Verb::Frame, vec![0u8; 64]);

        let raw = packet.encode(&key).unwrap();
        assert_ne!(&raw[IDX_VERB + 1..], &[0u8; 64][..]);
    }

    #[test]
    fn test_mac_rejects_every_bit_outside_hops() {
        let (dest, src) = test_addresses();
        let key = [5u8; 32];
        let packet = Packet::new(3, dest, src, Verb::Echo, vec![0xaa; 32]);
        let raw = packet.encode(&key).unwrap();

        for byte in 0..raw.len() {
            for bit in 0..8 {
                // The three hop bits are the only mutable region.
                if byte == IDX_FLAGS && (2..5).contains(&bit) {
                    continue;
                }
                let mut mutated = raw.clone();
                mutated[byte] ^= 1 << bit;
                assert!(
                    Packet::decode(&mutated, &key).is_err(),
                    "mutation at byte {} bit {} was accepted",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_hops_mutation_survives_mac() {
        let (dest, src) = test_addresses();
        let key = [6u8; 32];
        let packet = Packet::new(4, dest, src, Verb::Echo, vec![1; 8]);
        let mut raw = packet.encode(&key).unwrap();

        assert_eq!(bump_hops(&mut raw), Some(1));
        assert_eq!(bump_hops(&mut raw), Some(2));
        let decoded = Packet::decode(&raw, &key).unwrap();
        assert_eq!(decoded.hops, 2);
    }

    #[test]
    fn test_hops_expire_at_limit() {
        let (dest, src) = test_addresses();
        let key = [6u8; 32];
        let mut raw = Packet::new(4, dest, src, Verb::Echo, vec![])
            .encode(&key)
            .unwrap();

        for _ in 0..MAX_HOPS {
            assert!(bump_hops(&mut raw).is_some());
        }
        assert_eq!(bump_hops(&mut raw), None);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (dest, src) = test_addresses();
        let packet = Packet::new(5, dest, src, Verb::Echo, vec![1, 2, 3]);
        let raw = packet.encode(&[1u8; 32]).unwrap();

        assert!(Packet::decode(&raw, &[2u8; 32]).is_err());
    }

    #[test]
    fn test_fragmentation_round_trip() {
        let (dest, src) = test_addresses();
        let key = [8u8; 32];
        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let packet = Packet::new(6, dest, src, Verb::Frame, payload.clone());

        let raw = packet.encode(&key).unwrap();
        assert!(Packet::is_flagged_fragmented(&raw));

        let pieces = split_fragments(raw.clone()).unwrap();
        assert_eq!(pieces.len(), 3);
        assert!(pieces[0].len() <= WIRE_MTU);
        assert!(!is_fragment(&pieces[0]));
        assert!(is_fragment(&pieces[1]));

        // Reassemble by hand and decode
        let mut rebuilt = pieces[0].clone();
        for piece in &pieces[1..] {
            let frag = Fragment::decode(piece).unwrap();
            assert_eq!(frag.packet_id, 6);
            assert_eq!(frag.dest, dest);
            rebuilt.extend_from_slice(&frag.payload);
        }
        assert_eq!(rebuilt, raw);

        let decoded = Packet::decode(&rebuilt, &key).unwrap();
        assert_eq!(&decoded.payload[..], &payload[..]);
    }

    #[test]
    fn test_small_packet_not_fragmented() {
        let (dest, src) = test_addresses();
        let raw = Packet::new(1, dest, src, Verb::Echo, vec![0; 100])
            .encode(&[0u8; 32])
            .unwrap();
        assert!(!Packet::is_flagged_fragmented(&raw));
        assert_eq!(split_fragments(raw).unwrap().len(), 1);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let (dest, src) = test_addresses();
        let packet = Packet::new(1, dest, src, Verb::Frame, vec![0; MAX_PACKET_PAYLOAD + 1]);
        assert!(packet.encode(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_maximum_payload_splits_and_reassembles() {
        let (dest, src) = test_addresses();
        let key = [2u8; 32];
        let payload: Vec<u8> = (0..MAX_PACKET_PAYLOAD as u32).map(|i| i as u8).collect();

        let raw = Packet::new(9, dest, src, Verb::Frame, payload.clone())
            .encode(&key)
            .unwrap();
        let pieces = split_fragments(raw.clone()).unwrap();
        assert_eq!(pieces.len(), MAX_FRAGMENTS - 1);

        let mut rebuilt = pieces[0].clone();
        for piece in &pieces[1..] {
            rebuilt.extend_from_slice(&Fragment::decode(piece).unwrap().payload);
        }
        assert_eq!(rebuilt, raw);
        assert_eq!(&Packet::decode(&rebuilt, &key).unwrap().payload[..], &payload[..]);
    }

    #[test]
    fn test_fragment_numbering_validated() {
        let (dest, _) = test_addresses();
        let frag = Fragment {
            packet_id: 1,
            dest,
            fragment_no: 0,
            total_fragments: 2,
            hops: 0,
            payload: Bytes::from_static(b"x"),
        };
        assert!(Fragment::decode(&frag.encode()).is_err());
    }
}
