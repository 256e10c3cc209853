//! Packet Armor (Salsa20/12 + one-time Poly1305)
//!
//! The VL1 wire cipher. Each packet is keyed by the per-peer shared key with
//! the 8-byte packet ID as the stream IV. The first 64-byte keystream block
//! is discarded except for its leading 32 bytes, which become the one-time
//! Poly1305 key; payload encryption starts at block 1. The 16-byte tag is
//! truncated to 8 bytes on the wire.

use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa12;

use crate::constants::{POLY1305_KEY_SIZE, POLY1305_TAG_SIZE, SALSA_KEY_SIZE};

/// Per-packet cipher state: a positioned Salsa20/12 stream plus the one-time
/// MAC key extracted from its first block.
pub struct ArmorCipher {
    poly_key: [u8; POLY1305_KEY_SIZE],
    salsa: Salsa12,
}

impl ArmorCipher {
    /// Set up the cipher for one packet. `packet_id` doubles as the IV, so
    /// callers must never reuse a packet ID under the same key.
    pub fn new(key: &[u8; SALSA_KEY_SIZE], packet_id: u64) -> Self {
        let iv = packet_id.to_be_bytes();
        let mut salsa = Salsa12::new(key.into(), (&iv).into());

        // Burn block 0; its head is the one-time Poly1305 key.
        let mut block0 = [0u8; 64];
        salsa.apply_keystream(&mut block0);
        let mut poly_key = [0u8; POLY1305_KEY_SIZE];
        poly_key.copy_from_slice(&block0[..POLY1305_KEY_SIZE]);

        Self { poly_key, salsa }
    }

    /// The one-time Poly1305 key for this packet
    pub fn poly_key(&self) -> &[u8; POLY1305_KEY_SIZE] {
        &self.poly_key
    }

    /// XOR the payload keystream into `data` (encrypts or decrypts)
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        self.salsa.apply_keystream(data);
    }
}

/// Compute a one-time Poly1305 tag over the concatenation of `parts`
pub fn one_time_mac(key: &[u8; POLY1305_KEY_SIZE], parts: &[&[u8]]) -> [u8; POLY1305_TAG_SIZE] {
    use poly1305::universal_hash::KeyInit;
    use poly1305::Poly1305;

    let total: usize = parts.iter().map(|p| p.len()).sum();
    let mut message = Vec::with_capacity(total);
    for part in parts {
        message.extend_from_slice(part);
    }

    Poly1305::new(key.into()).compute_unpadded(&message).into()
}

/// Constant-time comparison of a truncated wire tag against a full tag
pub fn truncated_mac_matches(wire: &[u8], full: &[u8; POLY1305_TAG_SIZE]) -> bool {
    if wire.len() > POLY1305_TAG_SIZE {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in wire.iter().zip(full.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}
