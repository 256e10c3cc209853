//! Ethermesh Cryptographic Primitives
//!
//! This crate provides all cryptographic operations for the ethermesh engine:
//! - Key agreement (X25519)
//! - Digital signatures (Ed25519)
//! - Packet armor (Salsa20/12 + one-time Poly1305)
//! - Node identity with proof-of-work address derivation
//! - Key derivation (HKDF-SHA256)

pub mod error;
pub mod identity;
pub mod keys;
pub mod salsa;

pub use error::{CryptoError, CryptoResult};
pub use identity::{verify_signature, Address, Identity, Signature};
pub use keys::{AgreementPublic, AgreementSecret, SharedSecret};
pub use salsa::{one_time_mac, truncated_mac_matches, ArmorCipher};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::*;
    pub use crate::identity::*;
    pub use crate::keys::*;
    pub use crate::salsa::*;
}

/// Protocol constants
pub mod constants {
    /// X25519 key size in bytes
    pub const X25519_KEY_SIZE: usize = 32;

    /// Salsa20/12 key size
    pub const SALSA_KEY_SIZE: usize = 32;

    /// Salsa20/12 IV size (the 8-byte packet ID)
    pub const SALSA_IV_SIZE: usize = 8;

    /// One-time Poly1305 key size
    pub const POLY1305_KEY_SIZE: usize = 32;

    /// Full Poly1305 tag size (truncated to 8 bytes on the wire)
    pub const POLY1305_TAG_SIZE: usize = 16;

    /// Ed25519 signature size
    pub const SIGNATURE_SIZE: usize = 64;

    /// Ed25519 public key size
    pub const ED25519_PUBKEY_SIZE: usize = 32;

    /// Node address size (40 bits)
    pub const ADDRESS_SIZE: usize = 5;

    /// Combined public key blob size (signing + agreement)
    pub const PUBLIC_BLOB_SIZE: usize = 64;

    /// Identity wire form: address + type byte + public blob
    pub const IDENTITY_WIRE_SIZE: usize = ADDRESS_SIZE + 1 + PUBLIC_BLOB_SIZE;

    /// Identity key type: Curve25519/Ed25519 suite
    pub const IDENTITY_TYPE_C25519: u8 = 0;

    /// Proof-of-work table size for identity generation
    pub const IDENTITY_GEN_MEMORY: usize = 1024 * 1024;

    /// First byte of the work digest must be below this for a valid identity
    pub const IDENTITY_GEN_HASHCASH_THRESHOLD: u8 = 17;
}
