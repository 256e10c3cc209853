//! X25519 key agreement
//!
//! Each identity carries a static Curve25519 scalar next to its Ed25519
//! signing key. Agreeing with a peer's public point yields the long-lived
//! VL1 packet key. The raw curve output is always run through HKDF-SHA256
//! before keying anything, and a degenerate (all-zero) agreement, which a
//! peer can force by publishing a low-order point, is an error rather than
//! a key.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as CurvePoint, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::constants::X25519_KEY_SIZE;
use crate::error::{CryptoError, CryptoResult};

/// Domain separator for the packet key derivation
const PACKET_KEY_INFO: &[u8] = b"ethermesh:vl1:packet";

/// Secret scalar of a node's agreement keypair. The inner scalar zeroizes
/// itself on drop.
pub struct AgreementSecret {
    scalar: StaticSecret,
}

/// Public point of a node's agreement keypair, as carried in identities
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgreementPublic([u8; X25519_KEY_SIZE]);

/// A completed static-static agreement
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    raw: [u8; X25519_KEY_SIZE],
}

impl AgreementSecret {
    /// Generate a fresh random scalar
    pub fn generate() -> Self {
        Self {
            scalar: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Rebuild from stored scalar bytes
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self {
            scalar: StaticSecret::from(bytes),
        }
    }

    /// Scalar bytes, for the identity secret blob only
    pub fn to_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        self.scalar.to_bytes()
    }

    /// The public point to publish
    pub fn public(&self) -> AgreementPublic {
        AgreementPublic(CurvePoint::from(&self.scalar).to_bytes())
    }

    /// Static-static agreement with a peer's point
    pub fn agree(&self, peer: &AgreementPublic) -> CryptoResult<SharedSecret> {
        let raw = self
            .scalar
            .diffie_hellman(&CurvePoint::from(peer.0))
            .to_bytes();
        if raw.iter().all(|b| *b == 0) {
            return Err(CryptoError::DegenerateAgreement);
        }
        Ok(SharedSecret { raw })
    }
}

impl Clone for AgreementSecret {
    fn clone(&self) -> Self {
        Self::from_bytes(self.to_bytes())
    }
}

impl AgreementPublic {
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a wire slice of exactly the point length
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; X25519_KEY_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: X25519_KEY_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for AgreementPublic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AgreementPublic({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl SharedSecret {
    /// Raw curve output; nothing outside derivations and tests should key
    /// off this directly
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.raw
    }

    /// The symmetric VL1 packet key both endpoints derive
    pub fn packet_key(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        Hkdf::<Sha256>::new(None, &self.raw)
            .expand(PACKET_KEY_INFO, &mut key)
            .expect("fixed-length HKDF expand");
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_symmetric_with_one_packet_key() {
        let a = AgreementSecret::generate();
        let b = AgreementSecret::generate();

        let ab = a.agree(&b.public()).unwrap();
        let ba = b.agree(&a.public()).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());
        assert_eq!(ab.packet_key(), ba.packet_key());
    }

    #[test]
    fn test_packet_key_is_not_the_raw_curve_output() {
        let a = AgreementSecret::generate();
        let b = AgreementSecret::generate();

        let shared = a.agree(&b.public()).unwrap();
        assert_ne!(&shared.packet_key(), shared.as_bytes());
    }

    #[test]
    fn test_low_order_peer_point_rejected() {
        let a = AgreementSecret::generate();
        let zero = AgreementPublic::from_bytes([0u8; X25519_KEY_SIZE]);
        assert!(a.agree(&zero).is_err());
    }

    #[test]
    fn test_scalar_round_trips_through_storage() {
        let secret = AgreementSecret::generate();
        let restored = AgreementSecret::from_bytes(secret.to_bytes());
        assert_eq!(secret.public(), restored.public());
    }

    #[test]
    fn test_point_slice_parsing_checks_length() {
        let public = AgreementSecret::generate().public();
        let parsed = AgreementPublic::try_from_slice(public.as_bytes()).unwrap();
        assert_eq!(parsed, public);
        assert!(AgreementPublic::try_from_slice(&[0u8; 16]).is_err());
    }
}
