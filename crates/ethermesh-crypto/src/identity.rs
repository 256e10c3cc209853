//! Node Identity
//!
//! Each node holds a long-lived dual keypair (Ed25519 for signatures, X25519
//! for key agreement). The node's 40-bit address is carved from a
//! proof-of-work digest over the combined public keys: candidates whose
//! digest fails the hashcash threshold, or whose address lands on a reserved
//! value, are discarded and regenerated. Validation re-runs the work, so an
//! address cannot be claimed without the matching keys and proof.

use ed25519_dalek::{Signature as Ed25519Sig, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use salsa20::Salsa12;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use sha2::{Digest, Sha512};
use zeroize::ZeroizeOnDrop;

use crate::constants::{
    ADDRESS_SIZE, ED25519_PUBKEY_SIZE, IDENTITY_GEN_HASHCASH_THRESHOLD, IDENTITY_GEN_MEMORY,
    IDENTITY_TYPE_C25519, IDENTITY_WIRE_SIZE, PUBLIC_BLOB_SIZE, SIGNATURE_SIZE,
};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{AgreementPublic, AgreementSecret, SharedSecret};

/// A 40-bit node address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(u64);

/// Ed25519 signature
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "BigArray")]
    bytes: [u8; SIGNATURE_SIZE],
}

/// Secret half of an identity
#[derive(ZeroizeOnDrop)]
struct IdentitySecret {
    #[zeroize(skip)]
    signing: SigningKey,
    #[zeroize(skip)]
    agreement: AgreementSecret,
}

/// A node's identity: address plus public keys, optionally with secrets
pub struct Identity {
    address: Address,
    signing_public: [u8; ED25519_PUBKEY_SIZE],
    agreement_public: AgreementPublic,
    secret: Option<IdentitySecret>,
}

impl Address {
    /// All-ones broadcast address, reserved
    pub const BROADCAST: u64 = 0xff_ffff_ffff;

    /// Create from a u64, masking to 40 bits
    pub fn from_u64(value: u64) -> Self {
        Self(value & Self::BROADCAST)
    }

    /// Create from the 5-byte wire form
    pub fn from_bytes(bytes: &[u8; ADDRESS_SIZE]) -> Self {
        let mut value = 0u64;
        for b in bytes {
            value = (value << 8) | u64::from(*b);
        }
        Self(value)
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() < ADDRESS_SIZE {
            return Err(CryptoError::SerializationError(
                "address too short".into(),
            ));
        }
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes.copy_from_slice(&slice[..ADDRESS_SIZE]);
        Ok(Self::from_bytes(&bytes))
    }

    /// 5-byte big-endian wire form
    pub fn to_bytes(self) -> [u8; ADDRESS_SIZE] {
        let mut bytes = [0u8; ADDRESS_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (self.0 >> (32 - 8 * i)) as u8;
        }
        bytes
    }

    /// Numeric value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// 0x0000000000 and 0xffffffffff are never valid node addresses
    pub fn is_reserved(self) -> bool {
        self.0 == 0 || self.0 == Self::BROADCAST
    }

    /// 10-digit hex form
    pub fn to_hex(self) -> String {
        format!("{:010x}", self.0)
    }

    /// Parse the 10-digit hex form
    pub fn from_hex(hex: &str) -> CryptoResult<Self> {
        let value = u64::from_str_radix(hex, 16)
            .map_err(|_| CryptoError::SerializationError("invalid address hex".into()))?;
        if value > Self::BROADCAST {
            return Err(CryptoError::SerializationError(
                "address exceeds 40 bits".into(),
            ));
        }
        Ok(Self(value))
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Signature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignature);
        }
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({:02x}{:02x}..)", self.bytes[0], self.bytes[1])
    }
}

/// Verify a detached Ed25519 signature under a raw public key
pub fn verify_signature(
    public: &[u8; ED25519_PUBKEY_SIZE],
    message: &[u8],
    signature: &Signature,
) -> CryptoResult<()> {
    let key = VerifyingKey::from_bytes(public).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = Ed25519Sig::from_bytes(&signature.bytes);
    key.verify(message, &sig)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}

/// The memory-hard identity work function.
///
/// A SHA-512 seed digest over the public blob keys a Salsa20/12 fill of a
/// 1 MiB table, followed by a data-dependent word stir so the final state
/// cannot be computed without materializing the table. Returns the final
/// SHA-512 digest; the caller checks the hashcash threshold and reads the
/// address out of the tail.
fn identity_work(public_blob: &[u8; PUBLIC_BLOB_SIZE]) -> [u8; 64] {
    let mut seed = [0u8; 64];
    seed.copy_from_slice(&Sha512::digest(public_blob));

    let mut key = [0u8; 32];
    key.copy_from_slice(&seed[..32]);
    let mut iv = [0u8; 8];
    iv.copy_from_slice(&seed[32..40]);

    let mut table = vec![0u8; IDENTITY_GEN_MEMORY];
    let mut salsa = Salsa12::new((&key).into(), (&iv).into());
    salsa.apply_keystream(&mut table);

    // Data-dependent stir: each 8-byte word trades places with the word its
    // own value points at.
    let words = IDENTITY_GEN_MEMORY / 8;
    for i in 0..words {
        let at = i * 8;
        let word = u64::from_be_bytes(table[at..at + 8].try_into().unwrap());
        let j = (word as usize % words) * 8;
        if j != at {
            for k in 0..8 {
                table.swap(at + k, j + k);
            }
        }
    }

    let mut hasher = Sha512::new();
    hasher.update(seed);
    hasher.update(&table[..64]);
    let mut digest = [0u8; 64];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

fn address_from_digest(digest: &[u8; 64]) -> Address {
    let mut bytes = [0u8; ADDRESS_SIZE];
    bytes.copy_from_slice(&digest[64 - ADDRESS_SIZE..]);
    Address::from_bytes(&bytes)
}

impl Identity {
    /// Generate a new identity, grinding until the proof-of-work threshold
    /// is met and the derived address is not reserved.
    pub fn generate() -> Self {
        loop {
            let signing = SigningKey::generate(&mut OsRng);
            let agreement = AgreementSecret::generate();

            let signing_public = signing.verifying_key().to_bytes();
            let agreement_public = agreement.public();

            let blob = public_blob(&signing_public, &agreement_public);
            let digest = identity_work(&blob);
            if digest[0] >= IDENTITY_GEN_HASHCASH_THRESHOLD {
                continue;
            }

            let address = address_from_digest(&digest);
            if address.is_reserved() {
                continue;
            }

            return Self {
                address,
                signing_public,
                agreement_public,
                secret: Some(IdentitySecret { signing, agreement }),
            };
        }
    }

    /// Re-run the work function and check that this identity's address and
    /// proof are legitimate.
    pub fn validate(&self) -> CryptoResult<()> {
        let blob = public_blob(&self.signing_public, &self.agreement_public);
        let digest = identity_work(&blob);
        if digest[0] >= IDENTITY_GEN_HASHCASH_THRESHOLD {
            return Err(CryptoError::InvalidIdentity(
                "proof of work below threshold".into(),
            ));
        }
        let address = address_from_digest(&digest);
        if address.is_reserved() {
            return Err(CryptoError::ReservedAddress);
        }
        if address != self.address {
            return Err(CryptoError::InvalidIdentity(
                "address does not match public key".into(),
            ));
        }
        Ok(())
    }

    /// The node's 40-bit address
    pub fn address(&self) -> Address {
        self.address
    }

    /// Raw Ed25519 public key
    pub fn signing_public(&self) -> &[u8; ED25519_PUBKEY_SIZE] {
        &self.signing_public
    }

    /// X25519 public point
    pub fn agreement_public(&self) -> &AgreementPublic {
        &self.agreement_public
    }

    /// Whether the secret half is present
    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// A copy carrying only the public half
    pub fn public_clone(&self) -> Identity {
        Identity {
            address: self.address,
            signing_public: self.signing_public,
            agreement_public: self.agreement_public,
            secret: None,
        }
    }

    /// Sign a message (requires the secret half)
    pub fn sign(&self, message: &[u8]) -> CryptoResult<Signature> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidIdentity("no secret key".into()))?;
        let sig = secret.signing.sign(message);
        Ok(Signature {
            bytes: sig.to_bytes(),
        })
    }

    /// Verify a signature made by this identity
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        verify_signature(&self.signing_public, message, signature)
    }

    /// X25519 agreement with another identity (requires our secret half)
    pub fn agree(&self, other: &Identity) -> CryptoResult<SharedSecret> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidIdentity("no secret key".into()))?;
        secret.agreement.agree(&other.agreement_public)
    }

    /// Text form: `aabbccddee:0:<public hex>[:<secret hex>]`
    pub fn to_text(&self, include_secret: bool) -> String {
        let mut out = format!(
            "{}:{}:{}{}",
            self.address.to_hex(),
            IDENTITY_TYPE_C25519,
            hex_encode(&self.signing_public),
            hex_encode(self.agreement_public.as_bytes()),
        );
        if include_secret {
            if let Some(secret) = &self.secret {
                out.push(':');
                out.push_str(&hex_encode(&secret.signing.to_bytes()));
                out.push_str(&hex_encode(&secret.agreement.to_bytes()));
            }
        }
        out
    }

    /// Parse the text form, validating the proof of work
    pub fn parse(text: &str) -> CryptoResult<Self> {
        let fields: Vec<&str> = text.trim().split(':').collect();
        if fields.len() < 3 {
            return Err(CryptoError::InvalidIdentity("too few fields".into()));
        }

        let address = Address::from_hex(fields[0])?;
        if fields[1] != "0" {
            return Err(CryptoError::InvalidIdentity(format!(
                "unknown identity type {}",
                fields[1]
            )));
        }

        let publics = hex_decode(fields[2])?;
        if publics.len() != PUBLIC_BLOB_SIZE {
            return Err(CryptoError::InvalidIdentity("bad public key length".into()));
        }
        let mut signing_public = [0u8; ED25519_PUBKEY_SIZE];
        signing_public.copy_from_slice(&publics[..ED25519_PUBKEY_SIZE]);
        let agreement_public = AgreementPublic::try_from_slice(&publics[ED25519_PUBKEY_SIZE..])?;

        let secret = if fields.len() > 3 {
            let secrets = hex_decode(fields[3])?;
            if secrets.len() != 64 {
                return Err(CryptoError::InvalidIdentity("bad secret key length".into()));
            }
            let mut signing_bytes = [0u8; 32];
            signing_bytes.copy_from_slice(&secrets[..32]);
            let mut agreement_bytes = [0u8; 32];
            agreement_bytes.copy_from_slice(&secrets[32..]);
            Some(IdentitySecret {
                signing: SigningKey::from_bytes(&signing_bytes),
                agreement: AgreementSecret::from_bytes(agreement_bytes),
            })
        } else {
            None
        };

        let identity = Self {
            address,
            signing_public,
            agreement_public,
            secret,
        };
        identity.validate()?;

        if let Some(secret) = &identity.secret {
            if secret.signing.verifying_key().to_bytes() != identity.signing_public {
                return Err(CryptoError::InvalidIdentity(
                    "secret does not match public".into(),
                ));
            }
        }

        Ok(identity)
    }

    /// Public wire form: address(5) + type(1) + public blob(64)
    pub fn to_wire_bytes(&self) -> [u8; IDENTITY_WIRE_SIZE] {
        let mut out = [0u8; IDENTITY_WIRE_SIZE];
        out[..ADDRESS_SIZE].copy_from_slice(&self.address.to_bytes());
        out[ADDRESS_SIZE] = IDENTITY_TYPE_C25519;
        out[ADDRESS_SIZE + 1..ADDRESS_SIZE + 1 + ED25519_PUBKEY_SIZE]
            .copy_from_slice(&self.signing_public);
        out[ADDRESS_SIZE + 1 + ED25519_PUBKEY_SIZE..]
            .copy_from_slice(self.agreement_public.as_bytes());
        out
    }

    /// Parse the public wire form, validating the proof of work
    pub fn from_wire_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() < IDENTITY_WIRE_SIZE {
            return Err(CryptoError::InvalidIdentity("wire form too short".into()));
        }
        let address = Address::try_from_slice(bytes)?;
        if bytes[ADDRESS_SIZE] != IDENTITY_TYPE_C25519 {
            return Err(CryptoError::InvalidIdentity(format!(
                "unknown identity type {}",
                bytes[ADDRESS_SIZE]
            )));
        }
        let mut signing_public = [0u8; ED25519_PUBKEY_SIZE];
        signing_public.copy_from_slice(&bytes[ADDRESS_SIZE + 1..ADDRESS_SIZE + 1 + 32]);
        let agreement_public =
            AgreementPublic::try_from_slice(&bytes[ADDRESS_SIZE + 1 + 32..IDENTITY_WIRE_SIZE])?;

        let identity = Self {
            address,
            signing_public,
            agreement_public,
            secret: None,
        };
        identity.validate()?;
        Ok(identity)
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            address: self.address,
            signing_public: self.signing_public,
            agreement_public: self.agreement_public,
            secret: self.secret.as_ref().map(|s| IdentitySecret {
                signing: SigningKey::from_bytes(&s.signing.to_bytes()),
                agreement: s.agreement.clone(),
            }),
        }
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.signing_public == other.signing_public
            && self.agreement_public == other.agreement_public
    }
}

impl Eq for Identity {}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.address)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_text(false))
    }
}

// Worlds and HELLOs carry identities; only the public half ever crosses a
// serde boundary, and deserialization re-validates the proof of work.
impl Serialize for Identity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_wire_bytes())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        Identity::from_wire_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

fn public_blob(
    signing_public: &[u8; ED25519_PUBKEY_SIZE],
    agreement_public: &AgreementPublic,
) -> [u8; PUBLIC_BLOB_SIZE] {
    let mut blob = [0u8; PUBLIC_BLOB_SIZE];
    blob[..ED25519_PUBKEY_SIZE].copy_from_slice(signing_public);
    blob[ED25519_PUBKEY_SIZE..].copy_from_slice(agreement_public.as_bytes());
    blob
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(hex: &str) -> CryptoResult<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(CryptoError::SerializationError("invalid hex length".into()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| CryptoError::SerializationError("invalid hex character".into()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        let address = Address::from_u64(0x1122334455);
        assert_eq!(Address::from_bytes(&address.to_bytes()), address);
        assert_eq!(Address::from_hex(&address.to_hex()).unwrap(), address);
    }

    #[test]
    fn test_reserved_addresses() {
        assert!(Address::from_u64(0).is_reserved());
        assert!(Address::from_u64(Address::BROADCAST).is_reserved());
        assert!(!Address::from_u64(0x1122334455).is_reserved());
    }

    #[test]
    fn test_generate_satisfies_work_threshold() {
        let identity = Identity::generate();
        assert!(identity.validate().is_ok());
        assert!(!identity.address().is_reserved());
    }

    #[test]
    fn test_text_round_trip_public() {
        let identity = Identity::generate();
        let text = identity.to_text(false);

        let parsed = Identity::parse(&text).unwrap();
        assert_eq!(parsed.address(), identity.address());
        assert!(!parsed.has_secret());
    }

    #[test]
    fn test_text_round_trip_with_secret_signs() {
        let identity = Identity::generate();
        let text = identity.to_text(true);

        let parsed = Identity::parse(&text).unwrap();
        assert!(parsed.has_secret());

        let sig = parsed.sign(b"x").unwrap();
        assert!(identity.verify(b"x", &sig).is_ok());
    }

    #[test]
    fn test_wire_round_trip() {
        let identity = Identity::generate();
        let wire = identity.to_wire_bytes();

        let parsed = Identity::from_wire_bytes(&wire).unwrap();
        assert_eq!(parsed, identity.public_clone());
    }

    #[test]
    fn test_forged_address_rejected() {
        let identity = Identity::generate();
        let mut wire = identity.to_wire_bytes();
        wire[0] ^= 0x01;

        assert!(Identity::from_wire_bytes(&wire).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let identity = Identity::generate();
        let message = b"hello ethermesh";

        let sig = identity.sign(message).unwrap();
        assert!(identity.verify(message, &sig).is_ok());
        assert!(identity.verify(b"other message", &sig).is_err());
    }

    #[test]
    fn test_agreement_symmetric() {
        let a = Identity::generate();
        let b = Identity::generate();

        let ab = a.agree(&b).unwrap();
        let ba = b.agree(&a).unwrap();
        assert_eq!(ab.packet_key(), ba.packet_key());
    }
}
