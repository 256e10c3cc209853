//! Certificates of membership
//!
//! A COM is a set of signed (id, value, maxDelta) qualifier tuples issued by
//! a network controller. Two certificates agree when every qualifier id they
//! share has values within the smaller of the two deltas; the sliding
//! timestamp window lets certificates from slightly different issue times
//! still match without ever being forgeable.

use serde::{Deserialize, Serialize};

use ethermesh_crypto::{Address, CryptoResult, Identity, Signature};

use crate::error::{CoreError, CoreResult};

/// Reserved qualifier ids
pub const COM_QUALIFIER_TIMESTAMP: u64 = 0;
pub const COM_QUALIFIER_NETWORK_ID: u64 = 1;
pub const COM_QUALIFIER_ISSUED_TO: u64 = 2;

/// One signed claim inside a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qualifier {
    pub id: u64,
    pub value: u64,
    pub max_delta: u64,
}

/// A certificate of membership on a private network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateOfMembership {
    qualifiers: Vec<Qualifier>,
    signed_by: Address,
    signature: Option<Signature>,
}

impl CertificateOfMembership {
    /// Build the standard certificate for one member: issue timestamp with a
    /// sliding window, exact network id, exact issued-to address.
    pub fn for_member(
        timestamp: u64,
        timestamp_max_delta: u64,
        network_id: u64,
        issued_to: Address,
    ) -> Self {
        Self {
            qualifiers: vec![
                Qualifier {
                    id: COM_QUALIFIER_TIMESTAMP,
                    value: timestamp,
                    max_delta: timestamp_max_delta,
                },
                Qualifier {
                    id: COM_QUALIFIER_NETWORK_ID,
                    value: network_id,
                    max_delta: 0,
                },
                Qualifier {
                    id: COM_QUALIFIER_ISSUED_TO,
                    value: issued_to.as_u64(),
                    max_delta: 0,
                },
            ],
            signed_by: Address::from_u64(network_id >> 24),
            signature: None,
        }
    }

    fn qualifier(&self, id: u64) -> Option<&Qualifier> {
        self.qualifiers.iter().find(|q| q.id == id)
    }

    /// Network this certificate applies to
    pub fn network_id(&self) -> Option<u64> {
        self.qualifier(COM_QUALIFIER_NETWORK_ID).map(|q| q.value)
    }

    /// Member this certificate was issued to
    pub fn issued_to(&self) -> Option<Address> {
        self.qualifier(COM_QUALIFIER_ISSUED_TO)
            .map(|q| Address::from_u64(q.value))
    }

    /// Issue timestamp
    pub fn timestamp(&self) -> Option<u64> {
        self.qualifier(COM_QUALIFIER_TIMESTAMP).map(|q| q.value)
    }

    /// Controller address that signed (or must sign) this certificate
    pub fn signed_by(&self) -> Address {
        self.signed_by
    }

    /// Mutual-agreement check. Symmetric: for every shared qualifier id the
    /// difference must fit the smaller window, and both sides must answer to
    /// the same issuer.
    pub fn agrees_with(&self, other: &CertificateOfMembership) -> bool {
        if self.signed_by != other.signed_by {
            return false;
        }
        for mine in &self.qualifiers {
            if let Some(theirs) = other.qualifier(mine.id) {
                let delta = mine.value.abs_diff(theirs.value);
                if delta > mine.max_delta.min(theirs.max_delta) {
                    return false;
                }
            }
        }
        true
    }

    /// Sign as the issuing controller
    pub fn sign(&mut self, issuer: &Identity) -> CoreResult<()> {
        if issuer.address() != self.signed_by {
            return Err(CoreError::BadParameter(
                "issuer does not control this network".into(),
            ));
        }
        let body = self.signable_body()?;
        self.signature = Some(issuer.sign(&body)?);
        Ok(())
    }

    /// Verify against the issuing controller's identity
    pub fn verify(&self, issuer: &Identity) -> CryptoResult<()> {
        let signature = self
            .signature
            .as_ref()
            .ok_or(ethermesh_crypto::CryptoError::InvalidSignature)?;
        let body = self
            .signable_body()
            .map_err(|_| ethermesh_crypto::CryptoError::InvalidSignature)?;
        issuer.verify(&body, signature)
    }

    /// Whether a signature is attached (not whether it verifies)
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    fn signable_body(&self) -> CoreResult<Vec<u8>> {
        #[derive(Serialize)]
        struct Body<'a> {
            qualifiers: &'a [Qualifier],
            signed_by: Address,
        }
        bincode::serialize(&Body {
            qualifiers: &self.qualifiers,
            signed_by: self.signed_by,
        })
        .map_err(|e| CoreError::Internal(format!("com encode: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn com(timestamp: u64, delta: u64, nwid: u64, member: u64) -> CertificateOfMembership {
        CertificateOfMembership::for_member(timestamp, delta, nwid, Address::from_u64(member))
    }

    #[test]
    fn test_agreement_within_window() {
        let a = com(10_000, 5_000, 0x1122334455000001, 0xaaaaaaaaaa);
        let b = com(12_000, 5_000, 0x1122334455000001, 0xbbbbbbbbbb);
        assert!(a.agrees_with(&b));
    }

    #[test]
    fn test_disagreement_outside_window() {
        let a = com(10_000, 1_000, 0x1122334455000001, 0xaaaaaaaaaa);
        let b = com(20_000, 1_000, 0x1122334455000001, 0xbbbbbbbbbb);
        assert!(!a.agrees_with(&b));
    }

    #[test]
    fn test_agreement_is_symmetric() {
        let cases = [
            (com(10, 5, 1 << 24, 2), com(14, 5, 1 << 24, 3)),
            (com(10, 2, 1 << 24, 2), com(14, 50, 1 << 24, 3)),
            (com(10, 5, 1 << 24, 2), com(14, 5, 2 << 24, 3)),
        ];
        for (a, b) in &cases {
            assert_eq!(a.agrees_with(b), b.agrees_with(a));
        }
    }

    #[test]
    fn test_different_networks_disagree() {
        let a = com(10_000, 5_000, 0x1111111100000001, 0xaaaaaaaaaa);
        let b = com(10_000, 5_000, 0x2222222200000001, 0xbbbbbbbbbb);
        assert!(!a.agrees_with(&b));
    }

    #[test]
    fn test_smaller_delta_wins() {
        let a = com(10_000, 10_000, 1 << 24, 2);
        let b = com(13_000, 1_000, 1 << 24, 3);
        // 3000 > min(10000, 1000)
        assert!(!a.agrees_with(&b));
        assert!(!b.agrees_with(&a));
    }

    #[test]
    fn test_sign_and_verify() {
        let controller = Identity::generate();
        let nwid = (controller.address().as_u64() << 24) | 1;

        let mut com = CertificateOfMembership::for_member(
            1_000,
            60_000,
            nwid,
            Address::from_u64(0xaaaaaaaaaa),
        );
        assert!(!com.is_signed());

        com.sign(&controller).unwrap();
        assert!(com.is_signed());
        assert!(com.verify(&controller).is_ok());

        let imposter = Identity::generate();
        assert!(com.verify(&imposter).is_err());
    }

    #[test]
    fn test_wrong_issuer_cannot_sign() {
        let controller = Identity::generate();
        let outsider = Identity::generate();
        let nwid = (controller.address().as_u64() << 24) | 1;

        let mut com = CertificateOfMembership::for_member(
            1_000,
            60_000,
            nwid,
            Address::from_u64(0xaaaaaaaaaa),
        );
        assert!(com.sign(&outsider).is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let com = com(10_000, 5_000, 0x1122334455000001, 0xaaaaaaaaaa);
        let bytes = bincode::serialize(&com).unwrap();
        let back: CertificateOfMembership = bincode::deserialize(&bytes).unwrap();
        assert!(com.agrees_with(&back));
        assert_eq!(com.network_id(), back.network_id());
    }
}
