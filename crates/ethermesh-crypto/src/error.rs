//! Crypto errors

use thiserror::Error;

/// Cryptographic operation errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material had the wrong length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Signature bytes were malformed
    #[error("Invalid signature")]
    InvalidSignature,

    /// Public key bytes did not decode to a valid curve point
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Signature did not verify against the message
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Key agreement collapsed to an all-zero secret (low-order peer point)
    #[error("Degenerate key agreement")]
    DegenerateAgreement,

    /// Packet MAC did not match
    #[error("MAC mismatch")]
    MacMismatch,

    /// Identity failed structural or proof-of-work validation
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Address is one of the reserved values
    #[error("Reserved address")]
    ReservedAddress,

    /// Text or wire serialization failure
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
