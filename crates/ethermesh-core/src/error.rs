//! Engine errors
//!
//! Two tiers: fatal errors mean the node must be torn down; non-fatal errors
//! are returned to the caller and disturb no global state. Protocol-level
//! garbage (bad MACs, malformed packets, out-of-policy frames) is never an
//! error at all: it is silently dropped inside the switch.

use thiserror::Error;

/// Engine errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Host data store reported a hard failure
    #[error("Data store failure")]
    DataStoreFailed,

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),

    /// Network ID is not joined or does not exist
    #[error("Network not found: {0:016x}")]
    NetworkNotFound(u64),

    /// Operation is not supported in this configuration
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Caller passed an invalid argument
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] ethermesh_crypto::CryptoError),
}

impl CoreError {
    /// Fatal errors require discarding the node
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::DataStoreFailed | CoreError::Internal(_))
    }

    /// Numeric result code for hosts that want C-style codes
    pub fn result_code(&self) -> ResultCode {
        match self {
            CoreError::DataStoreFailed => ResultCode::FatalDataStoreFailed,
            CoreError::Internal(_) => ResultCode::FatalInternal,
            CoreError::NetworkNotFound(_) => ResultCode::NetworkNotFound,
            CoreError::UnsupportedOperation(_) => ResultCode::UnsupportedOperation,
            CoreError::BadParameter(_) | CoreError::Crypto(_) => ResultCode::BadParameter,
        }
    }
}

/// Result type for engine operations
pub type CoreResult<T> = Result<T, CoreError>;

/// C-style result codes: 0 OK, 1-999 fatal, 1000+ non-fatal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    Ok = 0,
    FatalOutOfMemory = 1,
    FatalDataStoreFailed = 2,
    FatalInternal = 3,
    NetworkNotFound = 1000,
    UnsupportedOperation = 1001,
    BadParameter = 1002,
}

impl ResultCode {
    /// Whether this code requires tearing the node down
    pub fn is_fatal(self) -> bool {
        let code = self as u32;
        code > 0 && code < 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_partition() {
        assert!(CoreError::DataStoreFailed.is_fatal());
        assert!(CoreError::Internal("x".into()).is_fatal());
        assert!(!CoreError::NetworkNotFound(1).is_fatal());
        assert!(!CoreError::BadParameter("x".into()).is_fatal());
    }

    #[test]
    fn test_result_codes_match_fatality() {
        let errors = [
            CoreError::DataStoreFailed,
            CoreError::Internal("x".into()),
            CoreError::NetworkNotFound(1),
            CoreError::UnsupportedOperation("x".into()),
            CoreError::BadParameter("x".into()),
        ];
        for e in &errors {
            assert_eq!(e.is_fatal(), e.result_code().is_fatal());
        }
    }
}
