//! Error types for cryptographic operations

use thiserror::Error;

/// Cryptographic operation errors
///
/// Every variant here is an invalid-argument or integrity failure. None of
/// them is recoverable by retrying the same call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Public point is malformed or not on the P-256 curve
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Invalid key length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Input length violates the cipher or protocol framing
    #[error("Invalid input length {actual}: {reason}")]
    InvalidLength { actual: usize, reason: &'static str },

    /// Decryption failed
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Encryption failed
    #[error("Encryption failed")]
    EncryptionFailed,

    /// ECDH key agreement failed
    #[error("ECDH key agreement failed")]
    KeyAgreementFailed,

    /// The negotiated PIN/UV auth protocol version is not implemented
    #[error("Unsupported PIN/UV auth protocol version {0}")]
    UnsupportedPinProtocol(u8),

    /// Invalid COSE key format
    #[error("Invalid COSE key format")]
    InvalidCoseKey,
}

/// Result type alias for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;
