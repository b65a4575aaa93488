use thiserror::Error;

/// Errors that can occur when relaying CTAP traffic
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Key agreement or PIN/UV protocol failure
    #[error(transparent)]
    Crypto(#[from] fido_relay_crypto::CryptoError),

    /// Framing or link failure
    #[error(transparent)]
    Transport(#[from] fido_relay_transport::Error),

    /// The operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// No authenticator is reachable
    #[error("No authenticator available")]
    NoDevice,

    /// Authenticator answered with a non-zero CTAP status byte
    #[error("CTAP command failed with status {0:#04x}")]
    CtapStatus(u8),

    /// Response body is not the CBOR structure the command defines
    #[error("Invalid CBOR: {0}")]
    InvalidCbor(&'static str),

    /// The request was cancelled by the caller
    #[error("Request cancelled")]
    Cancelled,

    /// Unspecified error
    #[error("{0}")]
    Other(String),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;
