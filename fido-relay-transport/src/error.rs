//! Transport error types

use thiserror::Error;

/// Errors raised while framing or exchanging CTAP messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Packet is shorter than its header or otherwise malformed
    #[error("Invalid packet: {0}")]
    InvalidPacket(&'static str),

    /// Packet belongs to another channel
    #[error("Channel mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChannelMismatch { expected: u32, actual: u32 },

    /// Continuation sequence number out of order
    #[error("Invalid sequence: expected {expected}, got {actual}")]
    InvalidSequence { expected: u8, actual: u8 },

    /// Initial packet carries a command other than the one awaited
    #[error("Unexpected command {0:#04x}")]
    UnexpectedCommand(u8),

    /// Payload does not fit the framing limits
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// Response ended before the declared length was received
    #[error("Truncated message: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// INIT response did not echo our nonce
    #[error("INIT nonce mismatch")]
    NonceMismatch,

    /// Authenticator answered with a transport-level ERROR frame
    #[error("Device returned error code {0:#04x}")]
    DeviceError(u8),

    /// Smartcard answered with a non-success status word
    #[error("APDU status {0:#06x}")]
    ApduStatus(u16),

    /// BLE control point length outside the permitted range
    #[error("Invalid packet size {0}")]
    InvalidPacketSize(usize),

    /// Underlying link failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Link closed by the peer
    #[error("Link disconnected")]
    Disconnected,

    /// No response within the allowed time
    #[error("Operation timed out")]
    Timeout,

    /// Caller passed an argument no framing can satisfy
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl Error {
    /// Whether this is a framing error (malformed data on the wire)
    ///
    /// Framing errors are always fatal to the current exchange.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Error::InvalidPacket(_)
                | Error::ChannelMismatch { .. }
                | Error::InvalidSequence { .. }
                | Error::UnexpectedCommand(_)
                | Error::MessageTooLarge(_)
                | Error::Truncated { .. }
                | Error::NonceMismatch
        )
    }
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, Error>;
