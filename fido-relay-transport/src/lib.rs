//! Pure Rust CTAP Transport Layer
//!
//! This crate provides message framing for CTAP (Client to Authenticator Protocol):
//! - CTAP HID protocol (fragmentation, reassembly, channel INIT)
//! - CTAP over Bluetooth Low Energy (control point frames, notification reads)
//! - CTAP over ISO 7816 APDUs for NFC and PC/SC readers
//!
//! Packetizers are pure functions. The exchange helpers run over small async
//! link traits ([`HidLink`], [`BleLink`], [`ApduTransmitter`]) so any OS
//! binding can sit underneath.
//!
//! Spec: <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#transport-specific-bindings>

pub mod ble;
pub mod ctaphid;
pub mod error;
pub mod pcsc;

// Re-export commonly used types
pub use ble::{BleCommand, BleLink};
pub use ctaphid::{Cmd, ErrorCode, HidLink, InitResponse, Reassembler};
pub use error::{Error, Result};
pub use pcsc::{ApduTransmitter, StatusWord};
