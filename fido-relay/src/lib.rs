//! CTAP2 relay: authenticator transports, PIN/UV ceremonies and a virtual CTAPHID gateway
//!
//! - [`device`]: USB HID, BLE and PC/SC authenticators behind one async [`Device`] trait
//! - [`client_pin`]: key agreement and PIN/UV auth token retrieval
//! - [`gateway`]: a CTAPHID authenticator facade that relays CBOR to real devices
//!
//! Framing lives in `fido-relay-transport`; cryptography in `fido-relay-crypto`.

#![warn(unused_extern_crates)]

pub mod cbor;
pub mod client_pin;
pub mod config;
pub mod device;
pub mod error;
pub mod gateway;

// Re-export main types at root level for convenience
pub use client_pin::PinUvAuthEncapsulation;
pub use config::{GatewayConfig, GatewayConfigBuilder};
pub use device::{
    BleAuthenticator, Device, DeviceList, HidAuthenticator, PcscAuthenticator, StaticDeviceList,
};
pub use error::{Error, Result};
pub use gateway::{hid_pipe, HidGateway, HidIo, PipeEnd};

pub use fido_relay_crypto as crypto;
pub use fido_relay_transport as transport;
