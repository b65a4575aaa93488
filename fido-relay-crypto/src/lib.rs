//! Cryptography for the CTAP2 PIN/UV auth protocols
//!
//! This crate provides:
//!
//! - **Crypto provider**: an object-safe [`CryptoProvider`] trait with a
//!   RustCrypto backed implementation ([`RustCryptoProvider`])
//! - **Key agreement**: ephemeral P-256 ECDH producing a [`PlatformKey`]
//! - **PIN/UV auth protocols**: versions 1 and 2, selected by
//!   [`pin_uv_protocol`]
//!
//! Spec: <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#pinProto1>

pub mod error;
pub mod key_agreement;
pub mod pin_protocol;
pub mod provider;

// Re-export commonly used types
pub use error::{CryptoError, Result};
pub use key_agreement::{KeyAgreement, KeyAgreementState, PlatformKey, PublicPoint};
pub use pin_protocol::{pin_uv_protocol, AuthKey, PinProtocolV1, PinProtocolV2, PinUvProtocol, PinUvToken};
pub use provider::{CryptoProvider, RustCryptoProvider};
