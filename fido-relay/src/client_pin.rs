//! PIN/UV auth token ceremonies
//!
//! Drives `authenticatorClientPIN` against any [`Device`]: key agreement with
//! the authenticator, then token retrieval with a PIN. The negotiated
//! [`PinUvProtocol`] and the resulting [`PlatformKey`] are kept for the
//! lifetime of one [`PinUvAuthEncapsulation`]; each encapsulation runs its own
//! ephemeral key agreement.
//!
//! Spec: <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#authenticatorClientPIN>

use crate::cbor::{MapBuilder, MapParser};
use crate::device::Device;
use crate::error::{Error, Result};

use fido_relay_crypto::{
    pin_uv_protocol, CryptoError, CryptoProvider, KeyAgreement, PinUvProtocol, PinUvToken,
    PlatformKey, PublicPoint,
};

use ciborium::Value;
use tracing::debug;
use zeroize::Zeroizing;

use std::sync::Arc;

/// authenticatorClientPIN command byte
pub const CLIENT_PIN: u8 = 0x06;

/// CTAP2_OK
const STATUS_OK: u8 = 0x00;

/// clientPIN subcommands
pub mod sub_command {
    pub const GET_KEY_AGREEMENT: i64 = 0x02;
    pub const GET_PIN_TOKEN: i64 = 0x05;
    pub const GET_PIN_UV_AUTH_TOKEN_USING_PIN_WITH_PERMISSIONS: i64 = 0x09;
}

/// pinUvAuthToken permission flags
pub mod permission {
    pub const MAKE_CREDENTIAL: u8 = 0x01;
    pub const GET_ASSERTION: u8 = 0x02;
    pub const CREDENTIAL_MANAGEMENT: u8 = 0x04;
    pub const BIO_ENROLLMENT: u8 = 0x08;
    pub const LARGE_BLOB_WRITE: u8 = 0x10;
    pub const AUTHENTICATOR_CONFIG: u8 = 0x20;
}

/// clientPIN request parameter keys
mod request_key {
    pub const PIN_UV_AUTH_PROTOCOL: i64 = 0x01;
    pub const SUB_COMMAND: i64 = 0x02;
    pub const KEY_AGREEMENT: i64 = 0x03;
    pub const PIN_HASH_ENC: i64 = 0x06;
    pub const PERMISSIONS: i64 = 0x09;
    pub const RP_ID: i64 = 0x0A;
}

/// clientPIN response keys
mod response_key {
    pub const KEY_AGREEMENT: i64 = 0x01;
    pub const PIN_UV_AUTH_TOKEN: i64 = 0x02;
}

/// COSE_Key labels and values for an ECDH-ES+HKDF-256 P-256 key
pub mod cose {
    pub const KTY: i64 = 1;
    pub const ALG: i64 = 3;
    pub const CRV: i64 = -1;
    pub const X: i64 = -2;
    pub const Y: i64 = -3;

    pub const KTY_EC2: i64 = 2;
    pub const ALG_ECDH_ES_HKDF_256: i64 = -25;
    pub const CRV_P256: i64 = 1;
}

/// Encode a public point as the `keyAgreement` COSE_Key
pub fn cose_key(point: &PublicPoint) -> Value {
    MapBuilder::new()
        .insert_int(cose::KTY, cose::KTY_EC2)
        .insert_int(cose::ALG, cose::ALG_ECDH_ES_HKDF_256)
        .insert_int(cose::CRV, cose::CRV_P256)
        .insert_bytes(cose::X, point.x())
        .insert_bytes(cose::Y, point.y())
        .build_value()
}

/// Extract a P-256 public point from a COSE_Key
pub fn parse_cose_key(key: &MapParser) -> Result<PublicPoint> {
    let kty = key.get_int(cose::KTY)?;
    let crv = key.get_int(cose::CRV)?;
    if kty != cose::KTY_EC2 as i128 || crv != cose::CRV_P256 as i128 {
        return Err(CryptoError::InvalidCoseKey.into());
    }
    Ok(PublicPoint::from_coordinates(
        key.get_bytes(cose::X)?,
        key.get_bytes(cose::Y)?,
    )?)
}

/// Send a clientPIN request and return the parsed response map
async fn client_pin(device: &dyn Device, request: MapBuilder) -> Result<MapParser> {
    let mut payload = vec![CLIENT_PIN];
    payload.extend_from_slice(&request.build()?);

    let response = device.send_cbor(&payload).await?;
    let Some((&status, body)) = response.split_first() else {
        return Err(Error::InvalidCbor("empty response"));
    };
    if status != STATUS_OK {
        return Err(Error::CtapStatus(status));
    }
    MapParser::from_bytes(body)
}

/// PIN/UV authentication encapsulation
///
/// Created by running `getKeyAgreement` against an authenticator. The shared
/// keys live in the encapsulation and are wiped when it is dropped.
pub struct PinUvAuthEncapsulation {
    protocol: Box<dyn PinUvProtocol>,
    provider: Arc<dyn CryptoProvider>,
    platform_key: PlatformKey,
}

impl PinUvAuthEncapsulation {
    /// Run key agreement with `device` for PIN/UV auth protocol `version`
    pub async fn new(
        device: &dyn Device,
        version: u8,
        provider: Arc<dyn CryptoProvider>,
    ) -> Result<Self> {
        let protocol = pin_uv_protocol(version, Arc::clone(&provider))?;

        let response = client_pin(
            device,
            MapBuilder::new()
                .insert_int(request_key::PIN_UV_AUTH_PROTOCOL, version as i64)
                .insert_int(request_key::SUB_COMMAND, sub_command::GET_KEY_AGREEMENT),
        )
        .await?;
        let peer = parse_cose_key(&response.get_map(response_key::KEY_AGREEMENT)?)?;

        let platform_key = KeyAgreement::new(Arc::clone(&provider)).platform_key(&peer)?;
        debug!(
            device = %device.description(),
            protocol = version,
            "PIN/UV key agreement complete"
        );

        Ok(Self {
            protocol,
            provider,
            platform_key,
        })
    }

    /// Negotiated protocol version
    pub fn version(&self) -> u8 {
        self.protocol.version()
    }

    /// Keys derived during key agreement
    pub fn platform_key(&self) -> &PlatformKey {
        &self.platform_key
    }

    /// `pinHashEnc`: the first 16 bytes of SHA-256(pin), encrypted
    fn pin_hash_enc(&self, pin: &str) -> Result<Vec<u8>> {
        let digest = Zeroizing::new(self.provider.sha256(pin.as_bytes()));
        Ok(self.protocol.encrypt(&self.platform_key, &digest[..16])?)
    }

    async fn request_token(&self, device: &dyn Device, request: MapBuilder) -> Result<PinUvToken> {
        let response = client_pin(device, request).await?;
        let encrypted = response.get_bytes(response_key::PIN_UV_AUTH_TOKEN)?;
        let token = Zeroizing::new(self.protocol.decrypt(&self.platform_key, encrypted)?);
        Ok(PinUvToken::from_slice(&token)?)
    }

    fn token_request(&self, pin: &str, sub_command: i64) -> Result<MapBuilder> {
        Ok(MapBuilder::new()
            .insert_int(request_key::PIN_UV_AUTH_PROTOCOL, self.version() as i64)
            .insert_int(request_key::SUB_COMMAND, sub_command)
            .insert(
                request_key::KEY_AGREEMENT,
                cose_key(self.platform_key.public_point()),
            )
            .insert_bytes(request_key::PIN_HASH_ENC, &self.pin_hash_enc(pin)?))
    }

    /// Get a PIN/UV auth token using PIN with permissions (CTAP 2.1)
    ///
    /// # Arguments
    ///
    /// * `pin` - The user's PIN
    /// * `permissions` - Bitwise OR of [`permission`] flags
    /// * `rp_id` - Optional RP ID to scope the permission
    pub async fn get_pin_uv_auth_token_using_pin_with_permissions(
        &self,
        device: &dyn Device,
        pin: &str,
        permissions: u8,
        rp_id: Option<&str>,
    ) -> Result<PinUvToken> {
        let request = self
            .token_request(pin, sub_command::GET_PIN_UV_AUTH_TOKEN_USING_PIN_WITH_PERMISSIONS)?
            .insert_int(request_key::PERMISSIONS, permissions as i64)
            .insert_text_opt(request_key::RP_ID, rp_id);
        self.request_token(device, request).await
    }

    /// Get a PIN token without permissions (CTAP 2.0 `getPinToken`)
    pub async fn get_pin_token(&self, device: &dyn Device, pin: &str) -> Result<PinUvToken> {
        let request = self.token_request(pin, sub_command::GET_PIN_TOKEN)?;
        self.request_token(device, request).await
    }

    /// Calculate `pinUvAuthParam` over `data`
    ///
    /// `data` is e.g. the clientDataHash for makeCredential and getAssertion.
    pub fn authenticate(&self, token: &PinUvToken, data: &[u8]) -> Result<Vec<u8>> {
        Ok(self.protocol.authenticate(token.into(), data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use fido_relay_crypto::RustCryptoProvider;

    use async_trait::async_trait;

    /// Replies to every request with a fixed response
    struct Canned(Vec<u8>);

    #[async_trait]
    impl Device for Canned {
        fn description(&self) -> String {
            "canned".into()
        }

        async fn send_cbor(&self, _request: &[u8]) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    fn provider() -> Arc<dyn CryptoProvider> {
        Arc::new(RustCryptoProvider::new())
    }

    #[test]
    fn test_cose_key_round_trip() {
        let point = PublicPoint::new([0x11; 32], [0x22; 32]);
        let parser = MapParser::from_value(cose_key(&point)).unwrap();
        assert_eq!(parser.get_int(cose::ALG).unwrap(), -25);
        assert_eq!(parse_cose_key(&parser).unwrap(), point);
    }

    #[test]
    fn test_cose_key_wrong_curve() {
        let value = MapBuilder::new()
            .insert_int(cose::KTY, cose::KTY_EC2)
            .insert_int(cose::CRV, 2)
            .insert_bytes(cose::X, &[0; 32])
            .insert_bytes(cose::Y, &[0; 32])
            .build_value();
        let err = parse_cose_key(&MapParser::from_value(value).unwrap()).unwrap_err();
        assert_eq!(err, Error::Crypto(CryptoError::InvalidCoseKey));
    }

    #[tokio::test]
    async fn test_status_byte_surfaced() {
        // CTAP2_ERR_PIN_AUTH_BLOCKED
        let device = Canned(vec![0x34]);
        let err = PinUvAuthEncapsulation::new(&device, 2, provider())
            .await
            .err()
            .unwrap();
        assert_eq!(err, Error::CtapStatus(0x34));
    }

    #[tokio::test]
    async fn test_empty_response() {
        let device = Canned(Vec::new());
        let err = PinUvAuthEncapsulation::new(&device, 1, provider())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidCbor(_)));
    }

    #[tokio::test]
    async fn test_unsupported_protocol_sends_nothing() {
        let device = Canned(vec![0x00]);
        let err = PinUvAuthEncapsulation::new(&device, 3, provider())
            .await
            .err()
            .unwrap();
        assert_eq!(err, Error::Crypto(CryptoError::UnsupportedPinProtocol(3)));
    }
}
