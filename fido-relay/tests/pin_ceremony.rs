//! PIN/UV auth token retrieval against a software authenticator
//!
//! The authenticator side holds a static P-256 key, derives the same shared
//! keys the platform does and only releases its token for the right PIN.

use fido_relay::cbor::{MapBuilder, MapParser};
use fido_relay::client_pin::{self, cose_key, parse_cose_key, permission, sub_command};
use fido_relay::crypto::key_agreement::{AES_KEY_INFO, HKDF_SALT, HMAC_KEY_INFO};
use fido_relay::crypto::{
    pin_uv_protocol, AuthKey, CryptoProvider, PinUvToken, PlatformKey, PublicPoint,
    RustCryptoProvider,
};
use fido_relay::{Device, Error, PinUvAuthEncapsulation, Result};

use async_trait::async_trait;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;

use std::sync::{Arc, Mutex};

const PIN: &str = "123456";
const TOKEN: [u8; 32] = [0x5C; 32];

/// CTAP2_ERR_PIN_INVALID
const PIN_INVALID: u8 = 0x31;

#[derive(Debug, Clone, PartialEq)]
struct TokenRequest {
    sub_command: i128,
    permissions: Option<i128>,
    rp_id: Option<String>,
}

struct PinAuthenticator {
    secret: p256::SecretKey,
    pin_hash: [u8; 16],
    provider: Arc<dyn CryptoProvider>,
    requests: Mutex<Vec<TokenRequest>>,
}

impl PinAuthenticator {
    fn new(pin: &str) -> Self {
        let provider: Arc<dyn CryptoProvider> = Arc::new(RustCryptoProvider::new());
        let mut pin_hash = [0u8; 16];
        pin_hash.copy_from_slice(&provider.sha256(pin.as_bytes())[..16]);
        Self {
            secret: p256::SecretKey::random(&mut OsRng),
            pin_hash,
            provider,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn public_point(&self) -> PublicPoint {
        let encoded = self.secret.public_key().to_encoded_point(false);
        PublicPoint::from_sec1(encoded.as_bytes()).unwrap()
    }

    /// Derive the keys the platform derived for `platform`
    fn shared_keys(&self, platform: &PublicPoint) -> PlatformKey {
        let peer = p256::PublicKey::from_sec1_bytes(&platform.to_sec1_uncompressed()).unwrap();
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let z = shared.raw_secret_bytes();

        let v1 = self.provider.sha256(z);
        let aes = self.provider.hkdf_sha256(&HKDF_SALT, z, AES_KEY_INFO).unwrap();
        let hmac = self.provider.hkdf_sha256(&HKDF_SALT, z, HMAC_KEY_INFO).unwrap();
        PlatformKey::new(*platform, v1, aes, hmac)
    }

    fn reply(body: MapBuilder) -> Result<Vec<u8>> {
        let mut response = vec![0x00];
        response.extend_from_slice(&body.build()?);
        Ok(response)
    }

    fn handle(&self, params: MapParser) -> Result<Vec<u8>> {
        let version = u8::try_from(params.get_int(0x01)?).unwrap();
        let sub = params.get_int(0x02)?;

        if sub == sub_command::GET_KEY_AGREEMENT as i128 {
            return Self::reply(MapBuilder::new().insert(0x01, cose_key(&self.public_point())));
        }

        let platform = parse_cose_key(&params.get_map(0x03)?)?;
        let keys = self.shared_keys(&platform);
        let protocol = pin_uv_protocol(version, Arc::clone(&self.provider))?;

        self.requests.lock().unwrap().push(TokenRequest {
            sub_command: sub,
            permissions: params.get_int(0x09).ok(),
            rp_id: params
                .get_raw(0x0A)
                .and_then(|value| value.as_text())
                .map(str::to_owned),
        });

        let pin_hash = protocol.decrypt(&keys, params.get_bytes(0x06)?)?;
        if pin_hash != self.pin_hash {
            return Ok(vec![PIN_INVALID]);
        }
        let encrypted = protocol.encrypt(&keys, &TOKEN)?;
        Self::reply(MapBuilder::new().insert_bytes(0x02, &encrypted))
    }
}

#[async_trait]
impl Device for PinAuthenticator {
    fn description(&self) -> String {
        "software authenticator".into()
    }

    async fn send_cbor(&self, request: &[u8]) -> Result<Vec<u8>> {
        assert_eq!(request[0], client_pin::CLIENT_PIN);
        self.handle(MapParser::from_bytes(&request[1..])?)
    }
}

fn provider() -> Arc<dyn CryptoProvider> {
    Arc::new(RustCryptoProvider::new())
}

#[tokio::test]
async fn test_token_with_permissions_both_protocols() {
    for version in [1u8, 2] {
        let authenticator = PinAuthenticator::new(PIN);
        let encapsulation = PinUvAuthEncapsulation::new(&authenticator, version, provider())
            .await
            .unwrap();
        assert_eq!(encapsulation.version(), version);

        let token = encapsulation
            .get_pin_uv_auth_token_using_pin_with_permissions(
                &authenticator,
                PIN,
                permission::MAKE_CREDENTIAL | permission::GET_ASSERTION,
                Some("example.com"),
            )
            .await
            .unwrap();
        assert_eq!(token.as_bytes(), &TOKEN);

        let requests = authenticator.requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            vec![TokenRequest {
                sub_command: 0x09,
                permissions: Some(0x03),
                rp_id: Some("example.com".into()),
            }]
        );
    }
}

#[tokio::test]
async fn test_legacy_pin_token() {
    let authenticator = PinAuthenticator::new(PIN);
    let encapsulation = PinUvAuthEncapsulation::new(&authenticator, 1, provider())
        .await
        .unwrap();

    let token = encapsulation
        .get_pin_token(&authenticator, PIN)
        .await
        .unwrap();
    assert_eq!(token.as_bytes(), &TOKEN);

    let requests = authenticator.requests.lock().unwrap();
    assert_eq!(requests[0].sub_command, 0x05);
    assert_eq!(requests[0].permissions, None);
    assert_eq!(requests[0].rp_id, None);
}

#[tokio::test]
async fn test_wrong_pin_surfaces_status() {
    let authenticator = PinAuthenticator::new(PIN);
    let encapsulation = PinUvAuthEncapsulation::new(&authenticator, 2, provider())
        .await
        .unwrap();

    let err = encapsulation
        .get_pin_uv_auth_token_using_pin_with_permissions(
            &authenticator,
            "654321",
            permission::GET_ASSERTION,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err, Error::CtapStatus(PIN_INVALID));
}

#[tokio::test]
async fn test_auth_param_verifies_on_authenticator() {
    let client_data_hash = [0x3D; 32];

    for (version, mac_len) in [(1u8, 16), (2, 32)] {
        let authenticator = PinAuthenticator::new(PIN);
        let encapsulation = PinUvAuthEncapsulation::new(&authenticator, version, provider())
            .await
            .unwrap();
        let token = encapsulation
            .get_pin_uv_auth_token_using_pin_with_permissions(
                &authenticator,
                PIN,
                permission::GET_ASSERTION,
                Some("example.com"),
            )
            .await
            .unwrap();

        let param = encapsulation
            .authenticate(&token, &client_data_hash)
            .unwrap();
        assert_eq!(param.len(), mac_len);

        let protocol = pin_uv_protocol(version, provider()).unwrap();
        let issued = PinUvToken::new(TOKEN);
        assert!(protocol.verify(AuthKey::Token(&issued), &client_data_hash, &param));
        assert!(!protocol.verify(AuthKey::Token(&issued), &[0u8; 32], &param));
    }
}

#[tokio::test]
async fn test_each_encapsulation_uses_fresh_key() {
    let authenticator = PinAuthenticator::new(PIN);
    let first = PinUvAuthEncapsulation::new(&authenticator, 2, provider())
        .await
        .unwrap();
    let second = PinUvAuthEncapsulation::new(&authenticator, 2, provider())
        .await
        .unwrap();

    assert_ne!(
        first.platform_key().public_point(),
        second.platform_key().public_point()
    );
}
