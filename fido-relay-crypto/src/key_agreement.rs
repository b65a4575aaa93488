//! ECDH key agreement for the PIN/UV auth protocols
//!
//! A key agreement runs once per PIN/UV ceremony: the authenticator's public
//! point comes from `authenticatorClientPIN(getKeyAgreement)`, the platform
//! generates an ephemeral P-256 pair, and every key either protocol needs is
//! derived from the one shared secret before the ephemeral state is dropped.

use crate::error::{CryptoError, Result};
use crate::provider::CryptoProvider;

use std::fmt;
use std::sync::Arc;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// HKDF info for the protocol two AES key
pub const AES_KEY_INFO: &[u8] = b"CTAP2 AES key";

/// HKDF info for the protocol two HMAC key
pub const HMAC_KEY_INFO: &[u8] = b"CTAP2 HMAC key";

/// HKDF salt used by protocol two
pub const HKDF_SALT: [u8; 32] = [0u8; 32];

/// Affine coordinates of a P-256 public point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicPoint {
    x: [u8; 32],
    y: [u8; 32],
}

impl PublicPoint {
    /// Build a point from raw coordinates
    ///
    /// Curve membership is checked when the point is used for ECDH.
    pub fn new(x: [u8; 32], y: [u8; 32]) -> Self {
        Self { x, y }
    }

    /// Build a point from coordinate slices, as found in a COSE key
    pub fn from_coordinates(x: &[u8], y: &[u8]) -> Result<Self> {
        let x: [u8; 32] = x.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: x.len(),
        })?;
        let y: [u8; 32] = y.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: y.len(),
        })?;
        Ok(Self { x, y })
    }

    /// Parse an uncompressed SEC1 encoding (`0x04 || x || y`)
    pub fn from_sec1(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 65 || bytes[0] != 0x04 {
            return Err(CryptoError::InvalidPublicKey);
        }
        Self::from_coordinates(&bytes[1..33], &bytes[33..65])
    }

    /// Uncompressed SEC1 encoding (`0x04 || x || y`)
    pub fn to_sec1_uncompressed(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[0] = 0x04;
        out[1..33].copy_from_slice(&self.x);
        out[33..].copy_from_slice(&self.y);
        out
    }

    /// X coordinate
    pub fn x(&self) -> &[u8; 32] {
        &self.x
    }

    /// Y coordinate
    pub fn y(&self) -> &[u8; 32] {
        &self.y
    }
}

/// Ephemeral ECDH state for a single key agreement
///
/// Holds the platform's public point and the raw shared secret `Z`. The value
/// cannot be cloned; it is consumed by [`KeyAgreement::destroy`] (or dropped),
/// at which point the secret is zeroized. The secret is only readable inside
/// this crate, by the provider's KDF step.
pub struct KeyAgreementState {
    platform_public: PublicPoint,
    shared_secret: Zeroizing<[u8; 32]>,
}

impl KeyAgreementState {
    /// Wrap the result of an ECDH computation
    ///
    /// Intended for [`CryptoProvider::ecdh_init`] implementations.
    pub fn new(platform_public: PublicPoint, shared_secret: [u8; 32]) -> Self {
        Self {
            platform_public,
            shared_secret: Zeroizing::new(shared_secret),
        }
    }

    /// Platform public point to send to the authenticator
    pub fn platform_public(&self) -> &PublicPoint {
        &self.platform_public
    }

    pub(crate) fn shared_secret(&self) -> &[u8] {
        self.shared_secret.as_slice()
    }
}

impl fmt::Debug for KeyAgreementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyAgreementState")
            .field("platform_public", &self.platform_public)
            .finish_non_exhaustive()
    }
}

/// Keys derived from one key agreement
///
/// Protocol one uses `pin_v1_key` for both encryption and authentication;
/// protocol two uses the separate AES and HMAC keys. Secret fields are wiped
/// on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PlatformKey {
    #[zeroize(skip)]
    public: PublicPoint,
    pin_v1_key: [u8; 32],
    pin_v2_aes_key: [u8; 32],
    pin_v2_hmac_key: [u8; 32],
}

impl PlatformKey {
    /// Assemble a platform key from already derived material
    pub fn new(
        public: PublicPoint,
        pin_v1_key: [u8; 32],
        pin_v2_aes_key: [u8; 32],
        pin_v2_hmac_key: [u8; 32],
    ) -> Self {
        Self {
            public,
            pin_v1_key,
            pin_v2_aes_key,
            pin_v2_hmac_key,
        }
    }

    /// Platform public point (the `keyAgreement` parameter sent to the authenticator)
    pub fn public_point(&self) -> &PublicPoint {
        &self.public
    }

    /// Platform public X coordinate
    pub fn platform_x(&self) -> &[u8; 32] {
        self.public.x()
    }

    /// Platform public Y coordinate
    pub fn platform_y(&self) -> &[u8; 32] {
        self.public.y()
    }

    /// `SHA-256(Z)`, the protocol one shared secret
    pub fn pin_v1_key(&self) -> &[u8; 32] {
        &self.pin_v1_key
    }

    /// Protocol two AES-256 key
    pub fn pin_v2_aes_key(&self) -> &[u8; 32] {
        &self.pin_v2_aes_key
    }

    /// Protocol two HMAC key
    pub fn pin_v2_hmac_key(&self) -> &[u8; 32] {
        &self.pin_v2_hmac_key
    }
}

impl fmt::Debug for PlatformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformKey")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Key agreement driver bound to a crypto provider
#[derive(Clone)]
pub struct KeyAgreement {
    provider: Arc<dyn CryptoProvider>,
}

impl KeyAgreement {
    /// Create a key agreement driver using `provider`
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self { provider }
    }

    /// Generate an ephemeral key pair and compute the shared secret with `peer`
    pub fn init(&self, peer: &PublicPoint) -> Result<KeyAgreementState> {
        self.provider.ecdh_init(peer)
    }

    /// Derive a 32-byte key from `state`
    ///
    /// `use_hkdf == false` yields `SHA-256(Z)`; `true` yields
    /// `HKDF-SHA-256(salt, Z, info)`.
    pub fn derive_key(
        &self,
        state: &KeyAgreementState,
        use_hkdf: bool,
        salt: &[u8; 32],
        info: &[u8],
    ) -> Result<[u8; 32]> {
        self.provider.ecdh_kdf(state, use_hkdf, salt, info)
    }

    /// Release the ephemeral state
    pub fn destroy(&self, state: KeyAgreementState) {
        drop(state);
    }

    /// Run a full agreement against `peer` and derive every protocol key
    ///
    /// The ephemeral state never outlives this call.
    pub fn platform_key(&self, peer: &PublicPoint) -> Result<PlatformKey> {
        let state = self.init(peer)?;
        let derived = (|| {
            let v1 = self.derive_key(&state, false, &HKDF_SALT, &[])?;
            let aes = self.derive_key(&state, true, &HKDF_SALT, AES_KEY_INFO)?;
            let hmac = self.derive_key(&state, true, &HKDF_SALT, HMAC_KEY_INFO)?;
            Ok::<_, CryptoError>((v1, aes, hmac))
        })();
        let public = *state.platform_public();
        self.destroy(state);

        let (mut v1, mut aes, mut hmac) = derived?;
        let key = PlatformKey::new(public, v1, aes, hmac);
        v1.zeroize();
        aes.zeroize();
        hmac.zeroize();
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::RustCryptoProvider;

    use p256::elliptic_curve::sec1::ToEncodedPoint;
    use p256::SecretKey;
    use rand::rngs::OsRng;

    fn authenticator_point() -> (SecretKey, PublicPoint) {
        let secret = SecretKey::random(&mut OsRng);
        let encoded = secret.public_key().to_encoded_point(false);
        let point = PublicPoint::from_sec1(encoded.as_bytes()).unwrap();
        (secret, point)
    }

    fn agreement() -> KeyAgreement {
        KeyAgreement::new(Arc::new(RustCryptoProvider::new()))
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let ka = agreement();
        let (_, peer) = authenticator_point();
        let state = ka.init(&peer).unwrap();

        let first = ka.derive_key(&state, true, &HKDF_SALT, AES_KEY_INFO).unwrap();
        let second = ka.derive_key(&state, true, &HKDF_SALT, AES_KEY_INFO).unwrap();
        assert_eq!(first, second);

        let plain = ka.derive_key(&state, false, &HKDF_SALT, AES_KEY_INFO).unwrap();
        assert_ne!(first, plain);

        let other_info = ka.derive_key(&state, true, &HKDF_SALT, HMAC_KEY_INFO).unwrap();
        assert_ne!(first, other_info);

        ka.destroy(state);
    }

    #[test]
    fn test_both_sides_agree() {
        let ka = agreement();
        let (authenticator_secret, peer) = authenticator_point();
        let key = ka.platform_key(&peer).unwrap();

        // Recompute from the authenticator's side
        let platform_public =
            p256::PublicKey::from_sec1_bytes(&key.public_point().to_sec1_uncompressed()).unwrap();
        let z = p256::ecdh::diffie_hellman(
            authenticator_secret.to_nonzero_scalar(),
            platform_public.as_affine(),
        );
        let provider = RustCryptoProvider::new();
        let z = z.raw_secret_bytes();

        assert_eq!(key.pin_v1_key(), &provider.sha256(z));
        assert_eq!(
            key.pin_v2_aes_key(),
            &provider.hkdf_sha256(&HKDF_SALT, z, AES_KEY_INFO).unwrap()
        );
        assert_eq!(
            key.pin_v2_hmac_key(),
            &provider.hkdf_sha256(&HKDF_SALT, z, HMAC_KEY_INFO).unwrap()
        );
    }

    #[test]
    fn test_fresh_ephemeral_key_per_agreement() {
        let ka = agreement();
        let (_, peer) = authenticator_point();
        let a = ka.platform_key(&peer).unwrap();
        let b = ka.platform_key(&peer).unwrap();
        assert_ne!(a.public_point(), b.public_point());
        assert_ne!(a.pin_v1_key(), b.pin_v1_key());
    }

    #[test]
    fn test_invalid_peer_point_rejected() {
        let ka = agreement();
        let bogus = PublicPoint::new([0x01; 32], [0x02; 32]);
        assert_eq!(ka.init(&bogus).unwrap_err(), CryptoError::InvalidPublicKey);
    }

    #[test]
    fn test_sec1_parsing() {
        assert!(PublicPoint::from_sec1(&[0x04; 64]).is_err());
        let mut compressed = [0u8; 65];
        compressed[0] = 0x02;
        assert!(PublicPoint::from_sec1(&compressed).is_err());

        let (_, point) = authenticator_point();
        let round = PublicPoint::from_sec1(&point.to_sec1_uncompressed()).unwrap();
        assert_eq!(round, point);
    }

    #[test]
    fn test_coordinate_length_checked() {
        let err = PublicPoint::from_coordinates(&[0u8; 31], &[0u8; 32]).unwrap_err();
        assert_eq!(
            err,
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 31
            }
        );
    }
}
