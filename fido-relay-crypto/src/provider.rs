//! Crypto provider abstraction
//!
//! Everything in this workspace that needs a digest, a MAC, randomness, AES or
//! ECDH goes through a [`CryptoProvider`] handed to it at construction time.
//! There is no process-wide provider.

use crate::error::{CryptoError, Result};
use crate::key_agreement::{KeyAgreementState, PublicPoint};

use aes::{Aes128, Aes256};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// AES block size in bytes
pub const AES_BLOCK_SIZE: usize = 16;

/// Primitive operations required by key agreement and the PIN/UV protocols
///
/// All AES calls take an explicit IV and never pad; callers are responsible
/// for block alignment. The AES variant is selected by key length (16 bytes
/// for AES-128, 32 bytes for AES-256).
pub trait CryptoProvider: Send + Sync {
    /// SHA-256 digest
    fn sha256(&self, data: &[u8]) -> [u8; 32];

    /// HMAC-SHA-256 over `data` keyed with `key`
    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<[u8; 32]>;

    /// HKDF-SHA-256 (extract + expand) producing 32 bytes
    fn hkdf_sha256(&self, salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; 32]>;

    /// Fill `out` from a cryptographically secure generator
    fn random_bytes(&self, out: &mut [u8]);

    /// AES-CBC encryption without padding
    fn aes_cbc_encrypt(&self, key: &[u8], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>>;

    /// AES-CBC decryption without padding
    fn aes_cbc_decrypt(&self, key: &[u8], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>>;

    /// Generate an ephemeral P-256 key pair and run ECDH against `peer`
    fn ecdh_init(&self, peer: &PublicPoint) -> Result<KeyAgreementState>;

    /// Derive a 32-byte key from the shared secret held by `state`
    ///
    /// Without HKDF this is `SHA-256(Z)` (PIN/UV protocol one). With HKDF it
    /// is `HKDF-SHA-256(salt, Z, info)` (PIN/UV protocol two).
    fn ecdh_kdf(
        &self,
        state: &KeyAgreementState,
        use_hkdf: bool,
        salt: &[u8; 32],
        info: &[u8],
    ) -> Result<[u8; 32]> {
        if use_hkdf {
            self.hkdf_sha256(salt, state.shared_secret(), info)
        } else {
            Ok(self.sha256(state.shared_secret()))
        }
    }
}

/// [`CryptoProvider`] backed by the RustCrypto crates and the OS RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct RustCryptoProvider;

impl RustCryptoProvider {
    /// Create a new provider
    pub fn new() -> Self {
        Self
    }
}

fn check_block_aligned(data: &[u8]) -> Result<()> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidLength {
            actual: data.len(),
            reason: "AES-CBC input must be a multiple of 16 bytes",
        });
    }
    Ok(())
}

fn cbc_encrypt<C>(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>>
where
    C: BlockEncryptMut + KeyIvInit,
{
    let cipher = C::new_from_slices(key, iv).map_err(|_| CryptoError::EncryptionFailed)?;
    let mut buffer = data.to_vec();
    let len = cipher
        .encrypt_padded_mut::<NoPadding>(&mut buffer, data.len())
        .map_err(|_| CryptoError::EncryptionFailed)?
        .len();
    buffer.truncate(len);
    Ok(buffer)
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>>
where
    C: BlockDecryptMut + KeyIvInit,
{
    let cipher = C::new_from_slices(key, iv).map_err(|_| CryptoError::DecryptionFailed)?;
    let mut buffer = data.to_vec();
    let len = cipher
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|_| CryptoError::DecryptionFailed)?
        .len();
    buffer.truncate(len);
    Ok(buffer)
}

impl CryptoProvider for RustCryptoProvider {
    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
        let mut mac =
            HmacSha256::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
                expected: 32,
                actual: key.len(),
            })?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }

    fn hkdf_sha256(&self, salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; 32]> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = [0u8; 32];
        hkdf.expand(info, &mut okm)
            .map_err(|_| CryptoError::KeyAgreementFailed)?;
        Ok(okm)
    }

    fn random_bytes(&self, out: &mut [u8]) {
        OsRng.fill_bytes(out);
    }

    fn aes_cbc_encrypt(&self, key: &[u8], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
        check_block_aligned(data)?;
        match key.len() {
            16 => cbc_encrypt::<cbc::Encryptor<Aes128>>(key, iv, data),
            32 => cbc_encrypt::<cbc::Encryptor<Aes256>>(key, iv, data),
            actual => Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual,
            }),
        }
    }

    fn aes_cbc_decrypt(&self, key: &[u8], iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
        check_block_aligned(data)?;
        match key.len() {
            16 => cbc_decrypt::<cbc::Decryptor<Aes128>>(key, iv, data),
            32 => cbc_decrypt::<cbc::Decryptor<Aes256>>(key, iv, data),
            actual => Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual,
            }),
        }
    }

    fn ecdh_init(&self, peer: &PublicPoint) -> Result<KeyAgreementState> {
        let peer_key = p256::PublicKey::from_sec1_bytes(&peer.to_sec1_uncompressed())
            .map_err(|_| CryptoError::InvalidPublicKey)?;

        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let encoded = ephemeral.public_key().to_encoded_point(false);
        let platform_public = PublicPoint::from_sec1(encoded.as_bytes())?;

        let shared = ephemeral.diffie_hellman(&peer_key);
        let mut z = [0u8; 32];
        z.copy_from_slice(shared.raw_secret_bytes());

        // `ephemeral` and `shared` zeroize themselves when they go out of scope
        Ok(KeyAgreementState::new(platform_public, z))
    }
}
