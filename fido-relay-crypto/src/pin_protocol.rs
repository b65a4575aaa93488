//! PIN/UV authentication protocols (V1 and V2)
//!
//! Spec: <https://fidoalliance.org/specs/fido-v2.2-rd-20230321/fido-client-to-authenticator-protocol-v2.2-rd-20230321.html#authenticatorClientPIN>
//!
//! Protocol V1: AES-256-CBC with a zero IV, HMAC-SHA-256 truncated to 16 bytes
//! Protocol V2: AES-256-CBC with a random IV prepended, full HMAC-SHA-256

use crate::error::{CryptoError, Result};
use crate::key_agreement::PlatformKey;
use crate::provider::{CryptoProvider, AES_BLOCK_SIZE};

use std::fmt;
use std::sync::Arc;

use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A `pinUvAuthToken` issued by the authenticator
///
/// The token is independent of the key agreement that obtained it. Callers
/// must discard it whenever the PIN changes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PinUvToken([u8; 32]);

impl PinUvToken {
    /// Wrap a 32-byte token
    pub fn new(token: [u8; 32]) -> Self {
        Self(token)
    }

    /// Create a token from a decrypted slice
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` unless the slice is 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let token: [u8; 32] = slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: slice.len(),
        })?;
        Ok(Self(token))
    }

    /// Raw token bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PinUvToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PinUvToken(..)")
    }
}

/// Key material accepted by `authenticate` and `verify`
#[derive(Debug, Clone, Copy)]
pub enum AuthKey<'a> {
    /// Keys derived from a key agreement
    Platform(&'a PlatformKey),
    /// A token issued after a PIN/UV ceremony
    Token(&'a PinUvToken),
}

impl<'a> From<&'a PlatformKey> for AuthKey<'a> {
    fn from(key: &'a PlatformKey) -> Self {
        AuthKey::Platform(key)
    }
}

impl<'a> From<&'a PinUvToken> for AuthKey<'a> {
    fn from(token: &'a PinUvToken) -> Self {
        AuthKey::Token(token)
    }
}

/// A PIN/UV auth protocol
pub trait PinUvProtocol: Send + Sync {
    /// Protocol version number (`pinUvAuthProtocol` on the wire)
    fn version(&self) -> u8;

    /// Encrypt block-aligned `plaintext` for the authenticator
    fn encrypt(&self, key: &PlatformKey, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt data received from the authenticator
    fn decrypt(&self, key: &PlatformKey, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Compute the MAC over `data`
    fn authenticate(&self, key: AuthKey<'_>, data: &[u8]) -> Result<Vec<u8>>;

    /// Check `signature` against `authenticate(key, data)`
    ///
    /// The comparison does not short-circuit on the first differing byte. A
    /// signature of the wrong length is rejected, as is any key the MAC
    /// cannot be computed with.
    fn verify(&self, key: AuthKey<'_>, data: &[u8], signature: &[u8]) -> bool {
        match self.authenticate(key, data) {
            Ok(expected) => expected.as_slice().ct_eq(signature).into(),
            Err(_) => false,
        }
    }
}

/// Select the protocol implementation for a negotiated version
///
/// # Errors
///
/// Returns `CryptoError::UnsupportedPinProtocol` for anything but 1 or 2.
pub fn pin_uv_protocol(
    version: u8,
    provider: Arc<dyn CryptoProvider>,
) -> Result<Box<dyn PinUvProtocol>> {
    match version {
        1 => Ok(Box::new(PinProtocolV1::new(provider))),
        2 => Ok(Box::new(PinProtocolV2::new(provider))),
        other => Err(CryptoError::UnsupportedPinProtocol(other)),
    }
}

fn check_aligned(data: &[u8]) -> Result<()> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidLength {
            actual: data.len(),
            reason: "PIN/UV protocol data must be a multiple of 16 bytes",
        });
    }
    Ok(())
}

fn xor_with_encrypted_iv(
    provider: &dyn CryptoProvider,
    key: &[u8],
    iv: &[u8; 16],
    data: &[u8],
) -> Result<Vec<u8>> {
    let pad = provider.aes_cbc_encrypt(key, &[0u8; 16], iv)?;
    Ok(data.iter().zip(pad).map(|(d, k)| d ^ k).collect())
}

/// AES-CBC with ciphertext stealing (CBC-CS1)
///
/// Block-aligned input is plain CBC, so every message CTAP defines (PIN
/// hashes, tokens, salts) is byte-identical on the wire. A trailing partial
/// block is stolen from the previous ciphertext block, keeping the output as
/// long as the input. Input shorter than one block is XORed with `E(iv)`.
fn cbc_cs1_encrypt(
    provider: &dyn CryptoProvider,
    key: &[u8],
    iv: &[u8; 16],
    data: &[u8],
) -> Result<Vec<u8>> {
    let tail = data.len() % AES_BLOCK_SIZE;
    if tail == 0 {
        return provider.aes_cbc_encrypt(key, iv, data);
    }
    if data.len() < AES_BLOCK_SIZE {
        return xor_with_encrypted_iv(provider, key, iv, data);
    }

    let split = data.len() - tail;
    let mut output = provider.aes_cbc_encrypt(key, iv, &data[..split])?;
    let mut previous = [0u8; 16];
    previous.copy_from_slice(&output[split - AES_BLOCK_SIZE..]);

    let mut last = [0u8; 16];
    last[..tail].copy_from_slice(&data[split..]);
    let stolen = provider.aes_cbc_encrypt(key, &previous, &last)?;

    output.truncate(split - AES_BLOCK_SIZE + tail);
    output.extend_from_slice(&stolen);
    Ok(output)
}

/// Inverse of [`cbc_cs1_encrypt`]
fn cbc_cs1_decrypt(
    provider: &dyn CryptoProvider,
    key: &[u8],
    iv: &[u8; 16],
    data: &[u8],
) -> Result<Vec<u8>> {
    let tail = data.len() % AES_BLOCK_SIZE;
    if tail == 0 {
        return provider.aes_cbc_decrypt(key, iv, data);
    }
    if data.len() < AES_BLOCK_SIZE {
        return xor_with_encrypted_iv(provider, key, iv, data);
    }

    let head = data.len() - tail - AES_BLOCK_SIZE;
    let last_start = data.len() - AES_BLOCK_SIZE;

    // D(C_last) = (P_last || 0..) ^ C_prev
    let mixed = provider.aes_cbc_decrypt(key, &[0u8; 16], &data[last_start..])?;
    let mut previous = [0u8; 16];
    previous[..tail].copy_from_slice(&data[head..head + tail]);
    previous[tail..].copy_from_slice(&mixed[tail..]);

    let mut body = data[..head].to_vec();
    body.extend_from_slice(&previous);
    let mut output = provider.aes_cbc_decrypt(key, iv, &body)?;
    output.extend(mixed[..tail].iter().zip(&previous[..tail]).map(|(m, c)| m ^ c));
    Ok(output)
}

/// PIN/UV auth protocol one
///
/// The zero IV gives no protection against traffic analysis; that is how the
/// protocol is defined.
#[derive(Clone)]
pub struct PinProtocolV1 {
    provider: Arc<dyn CryptoProvider>,
}

impl PinProtocolV1 {
    /// MAC length for protocol one
    pub const MAC_LEN: usize = 16;

    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl PinUvProtocol for PinProtocolV1 {
    fn version(&self) -> u8 {
        1
    }

    fn encrypt(&self, key: &PlatformKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        check_aligned(plaintext)?;
        self.provider
            .aes_cbc_encrypt(key.pin_v1_key(), &[0u8; 16], plaintext)
    }

    fn decrypt(&self, key: &PlatformKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
        check_aligned(ciphertext)?;
        self.provider
            .aes_cbc_decrypt(key.pin_v1_key(), &[0u8; 16], ciphertext)
    }

    fn authenticate(&self, key: AuthKey<'_>, data: &[u8]) -> Result<Vec<u8>> {
        let mac_key: &[u8] = match key {
            AuthKey::Platform(k) => k.pin_v1_key(),
            AuthKey::Token(t) => t.as_bytes(),
        };
        let mac = self.provider.hmac_sha256(mac_key, data)?;
        Ok(mac[..Self::MAC_LEN].to_vec())
    }
}

/// PIN/UV auth protocol two
#[derive(Clone)]
pub struct PinProtocolV2 {
    provider: Arc<dyn CryptoProvider>,
}

impl PinProtocolV2 {
    /// MAC length for protocol two
    pub const MAC_LEN: usize = 32;

    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl PinUvProtocol for PinProtocolV2 {
    fn version(&self) -> u8 {
        2
    }

    /// Output format: `IV (16 bytes) || AES-256-CBC(plaintext)`
    ///
    /// Any length is accepted: a trailing partial block uses ciphertext stealing.
    fn encrypt(&self, key: &PlatformKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; 16];
        self.provider.random_bytes(&mut iv);
        let ciphertext =
            cbc_cs1_encrypt(self.provider.as_ref(), key.pin_v2_aes_key(), &iv, plaintext)?;

        let mut output = Vec::with_capacity(16 + ciphertext.len());
        output.extend_from_slice(&iv);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    fn decrypt(&self, key: &PlatformKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < AES_BLOCK_SIZE {
            return Err(CryptoError::InvalidLength {
                actual: ciphertext.len(),
                reason: "protocol two ciphertext must start with a 16-byte IV",
            });
        }
        let (iv, body) = ciphertext.split_at(AES_BLOCK_SIZE);

        let mut iv_block = [0u8; 16];
        iv_block.copy_from_slice(iv);
        cbc_cs1_decrypt(self.provider.as_ref(), key.pin_v2_aes_key(), &iv_block, body)
    }

    fn authenticate(&self, key: AuthKey<'_>, data: &[u8]) -> Result<Vec<u8>> {
        let mac_key: &[u8] = match key {
            AuthKey::Platform(k) => k.pin_v2_hmac_key(),
            AuthKey::Token(t) => t.as_bytes(),
        };
        Ok(self.provider.hmac_sha256(mac_key, data)?.to_vec())
    }
}
