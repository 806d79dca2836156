//! Crypto primitives: HKDF-SHA256, AES-256-GCM, chunk IV derivation,
//! SHA-256 digests, and constant-time comparison.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use ngasihtau_core::error::{ProtectionError, Result};

/// A 32-byte content-encryption key, wiped from memory on drop.
///
/// Never serialized, never logged; Debug output is redacted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CekKey([u8; 32]);

impl CekKey {
    /// Wraps raw key material.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generates a random key. Test convenience; production CEKs are derived.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw byte view for cipher construction.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for CekKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CekKey([REDACTED])")
    }
}

/// HKDF-SHA256 with no salt: expands `ikm` under `info` into `okm`.
pub fn hkdf_derive(ikm: &[u8], info: &[u8], okm: &mut [u8]) -> Result<()> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    hk.expand(info, okm)
        .map_err(|_| ProtectionError::KeyGenerationFailed {
            reason: format!("HKDF output length {} out of range", okm.len()),
        })
}

/// HKDF-SHA256 producing a 32-byte key.
pub fn hkdf_derive_key(ikm: &[u8], info: &[u8]) -> Result<CekKey> {
    let mut okm = [0u8; 32];
    hkdf_derive(ikm, info, &mut okm)?;
    Ok(CekKey(okm))
}

/// AES-256-GCM seal: returns `ciphertext ‖ tag(16)`.
pub fn gcm_seal(key: &CekKey, nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| ProtectionError::EncryptionFailed {
            reason: e.to_string(),
        })?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| ProtectionError::EncryptionFailed {
            reason: e.to_string(),
        })
}

/// AES-256-GCM open. Any authentication failure collapses to the single
/// opaque [`ProtectionError::DecryptionFailed`].
pub fn gcm_open(key: &CekKey, nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|_| ProtectionError::DecryptionFailed)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ProtectionError::DecryptionFailed)
}

/// Per-chunk IV: the first 8 bytes of the file's base seed followed by the
/// big-endian chunk index. Unique within a file for any index below 2³².
pub fn chunk_iv(base_seed: &[u8; 12], index: u32) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[..8].copy_from_slice(&base_seed[..8]);
    iv[8..].copy_from_slice(&index.to_be_bytes());
    iv
}

/// Generates a random 12-byte seed/nonce.
pub fn random_nonce() -> [u8; 12] {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Lowercase-hex SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Constant-time byte equality. Differing lengths compare unequal without
/// shortcutting on content.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
