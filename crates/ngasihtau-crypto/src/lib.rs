#![warn(missing_docs)]

//! NgasihTau cryptography: HKDF-SHA256 derivation, AES-256-GCM sealing,
//! the manifest-backed chunked file codec, and CEK lifecycle management.

pub mod codec;
pub mod keys;
pub mod primitives;

pub use codec::{decrypt_file, encrypt_file, EncryptedFile};
pub use keys::{KeyManager, RotationReport};
pub use primitives::{chunk_iv, ct_eq, gcm_open, gcm_seal, hkdf_derive, sha256_hex, CekKey};
