//! Chunked authenticated-encryption codec.
//!
//! On-disk layout is the concatenation, in chunk-index order, of records
//! `iv(12) ‖ ciphertext ‖ tag(16)`. All metadata (per-chunk IV, tag, offsets,
//! digests) travels out-of-band in the [`DownloadManifest`].

use chrono::{DateTime, Utc};

use ngasihtau_core::error::{ProtectionError, Result};
use ngasihtau_core::id::Id;
use ngasihtau_core::model::{DownloadManifest, EncryptedChunk};

use crate::primitives::{chunk_iv, gcm_open, gcm_seal, sha256_hex, CekKey};

/// Per-record framing overhead: iv(12) + tag(16).
const CHUNK_OVERHEAD: u64 = 12 + 16;

/// Output of [`encrypt_file`]: the encrypted stream plus everything the
/// manifest needs.
#[derive(Debug, Clone)]
pub struct EncryptedFile {
    /// The encrypted stream.
    pub data: Vec<u8>,
    /// Chunk table in index order.
    pub chunks: Vec<EncryptedChunk>,
    /// Plaintext size in bytes.
    pub total_size: u64,
    /// Lowercase-hex SHA-256 of the plaintext.
    pub original_hash: String,
    /// Lowercase-hex SHA-256 of the encrypted stream.
    pub encrypted_hash: String,
}

/// Encrypts a file into the chunked format.
///
/// Chunk IVs are derived from `base_seed` and the chunk index, so they are
/// pairwise distinct within the file; the seed must be unique per file.
/// Empty input yields zero chunks and an empty stream.
pub fn encrypt_file(
    plaintext: &[u8],
    cek: &CekKey,
    base_seed: &[u8; 12],
    chunk_size: usize,
) -> Result<EncryptedFile> {
    if chunk_size == 0 {
        return Err(ProtectionError::EncryptionFailed {
            reason: "chunk size must be positive".to_string(),
        });
    }
    let total_chunks = plaintext.len().div_ceil(chunk_size);
    if total_chunks > u32::MAX as usize {
        return Err(ProtectionError::EncryptionFailed {
            reason: "input exceeds the addressable chunk count".to_string(),
        });
    }

    let mut data = Vec::with_capacity(plaintext.len() + total_chunks * CHUNK_OVERHEAD as usize);
    let mut chunks = Vec::with_capacity(total_chunks);
    let mut offset = 0u64;

    for index in 0..total_chunks {
        let start = index * chunk_size;
        let end = usize::min(start + chunk_size, plaintext.len());
        let iv = chunk_iv(base_seed, index as u32);
        let sealed = gcm_seal(cek, &iv, &plaintext[start..end])?;

        let mut auth_tag = [0u8; 16];
        auth_tag.copy_from_slice(&sealed[sealed.len() - 16..]);
        let size = 12 + sealed.len() as u64;

        data.extend_from_slice(&iv);
        data.extend_from_slice(&sealed);
        chunks.push(EncryptedChunk {
            index: index as u32,
            offset,
            size,
            iv,
            auth_tag,
        });
        offset += size;
    }

    Ok(EncryptedFile {
        original_hash: sha256_hex(plaintext),
        encrypted_hash: sha256_hex(&data),
        total_size: plaintext.len() as u64,
        data,
        chunks,
    })
}

/// Decrypts a chunked stream. All-or-nothing: any malformed record or
/// authentication failure yields [`ProtectionError::DecryptionFailed`] and no
/// partial plaintext.
pub fn decrypt_file(stream: &[u8], cek: &CekKey, chunks: &[EncryptedChunk]) -> Result<Vec<u8>> {
    let mut ordered: Vec<&EncryptedChunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);

    let mut plaintext = Vec::with_capacity(stream.len());
    for chunk in ordered {
        if chunk.size < CHUNK_OVERHEAD {
            return Err(ProtectionError::DecryptionFailed);
        }
        let start = chunk.offset as usize;
        let end = start
            .checked_add(chunk.size as usize)
            .ok_or(ProtectionError::DecryptionFailed)?;
        if end > stream.len() {
            return Err(ProtectionError::DecryptionFailed);
        }
        let record = &stream[start..end];
        let (iv, body) = record.split_at(12);
        let iv: [u8; 12] = iv.try_into().map_err(|_| ProtectionError::DecryptionFailed)?;
        plaintext.extend_from_slice(&gcm_open(cek, &iv, body)?);
    }
    Ok(plaintext)
}

/// Assembles the manifest for an encrypted file.
pub fn build_manifest(
    material_id: Id,
    license_id: Id,
    file_type: &str,
    chunk_size: usize,
    file: &EncryptedFile,
    created_at: DateTime<Utc>,
) -> DownloadManifest {
    DownloadManifest {
        material_id,
        license_id,
        total_size: file.total_size,
        original_hash: file.original_hash.clone(),
        encrypted_hash: file.encrypted_hash.clone(),
        chunk_size: chunk_size as u64,
        total_chunks: file.chunks.len() as u32,
        file_type: file_type.to_string(),
        chunks: file.chunks.clone(),
        created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::random_nonce;
    use proptest::prelude::*;
    use std::collections::HashSet;

    const MIB: usize = 1_048_576;

    #[test]
    fn test_two_and_a_half_mib_layout() {
        let plaintext = vec![0x5Au8; 2 * MIB + 500];
        let cek = CekKey::random();
        let seed = random_nonce();

        let file = encrypt_file(&plaintext, &cek, &seed, MIB).unwrap();
        assert_eq!(file.chunks.len(), 3);
        assert_eq!(file.total_size, plaintext.len() as u64);

        assert_eq!(file.chunks[0].offset, 0);
        assert_eq!(file.chunks[0].size, 1_048_604);
        assert_eq!(file.chunks[1].offset, 1_048_604);
        assert_eq!(file.chunks[1].size, 1_048_604);
        assert_eq!(file.chunks[2].offset, 2_097_208);
        assert_eq!(file.chunks[2].size, 500 + 28);
        assert_eq!(
            file.data.len() as u64,
            file.chunks.iter().map(|c| c.size).sum::<u64>()
        );

        let decrypted = decrypt_file(&file.data, &cek, &file.chunks).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_empty_input_yields_zero_chunks() {
        let cek = CekKey::random();
        let file = encrypt_file(&[], &cek, &random_nonce(), MIB).unwrap();
        assert!(file.chunks.is_empty());
        assert!(file.data.is_empty());
        assert_eq!(file.total_size, 0);
        assert_eq!(decrypt_file(&file.data, &cek, &file.chunks).unwrap(), b"");
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(encrypt_file(b"data", &CekKey::random(), &random_nonce(), 0).is_err());
    }

    #[test]
    fn test_wrong_key_fails_decryption() {
        let cek = CekKey::random();
        let file = encrypt_file(b"some content", &cek, &random_nonce(), 8).unwrap();
        assert!(matches!(
            decrypt_file(&file.data, &CekKey::random(), &file.chunks),
            Err(ProtectionError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_truncated_stream_fails() {
        let cek = CekKey::random();
        let file = encrypt_file(b"some content", &cek, &random_nonce(), 8).unwrap();
        let truncated = &file.data[..file.data.len() - 1];
        assert!(matches!(
            decrypt_file(truncated, &cek, &file.chunks),
            Err(ProtectionError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_digests_match_streams() {
        let plaintext = b"digest me".to_vec();
        let cek = CekKey::random();
        let file = encrypt_file(&plaintext, &cek, &random_nonce(), 4).unwrap();
        assert_eq!(file.original_hash, sha256_hex(&plaintext));
        assert_eq!(file.encrypted_hash, sha256_hex(&file.data));
        assert_ne!(file.original_hash, file.encrypted_hash);
    }

    #[test]
    fn test_manifest_build_and_validate() {
        let plaintext = vec![1u8; 5000];
        let cek = CekKey::random();
        let file = encrypt_file(&plaintext, &cek, &random_nonce(), 1024).unwrap();
        let manifest = build_manifest(
            Id::generate(),
            Id::generate(),
            "pdf",
            1024,
            &file,
            Utc::now(),
        );
        manifest.validate().unwrap();
        assert_eq!(manifest.total_chunks, 5);
        assert_eq!(manifest.total_size, 5000);
        assert_eq!(manifest.chunk_size, 1024);
        assert_eq!(manifest.chunks, file.chunks);
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            data in prop::collection::vec(any::<u8>(), 0..16_384),
            chunk_size in 1usize..4096,
        ) {
            let cek = CekKey::random();
            let seed = random_nonce();
            let file = encrypt_file(&data, &cek, &seed, chunk_size).unwrap();
            let decrypted = decrypt_file(&file.data, &cek, &file.chunks).unwrap();
            prop_assert_eq!(decrypted, data);
        }

        #[test]
        fn prop_chunk_count_law(
            data in prop::collection::vec(any::<u8>(), 0..16_384),
            chunk_size in 1usize..4096,
        ) {
            let file = encrypt_file(&data, &CekKey::random(), &random_nonce(), chunk_size).unwrap();
            prop_assert_eq!(file.chunks.len(), data.len().div_ceil(chunk_size));
            let total: u64 = file.chunks.iter().map(|c| c.size).sum();
            prop_assert_eq!(file.data.len() as u64, total);
            // Offsets tile the stream without gaps or overlap.
            let mut expected = 0u64;
            for chunk in &file.chunks {
                prop_assert_eq!(chunk.offset, expected);
                expected += chunk.size;
            }
        }

        #[test]
        fn prop_ivs_are_pairwise_distinct(
            data in prop::collection::vec(any::<u8>(), 1..8_192),
            chunk_size in 1usize..512,
        ) {
            let file = encrypt_file(&data, &CekKey::random(), &random_nonce(), chunk_size).unwrap();
            let ivs: HashSet<[u8; 12]> = file.chunks.iter().map(|c| c.iv).collect();
            prop_assert_eq!(ivs.len(), file.chunks.len());
        }

        #[test]
        fn prop_single_byte_flip_breaks_decryption(
            data in prop::collection::vec(any::<u8>(), 1..4_096),
            chunk_size in 1usize..512,
            flip in any::<prop::sample::Index>(),
        ) {
            let cek = CekKey::random();
            let file = encrypt_file(&data, &cek, &random_nonce(), chunk_size).unwrap();
            let mut tampered = file.data.clone();
            let at = flip.index(tampered.len());
            tampered[at] ^= 0x01;
            prop_assert!(decrypt_file(&tampered, &cek, &file.chunks).is_err());
        }
    }
}
