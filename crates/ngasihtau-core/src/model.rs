//! Core data model: devices, wrapped keys, licenses, manifests, jobs, and
//! audit entries.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtectionError;
use crate::id::Id;

/// File types accepted for encryption.
pub const SUPPORTED_FILE_TYPES: [&str; 5] = ["pdf", "docx", "pptx", "doc", "ppt"];

/// Returns true when the file type is in the supported set.
pub fn is_supported_file_type(file_type: &str) -> bool {
    SUPPORTED_FILE_TYPES.contains(&file_type)
}

/// Client platform a device runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Apple iOS / iPadOS.
    Ios,
    /// Android.
    Android,
    /// Desktop application.
    Desktop,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Ios => write!(f, "ios"),
            Platform::Android => write!(f, "android"),
            Platform::Desktop => write!(f, "desktop"),
        }
    }
}

impl FromStr for Platform {
    type Err = ProtectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            "desktop" => Ok(Platform::Desktop),
            other => Err(ProtectionError::InvalidRequest {
                reason: format!("unknown platform {:?}", other),
            }),
        }
    }
}

/// A registered client device, fingerprint-bound to one user.
#[derive(Debug, Clone)]
pub struct Device {
    /// Device id.
    pub id: Id,
    /// Owning user.
    pub user_id: Id,
    /// Opaque device fingerprint (32–512 printable chars).
    pub fingerprint: String,
    /// Display name (1–255 chars).
    pub name: String,
    /// Client platform.
    pub platform: Platform,
    /// Registration instant.
    pub created_at: DateTime<Utc>,
    /// Last successful use.
    pub last_used_at: DateTime<Utc>,
    /// Set once on revocation, never cleared.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Device {
    /// Returns true once the device has been revoked.
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// A wrapped content-encryption key bound to (user, material, device).
///
/// `encrypted_key` is `nonce(12) ‖ ciphertext ‖ tag(16)` wrapping a 32-byte
/// key under the KEK of `key_version`. Plaintext key bytes never appear here.
#[derive(Debug, Clone)]
pub struct CekRecord {
    /// Record id.
    pub id: Id,
    /// Owning user.
    pub user_id: Id,
    /// Material the key encrypts.
    pub material_id: Id,
    /// Device the key is bound to.
    pub device_id: Id,
    /// KEK-wrapped key material.
    pub encrypted_key: Vec<u8>,
    /// Version of the KEK used to wrap.
    pub key_version: u32,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a license.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    /// Valid for validation and downloads.
    Active,
    /// Terminally revoked.
    Revoked,
}

/// A per-(user, material, device) playback license with a rotating nonce.
#[derive(Debug, Clone)]
pub struct License {
    /// License id.
    pub id: Id,
    /// Owning user.
    pub user_id: Id,
    /// Licensed material.
    pub material_id: Id,
    /// Bound device.
    pub device_id: Id,
    /// Lifecycle state.
    pub status: LicenseStatus,
    /// Hard expiry.
    pub expires_at: DateTime<Utc>,
    /// How long the client may decrypt without re-validating.
    pub offline_grace: Duration,
    /// Instant of the last successful validation (or issuance).
    pub last_validated_at: DateTime<Utc>,
    /// Current validation nonce, 64 lowercase hex chars, single-use.
    pub nonce: String,
    /// Issuance instant.
    pub created_at: DateTime<Utc>,
    /// Set once on revocation.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl License {
    /// Returns true once the license is revoked.
    pub fn is_revoked(&self) -> bool {
        self.status == LicenseStatus::Revoked
    }

    /// Returns true when `now` is past the hard expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Returns true when the time since the last validation exceeds the
    /// offline grace period.
    pub fn is_offline_expired(&self, now: DateTime<Utc>) -> bool {
        let grace =
            chrono::Duration::from_std(self.offline_grace).unwrap_or(chrono::Duration::zero());
        now - self.last_validated_at > grace
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = STANDARD.decode(s).map_err(serde::de::Error::custom)?;
        raw.try_into()
            .map_err(|_| serde::de::Error::custom("wrong byte length"))
    }
}

/// Metadata of one encrypted chunk inside the encrypted stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedChunk {
    /// Zero-based chunk index.
    pub index: u32,
    /// Byte offset of this chunk's record in the encrypted stream.
    pub offset: u64,
    /// Total record size: `12 + |ciphertext| + 16`.
    pub size: u64,
    /// Per-chunk initialization vector.
    #[serde(with = "base64_bytes")]
    pub iv: [u8; 12],
    /// GCM authentication tag.
    #[serde(with = "base64_bytes")]
    pub auth_tag: [u8; 16],
}

/// Out-of-band description of an encrypted file: identifiers, digests, and
/// the ordered chunk table clients need for verification and decryption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadManifest {
    /// Material the manifest describes.
    pub material_id: Id,
    /// License the encryption was performed for.
    pub license_id: Id,
    /// Plaintext size in bytes.
    pub total_size: u64,
    /// Lowercase-hex SHA-256 of the plaintext.
    pub original_hash: String,
    /// Lowercase-hex SHA-256 of the encrypted stream.
    pub encrypted_hash: String,
    /// Plaintext chunk size used during encryption.
    pub chunk_size: u64,
    /// Number of chunks.
    pub total_chunks: u32,
    /// Declared plaintext file type.
    pub file_type: String,
    /// Chunk table in index order.
    pub chunks: Vec<EncryptedChunk>,
    /// Manifest creation instant.
    pub created_at: DateTime<Utc>,
}

impl DownloadManifest {
    /// Completeness check: all identifying fields present, sizes and chunk
    /// table non-empty and mutually consistent.
    pub fn validate(&self) -> Result<(), ProtectionError> {
        let fail = |reason: &str| {
            Err(ProtectionError::InvalidRequest {
                reason: format!("incomplete manifest: {reason}"),
            })
        };
        if self.material_id.is_nil() || self.license_id.is_nil() {
            return fail("missing identifiers");
        }
        if self.total_size == 0 {
            return fail("zero total size");
        }
        if self.original_hash.is_empty() || self.encrypted_hash.is_empty() {
            return fail("missing digests");
        }
        if self.chunk_size == 0 {
            return fail("zero chunk size");
        }
        if self.total_chunks == 0 || self.chunks.is_empty() {
            return fail("no chunks");
        }
        if self.chunks.len() != self.total_chunks as usize {
            return fail("chunk table length mismatch");
        }
        if self.file_type.is_empty() {
            return fail("missing file type");
        }
        Ok(())
    }
}

/// An encrypted rendition of a material, produced by an encryption job.
#[derive(Debug, Clone)]
pub struct EncryptedMaterial {
    /// Record id.
    pub id: Id,
    /// Source material.
    pub material_id: Id,
    /// CEK record used for the encryption.
    pub cek_id: Id,
    /// Chunk manifest of the encrypted file.
    pub manifest: DownloadManifest,
    /// Object-storage key of the encrypted file.
    pub encrypted_file_key: String,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
}

/// Dispatch priority of an encryption job. Lower values dispatch first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobPriority {
    /// Dispatched ahead of everything else.
    High = 1,
    /// Default priority.
    Normal = 2,
    /// Background backfill.
    Low = 3,
}

/// Lifecycle state of an encryption job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting for a worker.
    Pending,
    /// Owned by exactly one worker.
    Processing,
    /// Finished successfully. Terminal.
    Completed,
    /// Retries exhausted. Terminal.
    Failed,
}

impl JobStatus {
    /// Returns true for sticky terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// A background encryption job.
#[derive(Debug, Clone)]
pub struct EncryptionJob {
    /// Job id.
    pub id: Id,
    /// Material to encrypt.
    pub material_id: Id,
    /// Requesting user.
    pub user_id: Id,
    /// Target device.
    pub device_id: Id,
    /// License the encryption serves.
    pub license_id: Id,
    /// Dispatch priority.
    pub priority: JobPriority,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Terminal failure message, set when status is `Failed`.
    pub error: Option<String>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Set when a worker claims the job.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on reaching a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

/// One append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Entry id.
    pub id: Id,
    /// Acting user.
    pub user_id: Id,
    /// Device involved, when applicable.
    pub device_id: Option<Id>,
    /// Action name, e.g. `license.issue`.
    pub action: String,
    /// Resource class, e.g. `license`.
    pub resource: String,
    /// Identifier of the affected resource.
    pub resource_id: String,
    /// Client IP as reported by the transport layer.
    pub ip: String,
    /// Client user agent.
    pub user_agent: String,
    /// Whether the action succeeded.
    pub success: bool,
    /// Stable error code when the action failed.
    pub error_code: Option<String>,
    /// Record instant.
    pub created_at: DateTime<Utc>,
}
