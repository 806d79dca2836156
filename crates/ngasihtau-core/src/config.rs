//! Process-scoped configuration: secret material and operational limits.
//!
//! Loaded once at startup, immutable afterwards, dropped (and wiped) on
//! shutdown.

use std::fmt;
use std::time::Duration;

use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtectionError, Result};

/// Secret byte material wiped from memory on drop.
///
/// Debug output is redacted; the type has no serde support on purpose.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    /// Wraps existing secret material.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Generates `len` cryptographically random bytes.
    pub fn random(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw byte view for key derivation and cipher construction.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for empty material.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes([REDACTED])")
    }
}

impl From<&[u8]> for SecretBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Operational limits. Defaults mirror the documented production values.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Active devices allowed per user.
    pub max_devices_per_user: usize,
    /// Per-user downloads per rate-limit window.
    pub max_downloads_per_hour: u32,
    /// Per-material downloads per rate-limit window.
    pub max_material_downloads_per_hour: u32,
    /// Validation failures per window before a device is blocked.
    pub max_validation_failures_per_hour: u32,
    /// How long an automatic device block lasts.
    pub device_block_duration: Duration,
    /// Width of the rate-limit windows.
    pub rate_limit_window: Duration,
    /// How far in the past a signed request timestamp may lie.
    pub replay_window: Duration,
    /// How far in the future a signed request timestamp may lie.
    pub clock_skew_allowance: Duration,
    /// License lifetime granted on issue and renew.
    pub default_license_expiration: Duration,
    /// Offline grace period granted on issue.
    pub default_offline_grace: Duration,
    /// Plaintext chunk size for the encrypted file format.
    pub chunk_size: usize,
    /// Attempts before an encryption job fails terminally.
    pub max_job_retries: u32,
    /// First retry backoff step.
    pub retry_base_delay: Duration,
    /// Backoff ceiling.
    pub retry_max_delay: Duration,
    /// Per-job execution deadline.
    pub job_timeout: Duration,
    /// Encryption worker pool size.
    pub worker_concurrency: usize,
    /// Lifetime of presigned download URLs.
    pub presigned_ttl: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_devices_per_user: 5,
            max_downloads_per_hour: 10,
            max_material_downloads_per_hour: 100,
            max_validation_failures_per_hour: 5,
            device_block_duration: Duration::from_secs(3600),
            rate_limit_window: Duration::from_secs(3600),
            replay_window: Duration::from_secs(300),
            clock_skew_allowance: Duration::from_secs(60),
            default_license_expiration: Duration::from_secs(30 * 24 * 3600),
            default_offline_grace: Duration::from_secs(72 * 3600),
            chunk_size: 1_048_576,
            max_job_retries: 5,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(300),
            job_timeout: Duration::from_secs(30 * 60),
            worker_concurrency: 4,
            presigned_ttl: Duration::from_secs(3600),
        }
    }
}

/// The process-scoped initialization bundle: secrets plus limits.
#[derive(Debug, Clone)]
pub struct ProtectionConfig {
    /// HKDF input keying material for CEK and transport-key derivation.
    pub master_secret: SecretBytes,
    /// Key-encryption key wrapping CEKs at rest (16, 24, or 32 bytes).
    pub kek: SecretBytes,
    /// HMAC key for request signatures.
    pub signing_secret: SecretBytes,
    /// Version tag of the active KEK.
    pub current_key_version: u32,
    /// Operational limits.
    pub limits: Limits,
}

impl ProtectionConfig {
    /// Builds a config with default limits at key version 1.
    pub fn new(master_secret: SecretBytes, kek: SecretBytes, signing_secret: SecretBytes) -> Self {
        Self {
            master_secret,
            kek,
            signing_secret,
            current_key_version: 1,
            limits: Limits::default(),
        }
    }

    /// Random secrets with default limits. Test and development convenience.
    pub fn for_testing() -> Self {
        Self::new(
            SecretBytes::random(32),
            SecretBytes::random(32),
            SecretBytes::random(32),
        )
    }

    /// Checks the structural constraints on secrets and limits.
    pub fn validate(&self) -> Result<()> {
        if self.master_secret.len() < 32 {
            return Err(ProtectionError::InvalidRequest {
                reason: "master secret must be at least 32 bytes".to_string(),
            });
        }
        if !matches!(self.kek.len(), 16 | 24 | 32) {
            return Err(ProtectionError::InvalidRequest {
                reason: "KEK must be 16, 24, or 32 bytes".to_string(),
            });
        }
        if self.signing_secret.is_empty() {
            return Err(ProtectionError::InvalidRequest {
                reason: "signing secret must not be empty".to_string(),
            });
        }
        if self.current_key_version < 1 {
            return Err(ProtectionError::InvalidRequest {
                reason: "key version must be at least 1".to_string(),
            });
        }
        if self.limits.worker_concurrency < 1 {
            return Err(ProtectionError::InvalidRequest {
                reason: "worker concurrency must be at least 1".to_string(),
            });
        }
        if self.limits.chunk_size == 0 {
            return Err(ProtectionError::InvalidRequest {
                reason: "chunk size must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Converts a std duration to a chrono duration, saturating far in the
/// future when out of range.
pub fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
