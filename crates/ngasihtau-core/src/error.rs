//! Error taxonomy for the content-protection subsystem and the sanitizer
//! that maps internal errors to client-safe responses.

use serde::Serialize;
use thiserror::Error;

use crate::id::Id;

/// Result type alias used across the subsystem.
pub type Result<T> = std::result::Result<T, ProtectionError>;

/// Stable classification of a [`ProtectionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The device does not exist or is revoked.
    DeviceNotFound,
    /// No active device matches the presented fingerprint.
    DeviceFingerprintMismatch,
    /// The per-user active device cap is reached.
    DeviceLimitExceeded,
    /// The device is temporarily blocked after repeated failures.
    DeviceBlocked,
    /// The license does not exist.
    LicenseNotFound,
    /// The license expiry has passed.
    LicenseExpired,
    /// The license was revoked.
    LicenseRevoked,
    /// The offline grace period since the last validation has elapsed.
    LicenseOfflineExpired,
    /// The presented validation nonce does not match.
    InvalidNonce,
    /// The user is not entitled to the material.
    MaterialAccessDenied,
    /// No encrypted material exists yet for the requested id.
    MaterialNotFound,
    /// The material's file type is not supported for encryption.
    UnsupportedFileType,
    /// A rate limit window is exhausted.
    RateLimitExceeded,
    /// The request signature is missing, malformed, or wrong.
    InvalidSignature,
    /// The request nonce was already used inside the replay window.
    ReplayAttack,
    /// The request failed input validation.
    InvalidRequest,
    /// An encryption operation failed.
    EncryptionFailed,
    /// Authenticated decryption failed.
    DecryptionFailed,
    /// Key derivation or generation failed.
    KeyGenerationFailed,
    /// Key unwrap was rejected (wrong KEK or corrupted material).
    InvalidKey,
    /// Object-storage failure.
    StorageError,
    /// Relational-persistence failure.
    DatabaseError,
    /// Unclassified internal failure.
    InternalError,
    /// A dependency is unavailable.
    ServiceUnavailable,
    /// The encryption job does not exist.
    JobNotFound,
    /// The encryption job terminally failed.
    JobFailed,
}

impl ErrorKind {
    /// Stable internal code, recorded in audit entries.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::DeviceNotFound => "DEVICE_NOT_FOUND",
            ErrorKind::DeviceFingerprintMismatch => "DEVICE_FINGERPRINT_MISMATCH",
            ErrorKind::DeviceLimitExceeded => "DEVICE_LIMIT_EXCEEDED",
            ErrorKind::DeviceBlocked => "DEVICE_BLOCKED",
            ErrorKind::LicenseNotFound => "LICENSE_NOT_FOUND",
            ErrorKind::LicenseExpired => "LICENSE_EXPIRED",
            ErrorKind::LicenseRevoked => "LICENSE_REVOKED",
            ErrorKind::LicenseOfflineExpired => "LICENSE_OFFLINE_EXPIRED",
            ErrorKind::InvalidNonce => "INVALID_NONCE",
            ErrorKind::MaterialAccessDenied => "MATERIAL_ACCESS_DENIED",
            ErrorKind::MaterialNotFound => "MATERIAL_NOT_FOUND",
            ErrorKind::UnsupportedFileType => "UNSUPPORTED_FILE_TYPE",
            ErrorKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorKind::InvalidSignature => "INVALID_SIGNATURE",
            ErrorKind::ReplayAttack => "REPLAY_ATTACK",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::EncryptionFailed => "ENCRYPTION_FAILED",
            ErrorKind::DecryptionFailed => "DECRYPTION_FAILED",
            ErrorKind::KeyGenerationFailed => "KEY_GENERATION_FAILED",
            ErrorKind::InvalidKey => "INVALID_KEY",
            ErrorKind::StorageError => "STORAGE_ERROR",
            ErrorKind::DatabaseError => "DATABASE_ERROR",
            ErrorKind::InternalError => "INTERNAL_ERROR",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::JobNotFound => "JOB_NOT_FOUND",
            ErrorKind::JobFailed => "JOB_FAILED",
        }
    }
}

/// Closed error domain of the content-protection subsystem.
///
/// Variants carry internal context (ids, wrapped reasons) for logs and audit.
/// Nothing here is client-safe as-is; external surfaces go through
/// [`ProtectionError::sanitize`].
#[derive(Debug, Error)]
pub enum ProtectionError {
    /// Device missing or revoked.
    #[error("device {device_id} not found")]
    DeviceNotFound {
        /// The device that was looked up.
        device_id: Id,
    },

    /// No active device matches the presented fingerprint.
    #[error("no active device matches the presented fingerprint for user {user_id}")]
    DeviceFingerprintMismatch {
        /// The user the fingerprint was checked against.
        user_id: Id,
    },

    /// The per-user cap on active devices is reached.
    #[error("user {user_id} already has {active} active devices")]
    DeviceLimitExceeded {
        /// The owning user.
        user_id: Id,
        /// Number of currently active devices.
        active: usize,
    },

    /// The device is blocked after repeated validation failures.
    #[error("device {device_id} is temporarily blocked")]
    DeviceBlocked {
        /// The blocked device.
        device_id: Id,
    },

    /// License row absent.
    #[error("license {license_id} not found")]
    LicenseNotFound {
        /// The license that was looked up.
        license_id: Id,
    },

    /// `expires_at` has passed.
    #[error("license {license_id} expired")]
    LicenseExpired {
        /// The expired license.
        license_id: Id,
    },

    /// Terminal revoked state.
    #[error("license {license_id} is revoked")]
    LicenseRevoked {
        /// The revoked license.
        license_id: Id,
    },

    /// Too long since the last successful validation.
    #[error("license {license_id} exceeded its offline grace period")]
    LicenseOfflineExpired {
        /// The license past its grace window.
        license_id: Id,
    },

    /// Presented nonce does not match the stored one.
    #[error("nonce mismatch for license {license_id}")]
    InvalidNonce {
        /// The license whose nonce was checked.
        license_id: Id,
    },

    /// Entitlement check refused.
    #[error("user {user_id} has no access to material {material_id}")]
    MaterialAccessDenied {
        /// The requesting user.
        user_id: Id,
        /// The material the user asked for.
        material_id: Id,
    },

    /// No encrypted material record yet (encryption pending or never ran).
    #[error("no encrypted material for {material_id}")]
    MaterialNotFound {
        /// The requested material.
        material_id: Id,
    },

    /// File type outside the supported set.
    #[error("unsupported file type {file_type:?}")]
    UnsupportedFileType {
        /// The rejected file type.
        file_type: String,
    },

    /// A rate-limit window is exhausted.
    #[error("rate limit exceeded for {scope}")]
    RateLimitExceeded {
        /// Which window was exhausted ("user" or "material").
        scope: String,
    },

    /// Bad or missing request signature.
    #[error("invalid request signature: {reason}")]
    InvalidSignature {
        /// Internal-only detail of the rejection.
        reason: String,
    },

    /// The request nonce was already seen inside the replay window.
    #[error("request nonce already used")]
    ReplayAttack,

    /// Input validation failure.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// Internal-only detail of the rejection.
        reason: String,
    },

    /// Encryption operation failure.
    #[error("encryption failed: {reason}")]
    EncryptionFailed {
        /// Internal-only detail.
        reason: String,
    },

    /// Authenticated decryption failure. Deliberately carries no detail.
    #[error("decryption failed: authentication error")]
    DecryptionFailed,

    /// Key derivation/generation failure.
    #[error("key generation failed: {reason}")]
    KeyGenerationFailed {
        /// Internal-only detail.
        reason: String,
    },

    /// Key unwrap rejected: wrong KEK version or corrupted key material.
    #[error("key unwrap rejected")]
    InvalidKey,

    /// Object-storage failure, original error preserved for logs.
    #[error("storage error: {reason}")]
    StorageError {
        /// Wrapped backend error text.
        reason: String,
    },

    /// Persistence failure, original error preserved for logs.
    #[error("database error: {reason}")]
    DatabaseError {
        /// Wrapped backend error text.
        reason: String,
    },

    /// Unclassified internal failure.
    #[error("internal error: {reason}")]
    InternalError {
        /// Internal-only detail.
        reason: String,
    },

    /// A dependency is unavailable.
    #[error("service unavailable: {reason}")]
    ServiceUnavailable {
        /// Internal-only detail.
        reason: String,
    },

    /// Encryption job absent.
    #[error("job {job_id} not found")]
    JobNotFound {
        /// The job that was looked up.
        job_id: Id,
    },

    /// Encryption job terminally failed.
    #[error("job {job_id} failed: {reason}")]
    JobFailed {
        /// The failed job.
        job_id: Id,
        /// Terminal failure message.
        reason: String,
    },
}

impl ProtectionError {
    /// Stable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtectionError::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            ProtectionError::DeviceFingerprintMismatch { .. } => {
                ErrorKind::DeviceFingerprintMismatch
            }
            ProtectionError::DeviceLimitExceeded { .. } => ErrorKind::DeviceLimitExceeded,
            ProtectionError::DeviceBlocked { .. } => ErrorKind::DeviceBlocked,
            ProtectionError::LicenseNotFound { .. } => ErrorKind::LicenseNotFound,
            ProtectionError::LicenseExpired { .. } => ErrorKind::LicenseExpired,
            ProtectionError::LicenseRevoked { .. } => ErrorKind::LicenseRevoked,
            ProtectionError::LicenseOfflineExpired { .. } => ErrorKind::LicenseOfflineExpired,
            ProtectionError::InvalidNonce { .. } => ErrorKind::InvalidNonce,
            ProtectionError::MaterialAccessDenied { .. } => ErrorKind::MaterialAccessDenied,
            ProtectionError::MaterialNotFound { .. } => ErrorKind::MaterialNotFound,
            ProtectionError::UnsupportedFileType { .. } => ErrorKind::UnsupportedFileType,
            ProtectionError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            ProtectionError::InvalidSignature { .. } => ErrorKind::InvalidSignature,
            ProtectionError::ReplayAttack => ErrorKind::ReplayAttack,
            ProtectionError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            ProtectionError::EncryptionFailed { .. } => ErrorKind::EncryptionFailed,
            ProtectionError::DecryptionFailed => ErrorKind::DecryptionFailed,
            ProtectionError::KeyGenerationFailed { .. } => ErrorKind::KeyGenerationFailed,
            ProtectionError::InvalidKey => ErrorKind::InvalidKey,
            ProtectionError::StorageError { .. } => ErrorKind::StorageError,
            ProtectionError::DatabaseError { .. } => ErrorKind::DatabaseError,
            ProtectionError::InternalError { .. } => ErrorKind::InternalError,
            ProtectionError::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            ProtectionError::JobNotFound { .. } => ErrorKind::JobNotFound,
            ProtectionError::JobFailed { .. } => ErrorKind::JobFailed,
        }
    }

    /// Stable internal code of this error's kind.
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Client-safe projection of this error.
    pub fn sanitize(&self) -> ExternalError {
        sanitize(self.kind())
    }

    /// Wraps a persistence backend error.
    pub fn database(err: impl std::fmt::Display) -> Self {
        ProtectionError::DatabaseError {
            reason: err.to_string(),
        }
    }

    /// Wraps an object-storage backend error.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        ProtectionError::StorageError {
            reason: err.to_string(),
        }
    }

    /// Wraps an unclassified internal failure.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        ProtectionError::InternalError {
            reason: err.to_string(),
        }
    }
}

/// What a client is allowed to see: HTTP status, stable code, safe message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExternalError {
    /// HTTP status the transport layer should answer with.
    pub status: u16,
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Human-readable message free of ids and internal detail.
    pub message: &'static str,
}

/// Maps an error kind to its external surface.
///
/// Missing-device and fingerprint-mismatch collapse to one opaque surface so
/// clients cannot enumerate registered devices; security and internal errors
/// collapse to generic text.
pub fn sanitize(kind: ErrorKind) -> ExternalError {
    let (status, code, message) = match kind {
        ErrorKind::DeviceNotFound | ErrorKind::DeviceFingerprintMismatch => {
            (403, "DEVICE_VERIFICATION_FAILED", "Device verification failed")
        }
        ErrorKind::DeviceLimitExceeded => (
            409,
            "DEVICE_LIMIT_EXCEEDED",
            "Maximum number of registered devices reached",
        ),
        ErrorKind::DeviceBlocked => (403, "DEVICE_BLOCKED", "Device is temporarily blocked"),
        ErrorKind::LicenseNotFound => (404, "LICENSE_NOT_FOUND", "License not found"),
        ErrorKind::LicenseExpired => (403, "LICENSE_EXPIRED", "License has expired"),
        ErrorKind::LicenseRevoked => (403, "LICENSE_REVOKED", "License has been revoked"),
        ErrorKind::LicenseOfflineExpired => (
            403,
            "LICENSE_OFFLINE_EXPIRED",
            "Offline validation period has expired",
        ),
        ErrorKind::InvalidNonce => (403, "INVALID_NONCE", "License validation nonce is invalid"),
        ErrorKind::MaterialAccessDenied => (
            403,
            "MATERIAL_ACCESS_DENIED",
            "Access to this material is denied",
        ),
        ErrorKind::MaterialNotFound => (
            404,
            "MATERIAL_NOT_FOUND",
            "Material is not available for download yet",
        ),
        ErrorKind::UnsupportedFileType => (400, "UNSUPPORTED_FILE_TYPE", "Unsupported file type"),
        ErrorKind::RateLimitExceeded => (429, "RATE_LIMIT_EXCEEDED", "Too many requests"),
        ErrorKind::InvalidSignature | ErrorKind::ReplayAttack => {
            (401, "REQUEST_REJECTED", "Request rejected")
        }
        ErrorKind::InvalidRequest => (400, "INVALID_REQUEST", "Invalid request"),
        ErrorKind::JobNotFound => (404, "JOB_NOT_FOUND", "Job not found"),
        ErrorKind::StorageError | ErrorKind::DatabaseError | ErrorKind::ServiceUnavailable => (
            503,
            "SERVICE_UNAVAILABLE",
            "Service temporarily unavailable",
        ),
        ErrorKind::EncryptionFailed
        | ErrorKind::DecryptionFailed
        | ErrorKind::KeyGenerationFailed
        | ErrorKind::InvalidKey
        | ErrorKind::InternalError
        | ErrorKind::JobFailed => (500, "INTERNAL_ERROR", "An internal error occurred"),
    };
    ExternalError {
        status,
        code,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_alias() {
        let ok: Result<u32> = Ok(7);
        assert!(ok.is_ok());
        let err: Result<u32> = Err(ProtectionError::DecryptionFailed);
        assert!(err.is_err());
    }

    #[test]
    fn test_kind_mapping() {
        let err = ProtectionError::LicenseExpired {
            license_id: Id::generate(),
        };
        assert_eq!(err.kind(), ErrorKind::LicenseExpired);
        assert_eq!(err.code(), "LICENSE_EXPIRED");
    }

    #[test]
    fn test_device_enumeration_surfaces_are_identical() {
        let missing = sanitize(ErrorKind::DeviceNotFound);
        let mismatch = sanitize(ErrorKind::DeviceFingerprintMismatch);
        assert_eq!(missing, mismatch);
        assert_eq!(missing.message, "Device verification failed");
    }

    #[test]
    fn test_internal_codes_still_differ_for_audit() {
        assert_ne!(
            ErrorKind::DeviceNotFound.code(),
            ErrorKind::DeviceFingerprintMismatch.code()
        );
    }

    #[test]
    fn test_security_errors_collapse_to_generic_text() {
        for kind in [ErrorKind::InvalidSignature, ErrorKind::ReplayAttack] {
            let ext = sanitize(kind);
            assert_eq!(ext.status, 401);
            assert_eq!(ext.message, "Request rejected");
        }
    }

    #[test]
    fn test_internal_errors_collapse_to_generic_text() {
        for kind in [
            ErrorKind::EncryptionFailed,
            ErrorKind::DecryptionFailed,
            ErrorKind::KeyGenerationFailed,
            ErrorKind::InvalidKey,
            ErrorKind::InternalError,
            ErrorKind::JobFailed,
        ] {
            let ext = sanitize(kind);
            assert_eq!(ext.status, 500);
            assert_eq!(ext.message, "An internal error occurred");
        }
    }

    #[test]
    fn test_sanitized_messages_contain_no_identifiers() {
        let device_id = Id::generate();
        let err = ProtectionError::DeviceNotFound { device_id };
        let ext = err.sanitize();
        assert!(!ext.message.contains(&device_id.to_string()));
        // Internal rendering keeps the id for logs.
        assert!(err.to_string().contains(&device_id.to_string()));
    }

    #[test]
    fn test_rate_limit_is_429() {
        assert_eq!(sanitize(ErrorKind::RateLimitExceeded).status, 429);
    }

    #[test]
    fn test_infra_errors_are_503() {
        for kind in [
            ErrorKind::StorageError,
            ErrorKind::DatabaseError,
            ErrorKind::ServiceUnavailable,
        ] {
            assert_eq!(sanitize(kind).status, 503);
        }
    }

    #[test]
    fn test_wrappers_preserve_reason_internally() {
        let err = ProtectionError::database("connection reset by peer");
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(err.sanitize().message, "Service temporarily unavailable");
    }
}
