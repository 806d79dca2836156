//! Repository ports over relational persistence.
//!
//! Absence is reported as `Ok(None)` (the not-found sentinel); `Err` is
//! reserved for transport failures so callers can always tell the two apart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::id::Id;
use crate::model::{
    AuditLogEntry, CekRecord, Device, EncryptedMaterial, EncryptionJob, License,
};

/// Device rows keyed by id with a (user, fingerprint) uniqueness constraint
/// among non-revoked rows.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Inserts a device. On a concurrent conflict over (user, fingerprint)
    /// the surviving row is returned, so racing registrations collapse.
    async fn insert(&self, device: Device) -> Result<Device>;

    /// Fetches a device by id.
    async fn get(&self, id: Id) -> Result<Option<Device>>;

    /// Looks up the device for (user, fingerprint), preferring a non-revoked
    /// row when both a revoked and an active one exist.
    async fn find_by_fingerprint(&self, user_id: Id, fingerprint: &str)
        -> Result<Option<Device>>;

    /// All non-revoked devices of a user.
    async fn list_active_for_user(&self, user_id: Id) -> Result<Vec<Device>>;

    /// Count of non-revoked devices of a user.
    async fn count_active_for_user(&self, user_id: Id) -> Result<usize>;

    /// Persists field updates (`last_used_at`, `revoked_at`).
    async fn update(&self, device: &Device) -> Result<()>;
}

/// License rows with the nonce compare-and-set used for serializable
/// validation.
#[async_trait]
pub trait LicenseRepository: Send + Sync {
    /// Inserts a license.
    async fn insert(&self, license: License) -> Result<()>;

    /// Fetches a license by id.
    async fn get(&self, id: Id) -> Result<Option<License>>;

    /// The active license for (user, material, device), if any.
    async fn find_active(
        &self,
        user_id: Id,
        material_id: Id,
        device_id: Id,
    ) -> Result<Option<License>>;

    /// All active licenses bound to a device.
    async fn list_active_by_device(&self, device_id: Id) -> Result<Vec<License>>;

    /// All active licenses for a material.
    async fn list_active_by_material(&self, material_id: Id) -> Result<Vec<License>>;

    /// Persists field updates (expiry, status, revocation, nonce).
    async fn update(&self, license: &License) -> Result<()>;

    /// Atomically rotates the nonce iff the stored nonce still equals
    /// `expected_nonce` and the license is active. Returns the updated row,
    /// or `None` when the compare-and-set lost.
    async fn rotate_nonce(
        &self,
        license_id: Id,
        expected_nonce: &str,
        new_nonce: &str,
        validated_at: DateTime<Utc>,
    ) -> Result<Option<License>>;
}

/// Wrapped-CEK rows with a (user, material, device) uniqueness constraint.
#[async_trait]
pub trait CekRepository: Send + Sync {
    /// Inserts a record. On a concurrent conflict over the composite key the
    /// surviving row is returned.
    async fn insert(&self, record: CekRecord) -> Result<CekRecord>;

    /// Fetches a record by id.
    async fn get(&self, id: Id) -> Result<Option<CekRecord>>;

    /// Looks up the record for (user, material, device).
    async fn find(&self, user_id: Id, material_id: Id, device_id: Id)
        -> Result<Option<CekRecord>>;

    /// All records wrapped under a given KEK version.
    async fn list_by_version(&self, key_version: u32) -> Result<Vec<CekRecord>>;

    /// Atomically replaces `(encrypted_key, key_version)` iff the row still
    /// carries `expected_version`. Returns false when the row changed or is
    /// gone.
    async fn update_wrapped(
        &self,
        id: Id,
        encrypted_key: Vec<u8>,
        key_version: u32,
        expected_version: u32,
    ) -> Result<bool>;

    /// Deletes all records bound to a device; returns how many went away.
    async fn delete_by_device(&self, device_id: Id) -> Result<u32>;
}

/// Encrypted-material rows, at most one per material.
#[async_trait]
pub trait EncryptedMaterialRepository: Send + Sync {
    /// Inserts a record.
    async fn insert(&self, material: EncryptedMaterial) -> Result<()>;

    /// Looks up the encrypted rendition of a material.
    async fn find_by_material(&self, material_id: Id) -> Result<Option<EncryptedMaterial>>;

    /// Deletes a record; returns whether it existed.
    async fn delete(&self, id: Id) -> Result<bool>;
}

/// Encryption-job rows. All status transitions are compare-and-set so only
/// one worker ever owns a job and terminal states stay sticky.
#[async_trait]
pub trait EncryptionJobRepository: Send + Sync {
    /// Inserts a job.
    async fn insert(&self, job: EncryptionJob) -> Result<()>;

    /// Fetches a job by id.
    async fn get(&self, id: Id) -> Result<Option<EncryptionJob>>;

    /// CAS pending → processing, stamping `started_at`. Returns the updated
    /// job, or `None` when the job was not pending.
    async fn start(&self, id: Id, now: DateTime<Utc>) -> Result<Option<EncryptionJob>>;

    /// CAS processing → completed, stamping `completed_at`.
    async fn complete(&self, id: Id, now: DateTime<Utc>) -> Result<bool>;

    /// CAS processing → failed with a terminal error message.
    async fn fail(&self, id: Id, error: &str, now: DateTime<Utc>) -> Result<bool>;

    /// CAS processing → pending with `retry_count` incremented. Returns the
    /// new count, or `None` when the job was not processing.
    async fn retry(&self, id: Id) -> Result<Option<u32>>;

    /// Deletes completed jobs finished before `cutoff`; returns the count.
    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u32>;
}

/// Append-only audit log.
#[async_trait]
pub trait AuditLogRepository: Send + Sync {
    /// Appends one entry.
    async fn append(&self, entry: AuditLogEntry) -> Result<()>;
}
