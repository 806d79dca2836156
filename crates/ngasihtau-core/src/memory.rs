//! In-memory repository implementations.
//!
//! These back the test suites and the baseline (single-process) wiring.
//! Compare-and-set operations take the map lock for the whole read-check-write
//! step, mirroring the single-statement CAS a relational backend performs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::audit::AuditFilter;
use crate::error::Result;
use crate::id::Id;
use crate::model::{
    AuditLogEntry, CekRecord, Device, EncryptedMaterial, EncryptionJob, JobStatus, License,
    LicenseStatus,
};
use crate::repo::{
    AuditLogRepository, CekRepository, DeviceRepository, EncryptedMaterialRepository,
    EncryptionJobRepository, LicenseRepository,
};

/// In-memory [`DeviceRepository`].
#[derive(Default)]
pub struct InMemoryDeviceRepo {
    devices: Mutex<HashMap<Id, Device>>,
}

impl InMemoryDeviceRepo {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows, revoked included.
    pub fn len(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    /// Returns true when no rows exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeviceRepository for InMemoryDeviceRepo {
    async fn insert(&self, device: Device) -> Result<Device> {
        let mut devices = self.devices.lock().unwrap();
        // Unique (user, fingerprint) among non-revoked rows: a racing insert
        // collapses onto the surviving row.
        if let Some(existing) = devices
            .values()
            .find(|d| {
                d.user_id == device.user_id
                    && d.fingerprint == device.fingerprint
                    && !d.is_revoked()
            })
            .cloned()
        {
            return Ok(existing);
        }
        devices.insert(device.id, device.clone());
        Ok(device)
    }

    async fn get(&self, id: Id) -> Result<Option<Device>> {
        Ok(self.devices.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_fingerprint(
        &self,
        user_id: Id,
        fingerprint: &str,
    ) -> Result<Option<Device>> {
        let devices = self.devices.lock().unwrap();
        let mut matches: Vec<&Device> = devices
            .values()
            .filter(|d| d.user_id == user_id && d.fingerprint == fingerprint)
            .collect();
        // Active row wins; among revoked rows the newest one represents the
        // fingerprint's last known state.
        matches.sort_by_key(|d| (d.is_revoked(), std::cmp::Reverse(d.created_at)));
        Ok(matches.first().map(|d| (*d).clone()))
    }

    async fn list_active_for_user(&self, user_id: Id) -> Result<Vec<Device>> {
        let mut found: Vec<Device> = self
            .devices
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.user_id == user_id && !d.is_revoked())
            .cloned()
            .collect();
        found.sort_by_key(|d| d.created_at);
        Ok(found)
    }

    async fn count_active_for_user(&self, user_id: Id) -> Result<usize> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.user_id == user_id && !d.is_revoked())
            .count())
    }

    async fn update(&self, device: &Device) -> Result<()> {
        self.devices
            .lock()
            .unwrap()
            .insert(device.id, device.clone());
        Ok(())
    }
}

/// In-memory [`LicenseRepository`].
#[derive(Default)]
pub struct InMemoryLicenseRepo {
    licenses: Mutex<HashMap<Id, License>>,
}

impl InMemoryLicenseRepo {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows, revoked included.
    pub fn len(&self) -> usize {
        self.licenses.lock().unwrap().len()
    }

    /// Returns true when no rows exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LicenseRepository for InMemoryLicenseRepo {
    async fn insert(&self, license: License) -> Result<()> {
        self.licenses.lock().unwrap().insert(license.id, license);
        Ok(())
    }

    async fn get(&self, id: Id) -> Result<Option<License>> {
        Ok(self.licenses.lock().unwrap().get(&id).cloned())
    }

    async fn find_active(
        &self,
        user_id: Id,
        material_id: Id,
        device_id: Id,
    ) -> Result<Option<License>> {
        Ok(self
            .licenses
            .lock()
            .unwrap()
            .values()
            .find(|l| {
                l.user_id == user_id
                    && l.material_id == material_id
                    && l.device_id == device_id
                    && l.status == LicenseStatus::Active
            })
            .cloned())
    }

    async fn list_active_by_device(&self, device_id: Id) -> Result<Vec<License>> {
        Ok(self
            .licenses
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.device_id == device_id && l.status == LicenseStatus::Active)
            .cloned()
            .collect())
    }

    async fn list_active_by_material(&self, material_id: Id) -> Result<Vec<License>> {
        Ok(self
            .licenses
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.material_id == material_id && l.status == LicenseStatus::Active)
            .cloned()
            .collect())
    }

    async fn update(&self, license: &License) -> Result<()> {
        self.licenses
            .lock()
            .unwrap()
            .insert(license.id, license.clone());
        Ok(())
    }

    async fn rotate_nonce(
        &self,
        license_id: Id,
        expected_nonce: &str,
        new_nonce: &str,
        validated_at: DateTime<Utc>,
    ) -> Result<Option<License>> {
        let mut licenses = self.licenses.lock().unwrap();
        match licenses.get_mut(&license_id) {
            Some(license)
                if license.status == LicenseStatus::Active && license.nonce == expected_nonce =>
            {
                license.nonce = new_nonce.to_string();
                license.last_validated_at = validated_at;
                Ok(Some(license.clone()))
            }
            _ => Ok(None),
        }
    }
}

/// In-memory [`CekRepository`].
#[derive(Default)]
pub struct InMemoryCekRepo {
    records: Mutex<HashMap<Id, CekRecord>>,
}

impl InMemoryCekRepo {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Returns true when no rows exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CekRepository for InMemoryCekRepo {
    async fn insert(&self, record: CekRecord) -> Result<CekRecord> {
        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records
            .values()
            .find(|r| {
                r.user_id == record.user_id
                    && r.material_id == record.material_id
                    && r.device_id == record.device_id
            })
            .cloned()
        {
            return Ok(existing);
        }
        records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Id) -> Result<Option<CekRecord>> {
        Ok(self.records.lock().unwrap().get(&id).cloned())
    }

    async fn find(
        &self,
        user_id: Id,
        material_id: Id,
        device_id: Id,
    ) -> Result<Option<CekRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .find(|r| {
                r.user_id == user_id && r.material_id == material_id && r.device_id == device_id
            })
            .cloned())
    }

    async fn list_by_version(&self, key_version: u32) -> Result<Vec<CekRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.key_version == key_version)
            .cloned()
            .collect())
    }

    async fn update_wrapped(
        &self,
        id: Id,
        encrypted_key: Vec<u8>,
        key_version: u32,
        expected_version: u32,
    ) -> Result<bool> {
        let mut records = self.records.lock().unwrap();
        match records.get_mut(&id) {
            Some(record) if record.key_version == expected_version => {
                record.encrypted_key = encrypted_key;
                record.key_version = key_version;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_by_device(&self, device_id: Id) -> Result<u32> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, r| r.device_id != device_id);
        Ok((before - records.len()) as u32)
    }
}

/// In-memory [`EncryptedMaterialRepository`].
#[derive(Default)]
pub struct InMemoryMaterialRepo {
    materials: Mutex<HashMap<Id, EncryptedMaterial>>,
    fail_inserts: Mutex<bool>,
}

impl InMemoryMaterialRepo {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows.
    pub fn len(&self) -> usize {
        self.materials.lock().unwrap().len()
    }

    /// Returns true when no rows exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes subsequent inserts fail with a database error. Used by tests to
    /// exercise partial-failure cleanup.
    pub fn fail_next_inserts(&self, fail: bool) {
        *self.fail_inserts.lock().unwrap() = fail;
    }
}

#[async_trait]
impl EncryptedMaterialRepository for InMemoryMaterialRepo {
    async fn insert(&self, material: EncryptedMaterial) -> Result<()> {
        if *self.fail_inserts.lock().unwrap() {
            return Err(crate::error::ProtectionError::database(
                "simulated insert failure",
            ));
        }
        self.materials
            .lock()
            .unwrap()
            .insert(material.id, material);
        Ok(())
    }

    async fn find_by_material(&self, material_id: Id) -> Result<Option<EncryptedMaterial>> {
        Ok(self
            .materials
            .lock()
            .unwrap()
            .values()
            .find(|m| m.material_id == material_id)
            .cloned())
    }

    async fn delete(&self, id: Id) -> Result<bool> {
        Ok(self.materials.lock().unwrap().remove(&id).is_some())
    }
}

/// In-memory [`EncryptionJobRepository`].
#[derive(Default)]
pub struct InMemoryJobRepo {
    jobs: Mutex<HashMap<Id, EncryptionJob>>,
}

impl InMemoryJobRepo {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows.
    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    /// Returns true when no rows exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EncryptionJobRepository for InMemoryJobRepo {
    async fn insert(&self, job: EncryptionJob) -> Result<()> {
        self.jobs.lock().unwrap().insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: Id) -> Result<Option<EncryptionJob>> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn start(&self, id: Id, now: DateTime<Utc>) -> Result<Option<EncryptionJob>> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Processing;
                job.started_at = Some(now);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete(&self, id: Id, now: DateTime<Utc>) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(&self, id: Id, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Failed;
                job.error = Some(error.to_string());
                job.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn retry(&self, id: Id) -> Result<Option<u32>> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = JobStatus::Pending;
                job.retry_count += 1;
                job.started_at = None;
                Ok(Some(job.retry_count))
            }
            _ => Ok(None),
        }
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u32> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, j| {
            !(j.status == JobStatus::Completed
                && j.completed_at.map(|t| t < cutoff).unwrap_or(false))
        });
        Ok((before - jobs.len()) as u32)
    }
}

/// In-memory append-only [`AuditLogRepository`].
#[derive(Default)]
pub struct InMemoryAuditRepo {
    entries: Mutex<Vec<AuditLogEntry>>,
}

impl InMemoryAuditRepo {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Returns true when nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries in append order.
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Entries matching a filter, in append order.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditLogRepository for InMemoryAuditRepo {
    async fn append(&self, entry: AuditLogEntry) -> Result<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}
