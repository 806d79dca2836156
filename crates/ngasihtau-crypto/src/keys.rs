//! CEK lifecycle: deterministic derivation, at-rest wrapping under versioned
//! KEKs, per-device transport wrapping, and key rotation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use aes_gcm::aead::generic_array::typenum::U12;
use aes_gcm::aead::Aead;
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, KeyInit, Nonce};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use ngasihtau_core::audit::{actions, AuditTrail, RequestContext};
use ngasihtau_core::config::{ProtectionConfig, SecretBytes};
use ngasihtau_core::error::{ProtectionError, Result};
use ngasihtau_core::events::{subjects, EventPublisher};
use ngasihtau_core::id::Id;
use ngasihtau_core::model::CekRecord;
use ngasihtau_core::repo::CekRepository;

use crate::primitives::{gcm_open, gcm_seal, hkdf_derive_key, random_nonce, CekKey};

/// Domain-separation prefix for CEK derivation.
const CEK_INFO: &[u8] = b"ngasihtau-cek-v1";
/// Domain-separation prefix for device transport keys.
const TRANSPORT_INFO: &[u8] = b"ngasihtau-transport-v1";

/// Minimum wrapped-key length: nonce(12) + tag(16).
const MIN_WRAPPED_LEN: usize = 12 + 16;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Outcome of a [`KeyManager::rotate_keys`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationReport {
    /// Records rewrapped under the new KEK.
    pub rotated: u32,
    /// Records skipped because unwrap or the update failed.
    pub skipped: u32,
}

/// Owns CEK bytes in memory: derives, wraps, unwraps, and rotates them.
/// Plaintext CEKs never reach persistence or logs.
pub struct KeyManager {
    master_secret: SecretBytes,
    keks: RwLock<HashMap<u32, SecretBytes>>,
    current_version: AtomicU32,
    repo: Arc<dyn CekRepository>,
    events: Arc<dyn EventPublisher>,
    audit: Arc<AuditTrail>,
}

impl KeyManager {
    /// Builds a manager from the process config and the CEK repository.
    pub fn new(
        config: &ProtectionConfig,
        repo: Arc<dyn CekRepository>,
        events: Arc<dyn EventPublisher>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        let mut keks = HashMap::new();
        keks.insert(config.current_key_version, config.kek.clone());
        Self {
            master_secret: config.master_secret.clone(),
            keks: RwLock::new(keks),
            current_version: AtomicU32::new(config.current_key_version),
            repo,
            events,
            audit,
        }
    }

    /// The KEK version new wraps are performed under.
    pub fn current_version(&self) -> u32 {
        self.current_version.load(Ordering::SeqCst)
    }

    /// Deterministically derives the CEK for (user, material, device) from
    /// the master secret. Same inputs always yield the same key.
    pub fn derive_cek(&self, user_id: Id, material_id: Id, device_id: Id) -> Result<CekKey> {
        let mut info = Vec::with_capacity(CEK_INFO.len() + 48);
        info.extend_from_slice(CEK_INFO);
        info.extend_from_slice(user_id.as_bytes());
        info.extend_from_slice(material_id.as_bytes());
        info.extend_from_slice(device_id.as_bytes());
        hkdf_derive_key(self.master_secret.as_bytes(), &info)
    }

    /// Returns the stored CEK record for the triple, creating (derive, wrap,
    /// persist) it when absent. Emits `key.retrieved` / `key.generated` and
    /// audits both outcomes.
    pub async fn get_or_create_cek(
        &self,
        ctx: &RequestContext,
        user_id: Id,
        material_id: Id,
        device_id: Id,
    ) -> Result<CekRecord> {
        if let Some(existing) = self.repo.find(user_id, material_id, device_id).await? {
            self.events
                .publish(
                    subjects::KEY_RETRIEVED,
                    json!({
                        "cek_id": existing.id,
                        "user_id": user_id,
                        "material_id": material_id,
                        "device_id": device_id,
                    }),
                )
                .await;
            self.audit
                .record(
                    ctx,
                    actions::KEY_RETRIEVE,
                    "cek",
                    &existing.id.to_string(),
                    user_id,
                    Some(device_id),
                    true,
                    None,
                )
                .await;
            return Ok(existing);
        }

        let cek = self.derive_cek(user_id, material_id, device_id)?;
        let version = self.current_version();
        let encrypted_key = self.wrap_cek(&cek, version)?;
        let record = CekRecord {
            id: Id::generate(),
            user_id,
            material_id,
            device_id,
            encrypted_key,
            key_version: version,
            created_at: Utc::now(),
        };
        // A racing creation collapses onto the surviving row.
        let stored = self.repo.insert(record).await?;

        debug!(cek_id = %stored.id, key_version = version, "generated CEK");
        self.events
            .publish(
                subjects::KEY_GENERATED,
                json!({
                    "cek_id": stored.id,
                    "user_id": user_id,
                    "material_id": material_id,
                    "device_id": device_id,
                    "key_version": stored.key_version,
                }),
            )
            .await;
        self.audit
            .record(
                ctx,
                actions::KEY_GENERATE,
                "cek",
                &stored.id.to_string(),
                user_id,
                Some(device_id),
                true,
                None,
            )
            .await;
        Ok(stored)
    }

    /// Unwraps a stored record to its 32 plaintext key bytes using the KEK
    /// of the record's version.
    pub fn unwrap_cek(&self, record: &CekRecord) -> Result<CekKey> {
        let kek = self
            .keks
            .read()
            .unwrap()
            .get(&record.key_version)
            .cloned()
            .ok_or(ProtectionError::InvalidKey)?;
        if record.encrypted_key.len() < MIN_WRAPPED_LEN {
            return Err(ProtectionError::InvalidKey);
        }
        let (nonce, body) = record.encrypted_key.split_at(12);
        let nonce: [u8; 12] = nonce.try_into().map_err(|_| ProtectionError::InvalidKey)?;
        let plaintext =
            kek_open(kek.as_bytes(), &nonce, body).map_err(|_| ProtectionError::InvalidKey)?;
        let bytes: [u8; 32] = plaintext
            .try_into()
            .map_err(|_| ProtectionError::InvalidKey)?;
        Ok(CekKey::from_bytes(bytes))
    }

    /// Wraps a CEK for delivery to one device: AES-256-GCM under an
    /// HKDF-derived device transport key, output `nonce ‖ ciphertext ‖ tag`.
    pub fn wrap_for_transport(&self, cek: &CekKey, device_id: Id) -> Result<Vec<u8>> {
        let transport_key = self.transport_key(device_id)?;
        let nonce = random_nonce();
        let sealed = gcm_seal(&transport_key, &nonce, cek.as_bytes())?;
        let mut out = Vec::with_capacity(12 + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Inverse of [`Self::wrap_for_transport`]. Exists for tests and client
    /// parity checks; production endpoints only emit wrapped keys.
    pub fn unwrap_from_transport(&self, wrapped: &[u8], device_id: Id) -> Result<CekKey> {
        if wrapped.len() < MIN_WRAPPED_LEN {
            return Err(ProtectionError::DecryptionFailed);
        }
        let transport_key = self.transport_key(device_id)?;
        let (nonce, body) = wrapped.split_at(12);
        let nonce: [u8; 12] = nonce
            .try_into()
            .map_err(|_| ProtectionError::DecryptionFailed)?;
        let plaintext = gcm_open(&transport_key, &nonce, body)?;
        let bytes: [u8; 32] = plaintext
            .try_into()
            .map_err(|_| ProtectionError::DecryptionFailed)?;
        Ok(CekKey::from_bytes(bytes))
    }

    /// Rewraps every CEK stored under `from_version` with `new_kek` as
    /// `to_version`. Per-record failures are logged and skipped; the pass
    /// itself succeeds. Plaintext CEK bytes are unchanged by rotation.
    pub async fn rotate_keys(
        &self,
        from_version: u32,
        to_version: u32,
        new_kek: SecretBytes,
    ) -> Result<RotationReport> {
        if !matches!(new_kek.len(), 16 | 24 | 32) {
            return Err(ProtectionError::InvalidKey);
        }
        if from_version == to_version {
            return Err(ProtectionError::InvalidRequest {
                reason: "rotation requires distinct key versions".to_string(),
            });
        }

        self.keks
            .write()
            .unwrap()
            .insert(to_version, new_kek.clone());
        self.current_version.store(to_version, Ordering::SeqCst);

        let records = self.repo.list_by_version(from_version).await?;
        let mut report = RotationReport::default();
        for record in records {
            let rewrapped = self.unwrap_cek(&record).and_then(|cek| {
                let nonce = random_nonce();
                let sealed = kek_seal(new_kek.as_bytes(), &nonce, cek.as_bytes())?;
                let mut out = Vec::with_capacity(12 + sealed.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&sealed);
                Ok(out)
            });
            match rewrapped {
                Ok(encrypted_key) => {
                    let updated = self
                        .repo
                        .update_wrapped(record.id, encrypted_key, to_version, from_version)
                        .await?;
                    if updated {
                        report.rotated += 1;
                    } else {
                        warn!(cek_id = %record.id, "rotation lost the version CAS, skipping");
                        report.skipped += 1;
                    }
                }
                Err(err) => {
                    warn!(cek_id = %record.id, error = %err, "rotation skipping record");
                    report.skipped += 1;
                }
            }
        }

        info!(
            from_version,
            to_version,
            rotated = report.rotated,
            skipped = report.skipped,
            "key rotation pass finished"
        );
        Ok(report)
    }

    /// Removes all CEK records bound to a device. Returns how many were
    /// deleted.
    pub async fn delete_for_device(&self, device_id: Id) -> Result<u32> {
        let deleted = self.repo.delete_by_device(device_id).await?;
        debug!(%device_id, deleted, "deleted CEKs for device");
        Ok(deleted)
    }

    fn transport_key(&self, device_id: Id) -> Result<CekKey> {
        let mut info = Vec::with_capacity(TRANSPORT_INFO.len() + 16);
        info.extend_from_slice(TRANSPORT_INFO);
        info.extend_from_slice(device_id.as_bytes());
        hkdf_derive_key(self.master_secret.as_bytes(), &info)
    }

    fn wrap_cek(&self, cek: &CekKey, version: u32) -> Result<Vec<u8>> {
        let kek = self
            .keks
            .read()
            .unwrap()
            .get(&version)
            .cloned()
            .ok_or(ProtectionError::InvalidKey)?;
        let nonce = random_nonce();
        let sealed = kek_seal(kek.as_bytes(), &nonce, cek.as_bytes())?;
        let mut out = Vec::with_capacity(12 + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}

/// GCM seal under a 16-, 24-, or 32-byte KEK.
fn kek_seal(kek: &[u8], nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>> {
    let n = Nonce::from_slice(nonce);
    let sealed = match kek.len() {
        16 => Aes128Gcm::new_from_slice(kek)
            .map_err(|_| ProtectionError::InvalidKey)?
            .encrypt(n, plaintext),
        24 => Aes192Gcm::new_from_slice(kek)
            .map_err(|_| ProtectionError::InvalidKey)?
            .encrypt(n, plaintext),
        32 => Aes256Gcm::new_from_slice(kek)
            .map_err(|_| ProtectionError::InvalidKey)?
            .encrypt(n, plaintext),
        _ => return Err(ProtectionError::InvalidKey),
    };
    sealed.map_err(|e| ProtectionError::EncryptionFailed {
        reason: e.to_string(),
    })
}

/// GCM open under a 16-, 24-, or 32-byte KEK.
fn kek_open(kek: &[u8], nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let n = Nonce::from_slice(nonce);
    let opened = match kek.len() {
        16 => Aes128Gcm::new_from_slice(kek)
            .map_err(|_| ProtectionError::InvalidKey)?
            .decrypt(n, ciphertext),
        24 => Aes192Gcm::new_from_slice(kek)
            .map_err(|_| ProtectionError::InvalidKey)?
            .decrypt(n, ciphertext),
        32 => Aes256Gcm::new_from_slice(kek)
            .map_err(|_| ProtectionError::InvalidKey)?
            .decrypt(n, ciphertext),
        _ => return Err(ProtectionError::InvalidKey),
    };
    opened.map_err(|_| ProtectionError::InvalidKey)
}
