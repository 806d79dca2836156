//! Download coordination: device + license + rate-limit checks composed
//! into a manifest-plus-presigned-URL grant.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use ngasihtau_core::audit::{actions, AuditTrail, RequestContext};
use ngasihtau_core::blob::BlobStore;
use ngasihtau_core::config::Limits;
use ngasihtau_core::error::{ProtectionError, Result};
use ngasihtau_core::events::{subjects, EventPublisher};
use ngasihtau_core::id::Id;
use ngasihtau_core::kv::Kv;
use ngasihtau_core::model::DownloadManifest;
use ngasihtau_core::repo::EncryptedMaterialRepository;
use ngasihtau_guard::rate_limit::DownloadRateLimiter;

use crate::devices::DeviceRegistry;
use crate::licenses::LicenseEngine;

/// A granted download: the manifest plus a time-limited URL.
#[derive(Debug, Clone)]
pub struct DownloadGrant {
    /// Chunk manifest the client decrypts against.
    pub manifest: DownloadManifest,
    /// Presigned GET URL for the encrypted file.
    pub url: String,
    /// Hard expiry of the URL.
    pub expires_at: DateTime<Utc>,
}

/// Composes the download pipeline over the registry, license engine, rate
/// limiter, material records, and blob store.
pub struct DownloadCoordinator {
    registry: Arc<DeviceRegistry>,
    licenses: Arc<LicenseEngine>,
    materials: Arc<dyn EncryptedMaterialRepository>,
    blob: Arc<dyn BlobStore>,
    limiter: Arc<DownloadRateLimiter>,
    kv: Arc<dyn Kv>,
    events: Arc<dyn EventPublisher>,
    audit: Arc<AuditTrail>,
    limits: Limits,
}

impl DownloadCoordinator {
    /// Builds the coordinator over its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<DeviceRegistry>,
        licenses: Arc<LicenseEngine>,
        materials: Arc<dyn EncryptedMaterialRepository>,
        blob: Arc<dyn BlobStore>,
        limiter: Arc<DownloadRateLimiter>,
        kv: Arc<dyn Kv>,
        events: Arc<dyn EventPublisher>,
        audit: Arc<AuditTrail>,
        limits: Limits,
    ) -> Self {
        Self {
            registry,
            licenses,
            materials,
            blob,
            limiter,
            kv,
            events,
            audit,
            limits,
        }
    }

    /// Runs the full download pipeline and returns the grant.
    #[allow(clippy::too_many_arguments)]
    pub async fn prepare_download(
        &self,
        ctx: &RequestContext,
        user_id: Id,
        material_id: Id,
        device_id: Id,
        license_id: Id,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<DownloadGrant> {
        let outcome = self
            .prepare_inner(user_id, material_id, device_id, license_id, fingerprint, now)
            .await;
        self.audit
            .record(
                ctx,
                actions::MATERIAL_DOWNLOAD,
                "material",
                &material_id.to_string(),
                user_id,
                Some(device_id),
                outcome.is_ok(),
                outcome.as_ref().err().map(|e| e.code()),
            )
            .await;
        outcome
    }

    async fn prepare_inner(
        &self,
        user_id: Id,
        material_id: Id,
        device_id: Id,
        license_id: Id,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<DownloadGrant> {
        let device = self.registry.validate(user_id, fingerprint).await?;
        if device.id != device_id {
            return Err(ProtectionError::DeviceFingerprintMismatch { user_id });
        }

        // Nonce check is skipped on the download path: the manifest is used
        // separately from runtime decryption.
        let license = self
            .licenses
            .validate_for_download(license_id, device_id, fingerprint, now)
            .await?;
        if license.material_id != material_id || license.user_id != user_id {
            return Err(ProtectionError::InvalidRequest {
                reason: "license does not cover the requested material".to_string(),
            });
        }

        // Limiter infrastructure failures allow the download; an exhausted
        // quota rejects it.
        match self.limiter.download_check(user_id, material_id).await {
            Ok(check) if !check.allowed => {
                return Err(ProtectionError::RateLimitExceeded {
                    scope: "download".to_string(),
                });
            }
            Ok(_) => {}
            Err(err) => {
                warn!(%user_id, error = %err, "rate limiter unavailable, allowing download");
            }
        }

        let material = self
            .materials
            .find_by_material(material_id)
            .await?
            .ok_or(ProtectionError::MaterialNotFound { material_id })?;

        let url = self
            .blob
            .presign_get(&material.encrypted_file_key, self.limits.presigned_ttl)
            .await?;

        if let Err(err) = self
            .kv
            .incr(&format!("dl:count:material:{material_id}"), std::time::Duration::ZERO)
            .await
        {
            warn!(%material_id, error = %err, "download counter increment failed");
        }
        self.events
            .publish(
                subjects::MATERIAL_DOWNLOADED,
                json!({
                    "material_id": material_id,
                    "user_id": user_id,
                    "device_id": device_id,
                    "license_id": license_id,
                }),
            )
            .await;
        debug!(%material_id, %user_id, "download granted");

        Ok(DownloadGrant {
            manifest: material.manifest,
            url: url.url,
            expires_at: url.expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ngasihtau_core::access::StaticAccessChecker;
    use ngasihtau_core::blob::InMemoryBlobStore;
    use ngasihtau_core::config::ProtectionConfig;
    use ngasihtau_core::error::ErrorKind;
    use ngasihtau_core::events::InMemoryEventPublisher;
    use ngasihtau_core::kv::InMemoryKv;
    use ngasihtau_core::memory::{
        InMemoryAuditRepo, InMemoryCekRepo, InMemoryDeviceRepo, InMemoryLicenseRepo,
        InMemoryMaterialRepo,
    };
    use ngasihtau_core::model::{EncryptedChunk, EncryptedMaterial, License, Platform};
    use ngasihtau_crypto::keys::KeyManager;
    use ngasihtau_guard::blocklist::FailureTracker;
    use std::time::Duration;

    /// KV that always fails, for the fail-open contract.
    struct BrokenKv;

    #[async_trait]
    impl Kv for BrokenKv {
        async fn incr(&self, _key: &str, _ttl: Duration) -> Result<u64> {
            Err(ProtectionError::ServiceUnavailable {
                reason: "kv offline".to_string(),
            })
        }
        async fn get(&self, _key: &str) -> Result<Option<u64>> {
            Err(ProtectionError::ServiceUnavailable {
                reason: "kv offline".to_string(),
            })
        }
        async fn setnx(&self, _key: &str, _ttl: Duration) -> Result<bool> {
            Err(ProtectionError::ServiceUnavailable {
                reason: "kv offline".to_string(),
            })
        }
        async fn del(&self, _key: &str) -> Result<()> {
            Err(ProtectionError::ServiceUnavailable {
                reason: "kv offline".to_string(),
            })
        }
    }

    struct Fixture {
        coordinator: DownloadCoordinator,
        registry: Arc<DeviceRegistry>,
        engine: Arc<LicenseEngine>,
        materials: Arc<InMemoryMaterialRepo>,
        blob: Arc<InMemoryBlobStore>,
        events: Arc<InMemoryEventPublisher>,
    }

    fn fixture_with_kv(limiter_kv: Arc<dyn Kv>) -> Fixture {
        let config = ProtectionConfig::for_testing();
        let device_repo = Arc::new(InMemoryDeviceRepo::new());
        let license_repo = Arc::new(InMemoryLicenseRepo::new());
        let materials = Arc::new(InMemoryMaterialRepo::new());
        let blob = Arc::new(InMemoryBlobStore::new());
        let events = Arc::new(InMemoryEventPublisher::new());
        let audit = Arc::new(AuditTrail::new(Arc::new(InMemoryAuditRepo::new())));
        let tracker_kv = Arc::new(InMemoryKv::new());

        let engine = Arc::new(LicenseEngine::new(
            license_repo,
            device_repo.clone(),
            Arc::new(StaticAccessChecker::allow_all()),
            Arc::new(FailureTracker::new(tracker_kv.clone(), &config.limits)),
            events.clone(),
            audit.clone(),
            config.limits.clone(),
        ));
        let keys = Arc::new(KeyManager::new(
            &config,
            Arc::new(InMemoryCekRepo::new()),
            events.clone(),
            audit.clone(),
        ));
        let registry = Arc::new(DeviceRegistry::new(
            device_repo,
            engine.clone(),
            keys,
            events.clone(),
            audit.clone(),
            config.limits.clone(),
        ));
        let coordinator = DownloadCoordinator::new(
            registry.clone(),
            engine.clone(),
            materials.clone(),
            blob.clone(),
            Arc::new(DownloadRateLimiter::new(limiter_kv, &config.limits)),
            tracker_kv,
            events.clone(),
            audit,
            config.limits.clone(),
        );
        Fixture {
            coordinator,
            registry,
            engine,
            materials,
            blob,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_kv(Arc::new(InMemoryKv::new()))
    }

    const FP: &str = "fedcbafedcbafedcbafedcbafedcba98";

    async fn seed(f: &Fixture) -> (Id, Id, Id, License) {
        let ctx = RequestContext::system();
        let now = Utc::now();
        let user = Id::generate();
        let material = Id::generate();
        let device = f
            .registry
            .register(&ctx, user, FP, "reader", Platform::Desktop, now)
            .await
            .unwrap();
        let license = f
            .engine
            .issue(&ctx, user, material, device.id, FP, now)
            .await
            .unwrap();

        let file_key = format!("encrypted/{material}.bin");
        f.blob
            .put(&file_key, vec![0u8; 64], "application/octet-stream")
            .await
            .unwrap();
        f.materials
            .insert(EncryptedMaterial {
                id: Id::generate(),
                material_id: material,
                cek_id: Id::generate(),
                manifest: DownloadManifest {
                    material_id: material,
                    license_id: license.id,
                    total_size: 36,
                    original_hash: "aa".repeat(32),
                    encrypted_hash: "bb".repeat(32),
                    chunk_size: 1_048_576,
                    total_chunks: 1,
                    file_type: "pdf".to_string(),
                    chunks: vec![EncryptedChunk {
                        index: 0,
                        offset: 0,
                        size: 64,
                        iv: [0u8; 12],
                        auth_tag: [0u8; 16],
                    }],
                    created_at: now,
                },
                encrypted_file_key: file_key,
                created_at: now,
            })
            .await
            .unwrap();
        (user, material, device.id, license)
    }

    #[tokio::test]
    async fn test_grant_happy_path() {
        let f = fixture();
        let (user, material, device, license) = seed(&f).await;
        let now = Utc::now();

        let grant = f
            .coordinator
            .prepare_download(
                &RequestContext::system(),
                user,
                material,
                device,
                license.id,
                FP,
                now,
            )
            .await
            .unwrap();

        assert_eq!(grant.manifest.material_id, material);
        assert!(grant.url.contains("sig="));
        assert!(grant.expires_at > now);
        assert_eq!(f.events.count_of(subjects::MATERIAL_DOWNLOADED), 1);
    }

    #[tokio::test]
    async fn test_wrong_device_rejected() {
        let f = fixture();
        let (user, material, _device, license) = seed(&f).await;
        let err = f
            .coordinator
            .prepare_download(
                &RequestContext::system(),
                user,
                material,
                Id::generate(),
                license.id,
                FP,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceFingerprintMismatch);
    }

    #[tokio::test]
    async fn test_license_material_cross_check() {
        let f = fixture();
        let (user, _material, device, license) = seed(&f).await;
        let err = f
            .coordinator
            .prepare_download(
                &RequestContext::system(),
                user,
                Id::generate(),
                device,
                license.id,
                FP,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion_rejects() {
        let f = fixture();
        let (user, material, device, license) = seed(&f).await;
        let ctx = RequestContext::system();
        let now = Utc::now();

        for _ in 0..10 {
            f.coordinator
                .prepare_download(&ctx, user, material, device, license.id, FP, now)
                .await
                .unwrap();
        }
        let err = f
            .coordinator
            .prepare_download(&ctx, user, material, device, license.id, FP, now)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
    }

    #[tokio::test]
    async fn test_limiter_outage_fails_open() {
        let f = fixture_with_kv(Arc::new(BrokenKv));
        let (user, material, device, license) = seed(&f).await;
        let grant = f
            .coordinator
            .prepare_download(
                &RequestContext::system(),
                user,
                material,
                device,
                license.id,
                FP,
                Utc::now(),
            )
            .await;
        assert!(grant.is_ok());
    }

    #[tokio::test]
    async fn test_missing_encrypted_material() {
        let f = fixture();
        let (user, material, device, license) = seed(&f).await;
        // Remove the encrypted rendition: download must report it pending.
        let record = f.materials.find_by_material(material).await.unwrap().unwrap();
        f.materials.delete(record.id).await.unwrap();

        let err = f
            .coordinator
            .prepare_download(
                &RequestContext::system(),
                user,
                material,
                device,
                license.id,
                FP,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MaterialNotFound);
        assert_eq!(
            err.sanitize().message,
            "Material is not available for download yet"
        );
    }

    #[tokio::test]
    async fn test_revoked_license_rejected() {
        let f = fixture();
        let (user, material, device, license) = seed(&f).await;
        let ctx = RequestContext::system();
        let now = Utc::now();
        f.engine.revoke(&ctx, license.id, now).await.unwrap();

        let err = f
            .coordinator
            .prepare_download(&ctx, user, material, device, license.id, FP, now)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LicenseRevoked);
    }
}
