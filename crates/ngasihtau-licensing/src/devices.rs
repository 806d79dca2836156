//! Device registry: fingerprint-bound registration with a per-user cap, and
//! deregistration that cascades into licenses and CEKs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use ngasihtau_core::audit::{actions, AuditTrail, RequestContext};
use ngasihtau_core::config::Limits;
use ngasihtau_core::error::{ProtectionError, Result};
use ngasihtau_core::events::{subjects, EventPublisher};
use ngasihtau_core::id::Id;
use ngasihtau_core::model::{Device, Platform};
use ngasihtau_core::repo::DeviceRepository;
use ngasihtau_crypto::keys::KeyManager;
use ngasihtau_guard::sanitize::sanitize_input;

use crate::licenses::LicenseEngine;

const FINGERPRINT_MIN: usize = 32;
const FINGERPRINT_MAX: usize = 512;
const NAME_MAX: usize = 255;

/// Looks up the active device for (user, fingerprint).
///
/// A miss is the opaque fingerprint mismatch; a revoked hit surfaces as
/// device-not-found. Both sanitize to the same external message, which keeps
/// registered devices non-enumerable.
pub(crate) async fn lookup_active_device(
    repo: &dyn DeviceRepository,
    user_id: Id,
    fingerprint: &str,
) -> Result<Device> {
    match repo.find_by_fingerprint(user_id, fingerprint).await? {
        None => Err(ProtectionError::DeviceFingerprintMismatch { user_id }),
        Some(device) if device.is_revoked() => Err(ProtectionError::DeviceNotFound {
            device_id: device.id,
        }),
        Some(device) => Ok(device),
    }
}

/// Registers, validates, lists, and deregisters devices.
pub struct DeviceRegistry {
    devices: Arc<dyn DeviceRepository>,
    licenses: Arc<LicenseEngine>,
    keys: Arc<KeyManager>,
    events: Arc<dyn EventPublisher>,
    audit: Arc<AuditTrail>,
    limits: Limits,
}

impl DeviceRegistry {
    /// Builds the registry over its ports and cascade collaborators.
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        licenses: Arc<LicenseEngine>,
        keys: Arc<KeyManager>,
        events: Arc<dyn EventPublisher>,
        audit: Arc<AuditTrail>,
        limits: Limits,
    ) -> Self {
        Self {
            devices,
            licenses,
            keys,
            events,
            audit,
            limits,
        }
    }

    /// Registers a device for a user. Re-registering an active fingerprint
    /// is idempotent and only bumps `last_used_at`; a user at the device cap
    /// is refused.
    pub async fn register(
        &self,
        ctx: &RequestContext,
        user_id: Id,
        fingerprint: &str,
        name: &str,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> Result<Device> {
        let outcome = self
            .register_inner(user_id, fingerprint, name, platform, now)
            .await;
        self.audit
            .record(
                ctx,
                actions::DEVICE_REGISTER,
                "device",
                &outcome
                    .as_ref()
                    .map(|d| d.id.to_string())
                    .unwrap_or_default(),
                user_id,
                outcome.as_ref().map(|d| d.id).ok(),
                outcome.is_ok(),
                outcome.as_ref().err().map(|e| e.code()),
            )
            .await;
        outcome
    }

    async fn register_inner(
        &self,
        user_id: Id,
        fingerprint: &str,
        name: &str,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> Result<Device> {
        let fingerprint = sanitize_input(fingerprint);
        let name = sanitize_input(name);
        if fingerprint.len() < FINGERPRINT_MIN || fingerprint.len() > FINGERPRINT_MAX {
            return Err(ProtectionError::InvalidRequest {
                reason: format!(
                    "fingerprint length {} outside {FINGERPRINT_MIN}..={FINGERPRINT_MAX}",
                    fingerprint.len()
                ),
            });
        }
        if fingerprint.chars().any(char::is_control) {
            return Err(ProtectionError::InvalidRequest {
                reason: "fingerprint must be printable".to_string(),
            });
        }
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(ProtectionError::InvalidRequest {
                reason: "device name must be 1..=255 characters".to_string(),
            });
        }

        if let Some(mut existing) = self
            .devices
            .find_by_fingerprint(user_id, &fingerprint)
            .await?
            .filter(|d| !d.is_revoked())
        {
            existing.last_used_at = now;
            self.devices.update(&existing).await?;
            return Ok(existing);
        }

        let active = self.devices.count_active_for_user(user_id).await?;
        if active >= self.limits.max_devices_per_user {
            return Err(ProtectionError::DeviceLimitExceeded { user_id, active });
        }

        let device = Device {
            id: Id::generate(),
            user_id,
            fingerprint,
            name,
            platform,
            created_at: now,
            last_used_at: now,
            revoked_at: None,
        };
        // Concurrent registrations of the same fingerprint collapse here.
        let stored = self.devices.insert(device).await?;

        info!(device_id = %stored.id, %user_id, %platform, "device registered");
        self.events
            .publish(
                subjects::DEVICE_REGISTERED,
                json!({
                    "device_id": stored.id,
                    "user_id": user_id,
                    "platform": stored.platform,
                }),
            )
            .await;
        Ok(stored)
    }

    /// Resolves the active device for (user, fingerprint).
    pub async fn validate(&self, user_id: Id, fingerprint: &str) -> Result<Device> {
        lookup_active_device(self.devices.as_ref(), user_id, fingerprint).await
    }

    /// All active devices of a user.
    pub async fn list(&self, user_id: Id) -> Result<Vec<Device>> {
        self.devices.list_active_for_user(user_id).await
    }

    /// Revokes a device the user owns, then cascades: licenses on the device
    /// are revoked and its CEKs deleted. Cascade failures are logged and do
    /// not undo the device revocation. Idempotent for already-revoked rows.
    pub async fn deregister(
        &self,
        ctx: &RequestContext,
        user_id: Id,
        device_id: Id,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let outcome = self.deregister_inner(user_id, device_id, now).await;
        self.audit
            .record(
                ctx,
                actions::DEVICE_DEREGISTER,
                "device",
                &device_id.to_string(),
                user_id,
                Some(device_id),
                outcome.is_ok(),
                outcome.as_ref().err().map(|e| e.code()),
            )
            .await;
        outcome
    }

    async fn deregister_inner(
        &self,
        user_id: Id,
        device_id: Id,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut device = self
            .devices
            .get(device_id)
            .await?
            .ok_or(ProtectionError::DeviceNotFound { device_id })?;
        // Ownership failures get the same opaque surface as a missing row.
        if device.user_id != user_id {
            return Err(ProtectionError::DeviceNotFound { device_id });
        }
        if device.is_revoked() {
            return Ok(());
        }

        device.revoked_at = Some(now);
        self.devices.update(&device).await?;
        info!(%device_id, %user_id, "device revoked");

        if let Err(err) = self.licenses.revoke_by_device(device_id, now).await {
            warn!(%device_id, error = %err, "license cascade failed during deregistration");
        }
        if let Err(err) = self.keys.delete_for_device(device_id).await {
            warn!(%device_id, error = %err, "CEK cascade failed during deregistration");
        }

        self.events
            .publish(
                subjects::DEVICE_DEREGISTERED,
                json!({ "device_id": device_id, "user_id": user_id }),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ngasihtau_core::access::StaticAccessChecker;
    use ngasihtau_core::config::ProtectionConfig;
    use ngasihtau_core::error::ErrorKind;
    use ngasihtau_core::events::InMemoryEventPublisher;
    use ngasihtau_core::kv::InMemoryKv;
    use ngasihtau_core::memory::{
        InMemoryAuditRepo, InMemoryCekRepo, InMemoryDeviceRepo, InMemoryLicenseRepo,
    };
    use ngasihtau_core::repo::LicenseRepository;
    use ngasihtau_guard::blocklist::FailureTracker;

    struct Fixture {
        registry: DeviceRegistry,
        engine: Arc<LicenseEngine>,
        keys: Arc<KeyManager>,
        device_repo: Arc<InMemoryDeviceRepo>,
        license_repo: Arc<InMemoryLicenseRepo>,
        cek_repo: Arc<InMemoryCekRepo>,
        events: Arc<InMemoryEventPublisher>,
        audit_repo: Arc<InMemoryAuditRepo>,
    }

    fn fixture() -> Fixture {
        let config = ProtectionConfig::for_testing();
        let device_repo = Arc::new(InMemoryDeviceRepo::new());
        let license_repo = Arc::new(InMemoryLicenseRepo::new());
        let cek_repo = Arc::new(InMemoryCekRepo::new());
        let events = Arc::new(InMemoryEventPublisher::new());
        let audit_repo = Arc::new(InMemoryAuditRepo::new());
        let audit = Arc::new(AuditTrail::new(audit_repo.clone()));
        let kv = Arc::new(InMemoryKv::new());

        let engine = Arc::new(LicenseEngine::new(
            license_repo.clone(),
            device_repo.clone(),
            Arc::new(StaticAccessChecker::allow_all()),
            Arc::new(FailureTracker::new(kv, &config.limits)),
            events.clone(),
            audit.clone(),
            config.limits.clone(),
        ));
        let keys = Arc::new(KeyManager::new(
            &config,
            cek_repo.clone(),
            events.clone(),
            audit.clone(),
        ));
        let registry = DeviceRegistry::new(
            device_repo.clone(),
            engine.clone(),
            keys.clone(),
            events.clone(),
            audit,
            config.limits.clone(),
        );
        Fixture {
            registry,
            engine,
            keys,
            device_repo,
            license_repo,
            cek_repo,
            events,
            audit_repo,
        }
    }

    fn fp(tag: u8) -> String {
        format!("{:02x}", tag).repeat(16)
    }

    #[tokio::test]
    async fn test_register_creates_device() {
        let f = fixture();
        let user = Id::generate();
        let device = f
            .registry
            .register(
                &RequestContext::system(),
                user,
                &fp(1),
                "Pixel 9",
                Platform::Android,
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(device.user_id, user);
        assert_eq!(device.name, "Pixel 9");
        assert!(!device.is_revoked());
        assert_eq!(f.events.count_of(subjects::DEVICE_REGISTERED), 1);
        assert_eq!(f.audit_repo.len(), 1);
    }

    #[tokio::test]
    async fn test_register_same_fingerprint_is_idempotent() {
        let f = fixture();
        let user = Id::generate();
        let ctx = RequestContext::system();
        let t0 = Utc::now();
        let first = f
            .registry
            .register(&ctx, user, &fp(1), "Pixel 9", Platform::Android, t0)
            .await
            .unwrap();
        let t1 = t0 + chrono::Duration::hours(1);
        let second = f
            .registry
            .register(&ctx, user, &fp(1), "Pixel 9", Platform::Android, t1)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.last_used_at, t1);
        assert_eq!(f.device_repo.len(), 1);
        // No second registration event for the idempotent path.
        assert_eq!(f.events.count_of(subjects::DEVICE_REGISTERED), 1);
    }

    #[tokio::test]
    async fn test_sixth_device_exceeds_cap() {
        let f = fixture();
        let user = Id::generate();
        let ctx = RequestContext::system();
        for i in 0..5 {
            f.registry
                .register(&ctx, user, &fp(i), "reader", Platform::Desktop, Utc::now())
                .await
                .unwrap();
        }
        let err = f
            .registry
            .register(&ctx, user, &fp(9), "reader", Platform::Desktop, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceLimitExceeded);
    }

    #[tokio::test]
    async fn test_cap_is_per_user() {
        let f = fixture();
        let ctx = RequestContext::system();
        let crowded = Id::generate();
        for i in 0..5 {
            f.registry
                .register(&ctx, crowded, &fp(i), "reader", Platform::Ios, Utc::now())
                .await
                .unwrap();
        }
        f.registry
            .register(&ctx, Id::generate(), &fp(1), "reader", Platform::Ios, Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_rejects_bad_inputs() {
        let f = fixture();
        let ctx = RequestContext::system();
        let user = Id::generate();

        // Too-short fingerprint.
        let err = f
            .registry
            .register(&ctx, user, "short", "name", Platform::Ios, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        // Control characters are stripped before the length check.
        let padded = format!("{}{}", "\x00".repeat(40), "ab");
        assert!(f
            .registry
            .register(&ctx, user, &padded, "name", Platform::Ios, Utc::now())
            .await
            .is_err());

        // Embedded newline survives sanitation but is not printable.
        let with_newline = format!("{}\n{}", "a".repeat(20), "a".repeat(20));
        assert!(f
            .registry
            .register(&ctx, user, &with_newline, "name", Platform::Ios, Utc::now())
            .await
            .is_err());

        // Empty name.
        assert!(f
            .registry
            .register(&ctx, user, &fp(1), "  ", Platform::Ios, Utc::now())
            .await
            .is_err());

        // Oversized name.
        let long_name = "n".repeat(256);
        assert!(f
            .registry
            .register(&ctx, user, &fp(1), &long_name, Platform::Ios, Utc::now())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_validate_surfaces() {
        let f = fixture();
        let user = Id::generate();
        let ctx = RequestContext::system();
        let device = f
            .registry
            .register(&ctx, user, &fp(1), "reader", Platform::Ios, Utc::now())
            .await
            .unwrap();

        assert_eq!(f.registry.validate(user, &fp(1)).await.unwrap().id, device.id);

        // Unknown fingerprint: mismatch.
        let err = f.registry.validate(user, &fp(2)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceFingerprintMismatch);

        // Revoked device: not-found surface (externally identical to the
        // mismatch above, so devices stay non-enumerable).
        f.registry
            .deregister(&ctx, user, device.id, Utc::now())
            .await
            .unwrap();
        let err = f.registry.validate(user, &fp(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
        assert_eq!(err.sanitize().message, "Device verification failed");
    }

    #[tokio::test]
    async fn test_deregister_cascades_licenses_and_ceks() {
        let f = fixture();
        let user = Id::generate();
        let ctx = RequestContext::system();
        let now = Utc::now();
        let device = f
            .registry
            .register(&ctx, user, &fp(1), "reader", Platform::Android, now)
            .await
            .unwrap();

        for _ in 0..3 {
            let material = Id::generate();
            f.engine
                .issue(&ctx, user, material, device.id, &fp(1), now)
                .await
                .unwrap();
            f.keys
                .get_or_create_cek(&ctx, user, material, device.id)
                .await
                .unwrap();
        }
        assert_eq!(f.cek_repo.len(), 3);

        f.registry
            .deregister(&ctx, user, device.id, now)
            .await
            .unwrap();

        // Every license on the device is revoked and its CEKs are gone.
        assert!(f
            .license_repo
            .list_active_by_device(device.id)
            .await
            .unwrap()
            .is_empty());
        assert!(f.cek_repo.is_empty());
        assert_eq!(f.events.count_of(subjects::DEVICE_DEREGISTERED), 1);

        // A fresh license request for the revoked device now fails.
        let err = f
            .engine
            .issue(&ctx, user, Id::generate(), device.id, &fp(1), now)
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::DeviceFingerprintMismatch | ErrorKind::DeviceNotFound
        ));
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent() {
        let f = fixture();
        let user = Id::generate();
        let ctx = RequestContext::system();
        let device = f
            .registry
            .register(&ctx, user, &fp(1), "reader", Platform::Ios, Utc::now())
            .await
            .unwrap();
        f.registry
            .deregister(&ctx, user, device.id, Utc::now())
            .await
            .unwrap();
        f.registry
            .deregister(&ctx, user, device.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(f.events.count_of(subjects::DEVICE_DEREGISTERED), 1);
    }

    #[tokio::test]
    async fn test_deregister_requires_ownership() {
        let f = fixture();
        let ctx = RequestContext::system();
        let owner = Id::generate();
        let device = f
            .registry
            .register(&ctx, owner, &fp(1), "reader", Platform::Ios, Utc::now())
            .await
            .unwrap();

        let err = f
            .registry
            .deregister(&ctx, Id::generate(), device.id, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
        assert!(f.registry.validate(owner, &fp(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_revoked_fingerprint_can_reregister() {
        let f = fixture();
        let user = Id::generate();
        let ctx = RequestContext::system();
        let first = f
            .registry
            .register(&ctx, user, &fp(1), "reader", Platform::Ios, Utc::now())
            .await
            .unwrap();
        f.registry
            .deregister(&ctx, user, first.id, Utc::now())
            .await
            .unwrap();

        let second = f
            .registry
            .register(&ctx, user, &fp(1), "reader", Platform::Ios, Utc::now())
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(f.registry.list(user).await.unwrap().len(), 1);
    }
}
