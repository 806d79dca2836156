//! License lifecycle: issuance, nonce-rotating validation, renewal, and
//! single or cascading revocation.
//!
//! State machine per license:
//!
//! ```text
//!         issue                 validate (nonce match, fresh, active)
//!  ─────────────► ACTIVE ─────────────────────────► ACTIVE (nonce rotated)
//!                   │  renew / revoke variants
//!                   ├────────► ACTIVE (later expiry, nonce rotated)
//!                   └────────► REVOKED (terminal)
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde_json::json;
use tracing::{debug, info, warn};

use ngasihtau_core::access::MaterialAccessChecker;
use ngasihtau_core::audit::{actions, AuditTrail, RequestContext};
use ngasihtau_core::config::{chrono_duration, Limits};
use ngasihtau_core::error::{ErrorKind, ProtectionError, Result};
use ngasihtau_core::events::{subjects, EventPublisher};
use ngasihtau_core::id::Id;
use ngasihtau_core::model::{Device, License, LicenseStatus};
use ngasihtau_core::repo::{DeviceRepository, LicenseRepository};
use ngasihtau_crypto::primitives::ct_eq;
use ngasihtau_guard::blocklist::FailureTracker;

use crate::devices::lookup_active_device;

/// Issues, validates, renews, and revokes licenses. Owns the License
/// lifecycle; nothing else mutates license rows.
pub struct LicenseEngine {
    licenses: Arc<dyn LicenseRepository>,
    devices: Arc<dyn DeviceRepository>,
    access: Arc<dyn MaterialAccessChecker>,
    failures: Arc<FailureTracker>,
    events: Arc<dyn EventPublisher>,
    audit: Arc<AuditTrail>,
    limits: Limits,
}

impl LicenseEngine {
    /// Builds the engine over its ports.
    pub fn new(
        licenses: Arc<dyn LicenseRepository>,
        devices: Arc<dyn DeviceRepository>,
        access: Arc<dyn MaterialAccessChecker>,
        failures: Arc<FailureTracker>,
        events: Arc<dyn EventPublisher>,
        audit: Arc<AuditTrail>,
        limits: Limits,
    ) -> Self {
        Self {
            licenses,
            devices,
            access,
            failures,
            events,
            audit,
            limits,
        }
    }

    /// Issues a license for (user, material, device), returning the existing
    /// active license when one is still fresh.
    pub async fn issue(
        &self,
        ctx: &RequestContext,
        user_id: Id,
        material_id: Id,
        device_id: Id,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<License> {
        let outcome = self
            .issue_inner(user_id, material_id, device_id, fingerprint, now)
            .await;
        let (resource_id, error_code) = match &outcome {
            Ok(license) => (license.id.to_string(), None),
            Err(err) => (material_id.to_string(), Some(err.code())),
        };
        self.audit
            .record(
                ctx,
                actions::LICENSE_ISSUE,
                "license",
                &resource_id,
                user_id,
                Some(device_id),
                outcome.is_ok(),
                error_code,
            )
            .await;
        outcome
    }

    async fn issue_inner(
        &self,
        user_id: Id,
        material_id: Id,
        device_id: Id,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<License> {
        let device = lookup_active_device(self.devices.as_ref(), user_id, fingerprint).await?;
        if device.id != device_id {
            return Err(ProtectionError::DeviceFingerprintMismatch { user_id });
        }
        if !self.access.has_access(user_id, material_id).await? {
            return Err(ProtectionError::MaterialAccessDenied {
                user_id,
                material_id,
            });
        }

        if let Some(existing) = self
            .licenses
            .find_active(user_id, material_id, device_id)
            .await?
        {
            if !existing.is_expired(now) {
                debug!(license_id = %existing.id, "returning existing active license");
                return Ok(existing);
            }
            // An expired row would violate the one-active-license invariant
            // once the replacement lands, so it is retired first.
            let mut expired = existing;
            expired.status = LicenseStatus::Revoked;
            expired.revoked_at = Some(now);
            self.licenses.update(&expired).await?;
        }

        let license = License {
            id: Id::generate(),
            user_id,
            material_id,
            device_id,
            status: LicenseStatus::Active,
            expires_at: now + chrono_duration(self.limits.default_license_expiration),
            offline_grace: self.limits.default_offline_grace,
            last_validated_at: now,
            nonce: new_nonce(),
            created_at: now,
            revoked_at: None,
        };
        self.licenses.insert(license.clone()).await?;
        info!(license_id = %license.id, %user_id, %material_id, "license issued");
        self.events
            .publish(
                subjects::LICENSE_ISSUED,
                json!({
                    "license_id": license.id,
                    "user_id": user_id,
                    "material_id": material_id,
                    "device_id": device_id,
                    "expires_at": license.expires_at.to_rfc3339(),
                }),
            )
            .await;
        Ok(license)
    }

    /// Validates a license and rotates its nonce. The presented nonce must
    /// match the stored one; the rotation is a compare-and-set, so of two
    /// concurrent validations with the same nonce exactly one succeeds.
    pub async fn validate(
        &self,
        ctx: &RequestContext,
        license_id: Id,
        device_id: Id,
        fingerprint: &str,
        nonce: &str,
        now: DateTime<Utc>,
    ) -> Result<License> {
        let outcome = self
            .validate_inner(license_id, device_id, fingerprint, nonce, now)
            .await;

        if let Err(err) = &outcome {
            if counts_as_validation_failure(err.kind()) {
                if let Err(track_err) = self.failures.record_failure(device_id).await {
                    warn!(%device_id, error = %track_err, "failure tracking unavailable");
                }
            }
        }
        self.audit
            .record(
                ctx,
                actions::LICENSE_VALIDATE,
                "license",
                &license_id.to_string(),
                outcome.as_ref().map(|l| l.user_id).unwrap_or(Id::nil()),
                Some(device_id),
                outcome.is_ok(),
                outcome.as_ref().err().map(|e| e.code()),
            )
            .await;
        outcome
    }

    async fn validate_inner(
        &self,
        license_id: Id,
        device_id: Id,
        fingerprint: &str,
        nonce: &str,
        now: DateTime<Utc>,
    ) -> Result<License> {
        match self.failures.is_blocked(device_id).await {
            Ok(true) => return Err(ProtectionError::DeviceBlocked { device_id }),
            Ok(false) => {}
            Err(err) => warn!(%device_id, error = %err, "block lookup unavailable"),
        }

        let license = self.load(license_id).await?;
        self.check_binding(&license, device_id, fingerprint).await?;
        self.check_freshness(&license, now)?;

        if !ct_eq(nonce.as_bytes(), license.nonce.as_bytes()) {
            return Err(ProtectionError::InvalidNonce { license_id });
        }

        let rotated = self
            .licenses
            .rotate_nonce(license_id, &license.nonce, &new_nonce(), now)
            .await?
            .ok_or(ProtectionError::InvalidNonce { license_id })?;

        self.events
            .publish(
                subjects::LICENSE_VALIDATED,
                json!({
                    "license_id": license_id,
                    "user_id": rotated.user_id,
                    "device_id": device_id,
                }),
            )
            .await;
        Ok(rotated)
    }

    /// License validity checks for the download path: everything except the
    /// nonce, which downloads do not consume.
    pub async fn validate_for_download(
        &self,
        license_id: Id,
        device_id: Id,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<License> {
        let license = self.load(license_id).await?;
        self.check_binding(&license, device_id, fingerprint).await?;
        self.check_freshness(&license, now)?;
        Ok(license)
    }

    /// Renews a license: later expiry, fresh nonce, validation clock reset.
    /// Revoked licenses stay revoked.
    pub async fn renew(
        &self,
        ctx: &RequestContext,
        license_id: Id,
        device_id: Id,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<License> {
        let outcome = self
            .renew_inner(license_id, device_id, fingerprint, now)
            .await;
        self.audit
            .record(
                ctx,
                actions::LICENSE_RENEW,
                "license",
                &license_id.to_string(),
                outcome.as_ref().map(|l| l.user_id).unwrap_or(Id::nil()),
                Some(device_id),
                outcome.is_ok(),
                outcome.as_ref().err().map(|e| e.code()),
            )
            .await;
        outcome
    }

    async fn renew_inner(
        &self,
        license_id: Id,
        device_id: Id,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<License> {
        let mut license = self.load(license_id).await?;
        self.check_binding(&license, device_id, fingerprint).await?;
        if license.is_revoked() {
            return Err(ProtectionError::LicenseRevoked { license_id });
        }

        license.expires_at = now + chrono_duration(self.limits.default_license_expiration);
        license.nonce = new_nonce();
        license.last_validated_at = now;
        self.licenses.update(&license).await?;

        info!(%license_id, expires_at = %license.expires_at, "license renewed");
        self.events
            .publish(
                subjects::LICENSE_RENEWED,
                json!({
                    "license_id": license_id,
                    "user_id": license.user_id,
                    "expires_at": license.expires_at.to_rfc3339(),
                }),
            )
            .await;
        Ok(license)
    }

    /// Revokes one license. Idempotent: revoking a revoked license returns
    /// it unchanged.
    pub async fn revoke(
        &self,
        ctx: &RequestContext,
        license_id: Id,
        now: DateTime<Utc>,
    ) -> Result<License> {
        let outcome = self.revoke_inner(license_id, now).await;
        self.audit
            .record(
                ctx,
                actions::LICENSE_REVOKE,
                "license",
                &license_id.to_string(),
                outcome.as_ref().map(|l| l.user_id).unwrap_or(Id::nil()),
                outcome.as_ref().map(|l| l.device_id).ok(),
                outcome.is_ok(),
                outcome.as_ref().err().map(|e| e.code()),
            )
            .await;
        outcome
    }

    async fn revoke_inner(&self, license_id: Id, now: DateTime<Utc>) -> Result<License> {
        let mut license = self.load(license_id).await?;
        if license.is_revoked() {
            return Ok(license);
        }
        license.status = LicenseStatus::Revoked;
        license.revoked_at = Some(now);
        self.licenses.update(&license).await?;

        info!(%license_id, "license revoked");
        self.events
            .publish(
                subjects::LICENSE_REVOKED,
                json!({ "license_id": license_id, "user_id": license.user_id }),
            )
            .await;
        Ok(license)
    }

    /// Revokes every active license bound to a device. Returns the count.
    pub async fn revoke_by_device(&self, device_id: Id, now: DateTime<Utc>) -> Result<u32> {
        let active = self.licenses.list_active_by_device(device_id).await?;
        let revoked = self.revoke_bulk(active, now).await?;
        info!(%device_id, revoked, "licenses revoked for device");
        self.events
            .publish(
                subjects::LICENSE_REVOKED_BY_DEVICE,
                json!({ "device_id": device_id, "revoked": revoked }),
            )
            .await;
        Ok(revoked)
    }

    /// Revokes every active license for a material. Returns the count.
    pub async fn revoke_by_material(&self, material_id: Id, now: DateTime<Utc>) -> Result<u32> {
        let active = self.licenses.list_active_by_material(material_id).await?;
        let revoked = self.revoke_bulk(active, now).await?;
        info!(%material_id, revoked, "licenses revoked for material");
        self.events
            .publish(
                subjects::LICENSE_REVOKED_BY_MATERIAL,
                json!({ "material_id": material_id, "revoked": revoked }),
            )
            .await;
        Ok(revoked)
    }

    async fn revoke_bulk(&self, licenses: Vec<License>, now: DateTime<Utc>) -> Result<u32> {
        let mut revoked = 0u32;
        for mut license in licenses {
            license.status = LicenseStatus::Revoked;
            license.revoked_at = Some(now);
            self.licenses.update(&license).await?;
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn load(&self, license_id: Id) -> Result<License> {
        self.licenses
            .get(license_id)
            .await?
            .ok_or(ProtectionError::LicenseNotFound { license_id })
    }

    /// Device ownership and fingerprint binding shared by validate, renew,
    /// and the download path.
    async fn check_binding(
        &self,
        license: &License,
        device_id: Id,
        fingerprint: &str,
    ) -> Result<Device> {
        let device =
            lookup_active_device(self.devices.as_ref(), license.user_id, fingerprint).await?;
        if device.id != device_id || license.device_id != device_id {
            return Err(ProtectionError::DeviceFingerprintMismatch {
                user_id: license.user_id,
            });
        }
        Ok(device)
    }

    fn check_freshness(&self, license: &License, now: DateTime<Utc>) -> Result<()> {
        if license.is_revoked() {
            return Err(ProtectionError::LicenseRevoked {
                license_id: license.id,
            });
        }
        if license.is_expired(now) {
            return Err(ProtectionError::LicenseExpired {
                license_id: license.id,
            });
        }
        if license.is_offline_expired(now) {
            return Err(ProtectionError::LicenseOfflineExpired {
                license_id: license.id,
            });
        }
        Ok(())
    }
}

/// 32 random bytes, hex-encoded to 64 chars.
fn new_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn counts_as_validation_failure(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::DeviceNotFound
            | ErrorKind::DeviceFingerprintMismatch
            | ErrorKind::LicenseNotFound
            | ErrorKind::LicenseExpired
            | ErrorKind::LicenseRevoked
            | ErrorKind::LicenseOfflineExpired
            | ErrorKind::InvalidNonce
    )
}
