//! License lifecycle scenarios over the wired-up stack.

use chrono::Utc;

use ngasihtau_core::audit::RequestContext;
use ngasihtau_core::error::ErrorKind;
use ngasihtau_core::id::Id;
use ngasihtau_core::repo::{CekRepository, LicenseRepository};

use crate::harness::{TestStack, FINGERPRINT};

#[tokio::test]
async fn test_validate_rotates_and_invalidates_old_nonce() {
    let stack = TestStack::new();
    let ctx = RequestContext::system();
    let user = Id::generate();
    let material = Id::generate();
    let device = stack.register_device(user).await;
    let license = stack.issue_license(user, material, device.id).await;
    let now = Utc::now();

    let first_nonce = license.nonce.clone();
    let rotated = stack
        .engine
        .validate(&ctx, license.id, device.id, FINGERPRINT, &first_nonce, now)
        .await
        .unwrap();

    // The consumed nonce is dead; the rotated one validates and rotates
    // again.
    let err = stack
        .engine
        .validate(&ctx, license.id, device.id, FINGERPRINT, &first_nonce, now)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidNonce);

    let second = stack
        .engine
        .validate(&ctx, license.id, device.id, FINGERPRINT, &rotated.nonce, now)
        .await
        .unwrap();
    assert_ne!(second.nonce, rotated.nonce);
    assert_ne!(second.nonce, first_nonce);
}

#[tokio::test]
async fn test_device_deregistration_cascade() {
    let stack = TestStack::new();
    let ctx = RequestContext::system();
    let user = Id::generate();
    let device = stack.register_device(user).await;
    let now = Utc::now();

    // Three licensed materials, each with a stored CEK.
    for _ in 0..3 {
        let material = Id::generate();
        stack.issue_license(user, material, device.id).await;
        stack
            .keys
            .get_or_create_cek(&ctx, user, material, device.id)
            .await
            .unwrap();
    }
    assert_eq!(stack.cek_repo.len(), 3);

    stack
        .registry
        .deregister(&ctx, user, device.id, now)
        .await
        .unwrap();

    // Every license on the device is revoked.
    assert!(stack
        .license_repo
        .list_active_by_device(device.id)
        .await
        .unwrap()
        .is_empty());
    // Every CEK for the device is gone.
    assert!(stack
        .cek_repo
        .find(user, Id::generate(), device.id)
        .await
        .unwrap()
        .is_none());
    assert!(stack.cek_repo.is_empty());

    // A fresh license request for the same (user, device) fails on the
    // revoked device.
    let err = stack
        .engine
        .issue(&ctx, user, Id::generate(), device.id, FINGERPRINT, now)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
}

#[tokio::test]
async fn test_renewal_is_strictly_monotonic() {
    let stack = TestStack::new();
    let ctx = RequestContext::system();
    let user = Id::generate();
    let device = stack.register_device(user).await;
    let license = stack.issue_license(user, Id::generate(), device.id).await;

    let mut previous = license.expires_at;
    let mut at = Utc::now();
    for _ in 0..3 {
        at += chrono::Duration::days(1);
        let renewed = stack
            .engine
            .renew(&ctx, license.id, device.id, FINGERPRINT, at)
            .await
            .unwrap();
        assert!(renewed.expires_at > previous);
        previous = renewed.expires_at;
    }
}

#[tokio::test]
async fn test_sixth_device_is_refused() {
    let stack = TestStack::new();
    let ctx = RequestContext::system();
    let user = Id::generate();

    for i in 0..5u8 {
        stack
            .registry
            .register(
                &ctx,
                user,
                &format!("{:02x}", i).repeat(16),
                "device",
                ngasihtau_core::model::Platform::Android,
                Utc::now(),
            )
            .await
            .unwrap();
    }
    let err = stack
        .registry
        .register(
            &ctx,
            user,
            &"ff".repeat(16),
            "one too many",
            ngasihtau_core::model::Platform::Android,
            Utc::now(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceLimitExceeded);
}

#[tokio::test]
async fn test_audit_trail_covers_lifecycle() {
    let stack = TestStack::new();
    let ctx = RequestContext::new("203.0.113.7", "integration/1.0");
    let user = Id::generate();
    let now = Utc::now();

    let device = stack
        .registry
        .register(
            &ctx,
            user,
            FINGERPRINT,
            "audited device",
            ngasihtau_core::model::Platform::Ios,
            now,
        )
        .await
        .unwrap();
    let license = stack
        .engine
        .issue(&ctx, user, Id::generate(), device.id, FINGERPRINT, now)
        .await
        .unwrap();
    stack
        .engine
        .validate(&ctx, license.id, device.id, FINGERPRINT, &license.nonce, now)
        .await
        .unwrap();

    let actions: Vec<String> = stack
        .audit_repo
        .entries()
        .iter()
        .map(|e| e.action.clone())
        .collect();
    assert!(actions.contains(&"device.register".to_string()));
    assert!(actions.contains(&"license.issue".to_string()));
    assert!(actions.contains(&"license.validate".to_string()));
    assert!(stack
        .audit_repo
        .entries()
        .iter()
        .all(|e| e.ip == "203.0.113.7"));
}
