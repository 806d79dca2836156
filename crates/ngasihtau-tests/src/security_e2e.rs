//! Security-perimeter scenarios: replay windows, rate-limit boundaries,
//! device blocking, and sanitizer guarantees over the wired-up stack.

use std::time::Duration;

use chrono::Utc;

use ngasihtau_core::audit::RequestContext;
use ngasihtau_core::error::ErrorKind;
use ngasihtau_core::id::Id;

use crate::harness::{TestStack, FINGERPRINT};

fn signed_header(stack: &TestStack, method: &str, path: &str, body: &[u8], t: i64, nonce: &str) -> String {
    let sig = stack
        .gate
        .verifier()
        .compute(method, path, t, nonce, body)
        .unwrap();
    format!("t={t},n={nonce},s={sig}")
}

#[tokio::test]
async fn test_replay_window_full_cycle() {
    let stack = TestStack::new();
    let now = Utc::now();
    let header = signed_header(&stack, "POST", "/v1/licenses/validate", b"{}", now.timestamp(), "req-nonce-1");

    // First presentation passes.
    stack
        .gate
        .check_request("POST", "/v1/licenses/validate", b"{}", &header, now)
        .await
        .unwrap();

    // Same request inside the window: replay.
    let err = stack
        .gate
        .check_request("POST", "/v1/licenses/validate", b"{}", &header, now)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReplayAttack);

    // After the nonce record expires, the same nonce passes again when the
    // request is freshly signed.
    stack.kv.advance(Duration::from_secs(301));
    let later = now + chrono::Duration::seconds(301);
    let fresh = signed_header(&stack, "POST", "/v1/licenses/validate", b"{}", later.timestamp(), "req-nonce-1");
    stack
        .gate
        .check_request("POST", "/v1/licenses/validate", b"{}", &fresh, later)
        .await
        .unwrap();

    // The stale original timestamp stays dead even with an expired nonce.
    stack.kv.advance(Duration::from_secs(301));
    let much_later = later + chrono::Duration::seconds(301);
    let err = stack
        .gate
        .check_request("POST", "/v1/licenses/validate", b"{}", &header, much_later)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReplayAttack);
}

#[tokio::test]
async fn test_download_rate_limit_boundary() {
    let stack = TestStack::new();
    let ctx = RequestContext::system();
    let user = Id::generate();
    let material = Id::generate();
    let device = stack.register_device(user).await;
    let license = stack.issue_license(user, material, device.id).await;
    stack.seed_source(material, vec![1u8; 256]).await;

    let job = stack
        .jobs
        .create_job(
            material,
            user,
            device.id,
            license.id,
            ngasihtau_core::model::JobPriority::Normal,
        )
        .await
        .unwrap();
    stack.jobs.run_job(job.id).await.unwrap();

    for _ in 0..10 {
        stack
            .coordinator
            .prepare_download(&ctx, user, material, device.id, license.id, FINGERPRINT, Utc::now())
            .await
            .unwrap();
    }
    let err = stack
        .coordinator
        .prepare_download(&ctx, user, material, device.id, license.id, FINGERPRINT, Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
    assert_eq!(err.sanitize().status, 429);

    // A different user is unaffected by the exhausted window.
    let other = Id::generate();
    let other_device = stack.register_device(other).await;
    let other_license = stack.issue_license(other, material, other_device.id).await;
    stack
        .coordinator
        .prepare_download(
            &ctx,
            other,
            material,
            other_device.id,
            other_license.id,
            FINGERPRINT,
            Utc::now(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_device_blocking_and_unblock() {
    let stack = TestStack::new();
    let ctx = RequestContext::system();
    let user = Id::generate();
    let device = stack.register_device(user).await;
    let license = stack.issue_license(user, Id::generate(), device.id).await;
    let now = Utc::now();

    for _ in 0..5 {
        stack
            .engine
            .validate(&ctx, license.id, device.id, FINGERPRINT, "bogus-nonce", now)
            .await
            .unwrap_err();
    }
    assert!(stack.tracker.is_blocked(device.id).await.unwrap());

    let err = stack
        .engine
        .validate(&ctx, license.id, device.id, FINGERPRINT, &license.nonce, now)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceBlocked);

    // Manual unblock clears both the block and the counter; validation with
    // the real nonce works again.
    stack.tracker.unblock(device.id).await.unwrap();
    stack
        .engine
        .validate(&ctx, license.id, device.id, FINGERPRINT, &license.nonce, now)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_sanitizer_leaks_no_identifiers() {
    let stack = TestStack::new();
    let ctx = RequestContext::system();
    let user = Id::generate();
    let device = stack.register_device(user).await;
    let license = stack.issue_license(user, Id::generate(), device.id).await;

    let failures = vec![
        stack
            .engine
            .validate(&ctx, license.id, device.id, FINGERPRINT, "wrong", Utc::now())
            .await
            .unwrap_err(),
        stack
            .engine
            .validate(&ctx, Id::generate(), device.id, FINGERPRINT, "n", Utc::now())
            .await
            .unwrap_err(),
        stack
            .registry
            .validate(user, "unregistered-fingerprint-value!!")
            .await
            .unwrap_err(),
    ];

    let ids = [
        user.to_string(),
        device.id.to_string(),
        license.id.to_string(),
    ];
    for err in failures {
        let external = err.sanitize();
        for id in &ids {
            assert!(
                !external.message.contains(id.as_str()),
                "sanitized message leaked an id: {}",
                external.message
            );
        }
        assert!(!external.message.contains("::"));
        assert!(!external.message.contains("Error"));
    }
}
