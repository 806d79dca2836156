//! Composed request gate: signature verification followed by replay
//! protection. Wraps every request entry point of the subsystem.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use ngasihtau_core::config::ProtectionConfig;
use ngasihtau_core::error::Result;
use ngasihtau_core::kv::Kv;

use crate::replay::ReplayGuard;
use crate::signature::{parse_signature_header, SignatureVerifier};

/// A request that passed the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedRequest {
    /// Client-asserted request time, unix seconds.
    pub timestamp: i64,
    /// The request nonce, now consumed.
    pub nonce: String,
}

/// Snapshot of gate counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateStats {
    /// Requests that passed every check.
    pub passed: u64,
    /// Requests rejected by any check.
    pub rejected: u64,
}

/// Verifies the signature header, timestamp window, and nonce uniqueness of
/// incoming requests.
pub struct SecurityGate {
    verifier: SignatureVerifier,
    replay: ReplayGuard,
    passed: AtomicU64,
    rejected: AtomicU64,
}

impl SecurityGate {
    /// Builds a gate from the process config and the shared KV store.
    pub fn new(config: &ProtectionConfig, kv: Arc<dyn Kv>) -> Self {
        Self {
            verifier: SignatureVerifier::new(config),
            replay: ReplayGuard::new(kv, config.limits.replay_window),
            passed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Full request check. The nonce is recorded only after the signature
    /// verifies, so unauthenticated callers cannot burn nonces.
    pub async fn check_request(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        signature_header: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifiedRequest> {
        let outcome = async {
            let parts = parse_signature_header(signature_header)?;
            self.verifier.verify(method, path, body, &parts, now)?;
            self.replay.register_nonce(&parts.nonce).await?;
            Ok(VerifiedRequest {
                timestamp: parts.timestamp,
                nonce: parts.nonce,
            })
        }
        .await;

        match &outcome {
            Ok(_) => self.passed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.rejected.fetch_add(1, Ordering::Relaxed),
        };
        outcome
    }

    /// The signature verifier, for producing valid headers in tests/clients.
    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    /// Counter snapshot.
    pub fn stats(&self) -> GateStats {
        GateStats {
            passed: self.passed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ngasihtau_core::error::ErrorKind;
    use ngasihtau_core::kv::InMemoryKv;
    use std::time::Duration;

    fn gate_with_kv() -> (SecurityGate, Arc<InMemoryKv>, ProtectionConfig) {
        let config = ProtectionConfig::for_testing();
        let kv = Arc::new(InMemoryKv::new());
        (SecurityGate::new(&config, kv.clone()), kv, config)
    }

    fn header(gate: &SecurityGate, method: &str, path: &str, body: &[u8], t: i64, nonce: &str) -> String {
        let sig = gate.verifier().compute(method, path, t, nonce, body).unwrap();
        format!("t={t},n={nonce},s={sig}")
    }

    #[tokio::test]
    async fn test_fresh_request_passes_once() {
        let (gate, _kv, _config) = gate_with_kv();
        let now = Utc::now();
        let h = header(&gate, "POST", "/v1/validate", b"{}", now.timestamp(), "n-1");

        let verified = gate
            .check_request("POST", "/v1/validate", b"{}", &h, now)
            .await
            .unwrap();
        assert_eq!(verified.nonce, "n-1");

        // The exact same request inside the window is a replay.
        let err = gate
            .check_request("POST", "/v1/validate", b"{}", &h, now)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReplayAttack);
    }

    #[tokio::test]
    async fn test_nonce_expires_with_window() {
        let (gate, kv, _config) = gate_with_kv();
        let now = Utc::now();
        let h = header(&gate, "GET", "/p", b"", now.timestamp(), "n-1");
        gate.check_request("GET", "/p", b"", &h, now).await.unwrap();

        kv.advance(Duration::from_secs(301));
        // The nonce record expired, but the old timestamp is now stale too:
        // only a freshly signed request with the same nonce passes.
        let stale = gate.check_request("GET", "/p", b"", &h, now + chrono::Duration::seconds(301)).await;
        assert!(stale.is_err());

        let later = now + chrono::Duration::seconds(301);
        let fresh = header(&gate, "GET", "/p", b"", later.timestamp(), "n-1");
        gate.check_request("GET", "/p", b"", &fresh, later)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_signature_does_not_burn_nonce() {
        let (gate, _kv, _config) = gate_with_kv();
        let now = Utc::now();
        let bad = format!("t={},n=n-1,s=AAAA", now.timestamp());
        assert!(gate.check_request("GET", "/p", b"", &bad, now).await.is_err());

        // The nonce stayed unused: a properly signed request with it passes.
        let good = header(&gate, "GET", "/p", b"", now.timestamp(), "n-1");
        gate.check_request("GET", "/p", b"", &good, now).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_header_rejected() {
        let (gate, _kv, _config) = gate_with_kv();
        let err = gate
            .check_request("GET", "/p", b"", "garbage", Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    }

    #[tokio::test]
    async fn test_stats() {
        let (gate, _kv, _config) = gate_with_kv();
        let now = Utc::now();
        let h = header(&gate, "GET", "/p", b"", now.timestamp(), "n-1");
        gate.check_request("GET", "/p", b"", &h, now).await.unwrap();
        let _ = gate.check_request("GET", "/p", b"", "bad", now).await;
        let stats = gate.stats();
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.rejected, 1);
    }
}
