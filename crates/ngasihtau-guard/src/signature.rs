//! HMAC-SHA256 request signatures over a canonical signing string.
//!
//! Canonical form: `METHOD "|" PATH "|" TIMESTAMP "|" NONCE "|" hex(sha256(body))`.
//! The signature header carries `t=<unix-seconds>,n=<nonce>,s=<base64-hmac>`.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use ngasihtau_core::config::{ProtectionConfig, SecretBytes};
use ngasihtau_core::error::{ProtectionError, Result};
use ngasihtau_crypto::primitives::{ct_eq, sha256_hex};

type HmacSha256 = Hmac<Sha256>;

/// Parsed components of a signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureParts {
    /// Client-asserted request time, unix seconds.
    pub timestamp: i64,
    /// Per-request nonce.
    pub nonce: String,
    /// Base64 HMAC-SHA256 over the canonical string.
    pub signature: String,
}

/// Parses `t=<int>,n=<str>,s=<str>`. Missing parts or a non-integer `t`
/// reject as [`ProtectionError::InvalidSignature`].
pub fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut nonce = None;
    let mut signature = None;

    for part in header.split(',') {
        match part.split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse::<i64>().map_err(|_| {
                    ProtectionError::InvalidSignature {
                        reason: "non-integer timestamp".to_string(),
                    }
                })?);
            }
            Some(("n", value)) if !value.is_empty() => nonce = Some(value.to_string()),
            // Base64 padding may itself contain '='; only the first one splits.
            Some(("s", value)) if !value.is_empty() => signature = Some(value.to_string()),
            _ => {}
        }
    }

    match (timestamp, nonce, signature) {
        (Some(timestamp), Some(nonce), Some(signature)) => Ok(SignatureParts {
            timestamp,
            nonce,
            signature,
        }),
        _ => Err(ProtectionError::InvalidSignature {
            reason: "header is missing t, n, or s".to_string(),
        }),
    }
}

/// Verifies request signatures and timestamp windows.
pub struct SignatureVerifier {
    secret: SecretBytes,
    replay_window: Duration,
    clock_skew: Duration,
}

impl SignatureVerifier {
    /// Builds a verifier from the process config.
    pub fn new(config: &ProtectionConfig) -> Self {
        Self {
            secret: config.signing_secret.clone(),
            replay_window: config.limits.replay_window,
            clock_skew: config.limits.clock_skew_allowance,
        }
    }

    /// The canonical signing string for a request.
    pub fn canonical_string(
        method: &str,
        path: &str,
        timestamp: i64,
        nonce: &str,
        body: &[u8],
    ) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            method.to_uppercase(),
            path,
            timestamp,
            nonce,
            sha256_hex(body)
        )
    }

    /// Computes the expected signature for a request. Used by clients and
    /// tests to produce valid headers.
    pub fn compute(
        &self,
        method: &str,
        path: &str,
        timestamp: i64,
        nonce: &str,
        body: &[u8],
    ) -> Result<String> {
        let canonical = Self::canonical_string(method, path, timestamp, nonce, body);
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| {
            ProtectionError::InternalError {
                reason: "signing secret rejected by HMAC".to_string(),
            }
        })?;
        mac.update(canonical.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Rejects timestamps older than the replay window or further in the
    /// future than the clock-skew allowance.
    pub fn check_timestamp(&self, timestamp: i64, now: DateTime<Utc>) -> Result<()> {
        let age = now.timestamp() - timestamp;
        if age > self.replay_window.as_secs() as i64 {
            return Err(ProtectionError::ReplayAttack);
        }
        if age < -(self.clock_skew.as_secs() as i64) {
            return Err(ProtectionError::ReplayAttack);
        }
        Ok(())
    }

    /// Full check: timestamp window, then constant-time signature compare.
    pub fn verify(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        parts: &SignatureParts,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_timestamp(parts.timestamp, now)?;
        let expected = self.compute(method, path, parts.timestamp, &parts.nonce, body)?;
        if !ct_eq(expected.as_bytes(), parts.signature.as_bytes()) {
            return Err(ProtectionError::InvalidSignature {
                reason: "signature mismatch".to_string(),
            });
        }
        Ok(())
    }
}
